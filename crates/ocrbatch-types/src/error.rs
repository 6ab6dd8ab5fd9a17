//! Failure classification and failure-log rows.
//!
//! [`ErrorKind`] is the closed taxonomy every non-success outcome maps
//! to; [`FailureLogRow`] is the append-only diagnostic record persisted
//! alongside each failure-count bump.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a record or batch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Model output could not be parsed as JSON.
    JsonDecodeError,
    /// Parsed JSON did not match the catalog-page schema.
    SchemaValidationError,
    /// Result record carried no response body.
    MissingResponse,
    /// The inference service reported a per-record error.
    ServiceError,
    /// An expected key was absent from the downloaded result set.
    MissingInResult,
    /// A downloaded result carried a key we did not submit.
    ResultKeyMismatch,
    /// The batch as a whole ended `failed`, `cancelled`, or `expired`.
    BatchTerminalFailure,
    /// The bundle upload or job creation itself failed.
    SubmissionFailure,
    /// Anything that does not fit the categories above.
    Other,
}

impl ErrorKind {
    /// Wire-format string for storage and log grouping.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JsonDecodeError => "json_decode_error",
            Self::SchemaValidationError => "schema_validation_error",
            Self::MissingResponse => "missing_response",
            Self::ServiceError => "service_error",
            Self::MissingInResult => "missing_in_result",
            Self::ResultKeyMismatch => "result_key_mismatch",
            Self::BatchTerminalFailure => "batch_terminal_failure",
            Self::SubmissionFailure => "submission_failure",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only failure-log entry.
///
/// Raw and extracted payloads are preserved verbatim for offline
/// analysis; everything between raw text and validated artifact is an
/// opaque string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureLogRow {
    pub record_key: String,
    pub batch_id: String,
    pub attempt_number: i64,
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response_blob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<String>,
}

impl FailureLogRow {
    /// Minimal row with the mandatory identity fields.
    #[must_use]
    pub fn new(
        record_key: impl Into<String>,
        batch_id: impl Into<String>,
        attempt_number: i64,
        kind: ErrorKind,
    ) -> Self {
        Self {
            record_key: record_key.into(),
            batch_id: batch_id.into(),
            attempt_number,
            error_kind: Some(kind.as_str().to_string()),
            ..Self::default()
        }
    }

    /// Attach a human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Attach raw and extracted payloads for offline analysis.
    #[must_use]
    pub fn with_payloads(
        mut self,
        raw_text: Option<String>,
        extracted: Option<String>,
        raw_blob: Option<String>,
    ) -> Self {
        self.raw_response_text = raw_text;
        self.extracted_text = extracted;
        self.raw_response_blob = raw_blob;
        self
    }

    /// Attach model and prompt provenance.
    #[must_use]
    pub fn with_provenance(
        mut self,
        model_name: impl Into<String>,
        prompt_name: impl Into<String>,
        prompt_template: impl Into<String>,
        generation_config: Option<String>,
    ) -> Self {
        self.model_name = Some(model_name.into());
        self.prompt_name = Some(prompt_name.into());
        self.prompt_template = Some(prompt_template.into());
        self.generation_config = generation_config;
        self
    }
}

//! Per-record results flowing back from the remote service.

use serde::{Deserialize, Serialize};

/// One record from a downloaded result set, before ingestion.
///
/// `response` and `error` are mutually exclusive in practice; a record
/// carrying neither is classified as a missing response during
/// ingestion. Both bodies stay opaque JSON until validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResult {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl RecordResult {
    /// A successful response body for `key`.
    #[must_use]
    pub fn ok(key: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            response: Some(response),
            error: None,
        }
    }

    /// A per-record service error for `key`.
    #[must_use]
    pub fn service_error(key: impl Into<String>, error: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            response: None,
            error: Some(error),
        }
    }
}

/// Outcome of ingesting one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecordOutcome {
    #[must_use]
    pub fn success(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_result_constructors() {
        let ok = RecordResult::ok("A:B:2020:1", serde_json::json!({"candidates": []}));
        assert!(ok.response.is_some());
        assert!(ok.error.is_none());

        let err = RecordResult::service_error("A:B:2020:2", serde_json::json!({"code": 500}));
        assert!(err.response.is_none());
        assert!(err.error.is_some());
    }

    #[test]
    fn record_result_jsonl_shape() {
        let line = r#"{"key":"A:B:2020:1","response":{"candidates":[]}}"#;
        let parsed: RecordResult = serde_json::from_str(line).unwrap();
        assert_eq!(parsed.key, "A:B:2020:1");
        assert!(parsed.response.is_some());
    }

    #[test]
    fn outcome_constructors() {
        assert!(RecordOutcome::success("k").success);
        let failed = RecordOutcome::failure("k", "boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}

//! Remote batch-inference gateway contract.
//!
//! The orchestrator only ever sees the three-operation [`BatchGateway`]
//! seam: submit a bundle, poll a job, download its per-record results.
//! The HTTP implementation lives in [`http`]; tests substitute their
//! own implementations.

pub mod http;

use std::path::PathBuf;

use async_trait::async_trait;

use ocrbatch_types::{BatchId, JobState, RecordResult};

/// One record handed to the gateway for submission.
///
/// The prompt is fully rendered; the image is still a local path
/// because uploading it is the gateway's concern.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPayload {
    pub key: String,
    pub prompt: String,
    pub image_path: PathBuf,
    pub generation_config: Option<serde_json::Value>,
}

/// Outcome of a successful bundle submission.
///
/// `record_keys` is the subset of payload keys that made it into the
/// remote job; `failed_uploads` are keys whose image upload exhausted
/// its retries and were left out of the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub batch_id: BatchId,
    pub record_keys: Vec<String>,
    pub failed_uploads: Vec<(String, String)>,
}

/// Errors crossing the gateway seam.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Recoverable by retrying: network timeouts, 5xx, rate limits.
    #[error("transient gateway error: {0}")]
    Transient(#[source] anyhow::Error),

    /// Not worth retrying: bad credentials, malformed request, 4xx.
    #[error("gateway error: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl GatewayError {
    /// True when a bounded retry with backoff may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The remote batch-inference service, reduced to the three operations
/// the orchestrator consumes.
#[async_trait]
pub trait BatchGateway: Send + Sync {
    /// Upload the bundle and create a remote batch job.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Transient`] for recoverable upload/create
    /// failures, [`GatewayError::Permanent`] otherwise. Either way no
    /// remote job exists that the caller needs to track.
    async fn submit(
        &self,
        display_name: &str,
        payloads: Vec<RecordPayload>,
    ) -> Result<Submission, GatewayError>;

    /// Current state of a remote job.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when the poll request fails; the job
    /// itself is unaffected.
    async fn poll(&self, batch_id: &BatchId) -> Result<JobState, GatewayError>;

    /// Download the per-record results of a terminal-success job.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when the result file cannot be fetched
    /// or parsed.
    async fn download(&self, batch_id: &BatchId) -> Result<Vec<RecordResult>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_error_transience() {
        assert!(GatewayError::Transient(anyhow::anyhow!("timeout")).is_transient());
        assert!(!GatewayError::Permanent(anyhow::anyhow!("401")).is_transient());
    }

    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn BatchGateway) {}
    }
}

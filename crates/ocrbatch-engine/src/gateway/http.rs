//! Gemini batch API implementation of [`BatchGateway`].
//!
//! Talks to the generative-language REST surface: raw media uploads
//! through the file API, `batchGenerateContent` job creation, job-state
//! polling, and result-file download. Every network call is bounded by
//! the configured request timeout; uploads retry with exponential
//! backoff.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::task::JoinSet;

use ocrbatch_types::{BatchId, JobState, RecordResult};

use crate::gateway::{BatchGateway, GatewayError, RecordPayload, Submission};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const BACKOFF_MAX_SECONDS: f64 = 60.0;

/// Retry/backoff knobs for gateway I/O.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_seconds: f64,
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));
        Duration::from_secs_f64((self.backoff_seconds * factor).min(BACKOFF_MAX_SECONDS))
    }
}

/// Gemini batch gateway over reqwest.
pub struct GeminiBatchGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
    upload_concurrency: usize,
}

impl GeminiBatchGateway {
    /// Build a gateway client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
        upload_concurrency: usize,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            retry,
            upload_concurrency: upload_concurrency.max(1),
        })
    }

    /// Point the gateway at a different API host (tests, proxies).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Upload raw bytes through the file API, returning the file
    /// resource `(name, uri)`.
    async fn upload_bytes(
        &self,
        bytes: Vec<u8>,
        display_name: &str,
        mime_type: &str,
    ) -> Result<(String, String), GatewayError> {
        let url = format!("{}/upload/v1beta/files?key={}", self.base_url, self.api_key);
        let response = self
            .http
            .post(&url)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("X-Goog-File-Name", display_name)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await
            .map_err(request_error)?;
        let body: serde_json::Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Permanent(anyhow!("decoding upload response: {e}")))?;

        let file = body.get("file").unwrap_or(&body);
        let name = file
            .get("name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| GatewayError::Permanent(anyhow!("upload response missing file name")))?
            .to_string();
        let uri = file
            .get("uri")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(name.as_str())
            .to_string();
        Ok((name, uri))
    }

    /// Upload with the configured retry policy.
    async fn upload_with_retries(
        &self,
        bytes: Vec<u8>,
        display_name: &str,
        mime_type: &str,
    ) -> Result<(String, String), GatewayError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.upload_bytes(bytes.clone(), display_name, mime_type).await {
                Ok(uploaded) => return Ok(uploaded),
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        display_name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Upload failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Upload every payload's image concurrently, bounded by
    /// `upload_concurrency`. Returns `(key, uri)` successes and
    /// `(key, error)` failures.
    async fn upload_images(
        &self,
        payloads: &[RecordPayload],
    ) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.upload_concurrency));
        let mut join_set: JoinSet<(String, Result<(String, String), String>)> = JoinSet::new();

        for payload in payloads {
            let gateway = self.clone_for_tasks();
            let semaphore = Arc::clone(&semaphore);
            let key = payload.key.clone();
            let path = payload.image_path.clone();
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (key, Err("upload semaphore closed".to_string()));
                };
                let result = gateway.upload_image_file(&path).await;
                (key, result.map_err(|e| e.to_string()))
            });
        }

        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((key, Ok(named))) => uploaded.push((key, named.1)),
                Ok((key, Err(message))) => failed.push((key, message)),
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Image upload task panicked");
                }
            }
        }
        (uploaded, failed)
    }

    async fn upload_image_file(&self, path: &Path) -> Result<(String, String), GatewayError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            GatewayError::Permanent(anyhow!("reading image {}: {e}", path.display()))
        })?;
        let display_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("page.jpg");
        self.upload_with_retries(bytes, display_name, guess_mime_type(path))
            .await
    }

    fn wire_request(payload: &RecordPayload, image_uri: &str) -> serde_json::Value {
        let mut request = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": payload.prompt },
                    { "file_data": { "file_uri": image_uri, "mime_type": guess_mime_type(&payload.image_path) } },
                ]
            }]
        });
        if let Some(generation) = &payload.generation_config {
            request["generation_config"] = generation.clone();
        }
        request
    }

    async fn create_batch_job(
        &self,
        display_name: &str,
        src_file_name: &str,
    ) -> Result<BatchId, GatewayError> {
        let url = format!(
            "{}/v1beta/models/{}:batchGenerateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = serde_json::json!({
            "batch": {
                "display_name": display_name,
                "input_config": { "file_name": src_file_name },
            }
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = async {
                let response = self
                    .http
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(request_error)?;
                let body: serde_json::Value = check_status(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| GatewayError::Permanent(anyhow!("decoding job response: {e}")))?;
                body.get("name")
                    .and_then(serde_json::Value::as_str)
                    .map(BatchId::new)
                    .ok_or_else(|| {
                        GatewayError::Permanent(anyhow!("job response missing batch name"))
                    })
            }
            .await;

            match result {
                Ok(id) => return Ok(id),
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl BatchGateway for GeminiBatchGateway {
    async fn submit(
        &self,
        display_name: &str,
        payloads: Vec<RecordPayload>,
    ) -> Result<Submission, GatewayError> {
        let (uploaded, failed_uploads) = self.upload_images(&payloads).await;
        if uploaded.is_empty() {
            return Err(GatewayError::Permanent(anyhow!(
                "no payloads ready after image upload failures ({} failed)",
                failed_uploads.len()
            )));
        }

        let uri_by_key: std::collections::BTreeMap<&str, &str> = uploaded
            .iter()
            .map(|(key, uri)| (key.as_str(), uri.as_str()))
            .collect();

        let mut record_keys = Vec::new();
        let mut jsonl = String::new();
        for payload in &payloads {
            let Some(uri) = uri_by_key.get(payload.key.as_str()) else {
                continue;
            };
            let line = serde_json::json!({
                "key": payload.key,
                "request": Self::wire_request(payload, uri),
            });
            jsonl.push_str(&line.to_string());
            jsonl.push('\n');
            record_keys.push(payload.key.clone());
        }

        let (src_file_name, _uri) = self
            .upload_with_retries(
                jsonl.into_bytes(),
                &format!("{display_name}-requests"),
                "application/jsonl",
            )
            .await?;
        let batch_id = self.create_batch_job(display_name, &src_file_name).await?;

        Ok(Submission {
            batch_id,
            record_keys,
            failed_uploads,
        })
    }

    async fn poll(&self, batch_id: &BatchId) -> Result<JobState, GatewayError> {
        let url = format!(
            "{}/v1beta/{}?key={}",
            self.base_url,
            batch_id.as_str(),
            self.api_key
        );
        let response = self.http.get(&url).send().await.map_err(request_error)?;
        let body: serde_json::Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Permanent(anyhow!("decoding poll response: {e}")))?;
        let raw_state = body
            .get("state")
            .and_then(serde_json::Value::as_str)
            .or_else(|| {
                body.get("metadata")
                    .and_then(|m| m.get("state"))
                    .and_then(serde_json::Value::as_str)
            })
            .unwrap_or("JOB_STATE_PENDING");
        Ok(parse_job_state(raw_state))
    }

    async fn download(&self, batch_id: &BatchId) -> Result<Vec<RecordResult>, GatewayError> {
        // The terminal job carries the result file resource name.
        let url = format!(
            "{}/v1beta/{}?key={}",
            self.base_url,
            batch_id.as_str(),
            self.api_key
        );
        let response = self.http.get(&url).send().await.map_err(request_error)?;
        let body: serde_json::Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Permanent(anyhow!("decoding job response: {e}")))?;
        let result_file = body
            .get("dest")
            .and_then(|d| d.get("file_name"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                GatewayError::Permanent(anyhow!(
                    "batch {} has no result file",
                    batch_id.as_str()
                ))
            })?;

        let download_url = format!(
            "{}/v1beta/{}:download?alt=media&key={}",
            self.base_url, result_file, self.api_key
        );
        let response = self
            .http
            .get(&download_url)
            .send()
            .await
            .map_err(request_error)?;
        let bytes = check_status(response)
            .await?
            .bytes()
            .await
            .map_err(|e| GatewayError::Transient(anyhow!("downloading result file: {e}")))?;

        parse_results_jsonl(&bytes)
            .map_err(|e| GatewayError::Permanent(anyhow!("parsing result JSONL: {e}")))
    }
}

impl GeminiBatchGateway {
    /// Cheap clone for spawned upload tasks (reqwest clients are
    /// internally reference-counted).
    fn clone_for_tasks(&self) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            retry: self.retry,
            upload_concurrency: self.upload_concurrency,
        }
    }
}

/// Parse a downloaded result file: one JSON record per line.
pub(crate) fn parse_results_jsonl(bytes: &[u8]) -> anyhow::Result<Vec<RecordResult>> {
    let text = std::str::from_utf8(bytes).context("result file is not UTF-8")?;
    let mut results = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: RecordResult =
            serde_json::from_str(line).with_context(|| format!("bad result line: {line}"))?;
        results.push(record);
    }
    Ok(results)
}

/// Map the service's `JOB_STATE_*` strings onto [`JobState`].
pub(crate) fn parse_job_state(raw: &str) -> JobState {
    match raw {
        "JOB_STATE_PENDING" | "JOB_STATE_QUEUED" => JobState::Pending,
        "JOB_STATE_RUNNING" | "JOB_STATE_PROCESSING" => JobState::Running,
        "JOB_STATE_SUCCEEDED" => JobState::Succeeded,
        "JOB_STATE_PARTIALLY_SUCCEEDED" => JobState::PartiallySucceeded,
        "JOB_STATE_FAILED" => JobState::Failed,
        "JOB_STATE_CANCELLED" => JobState::Cancelled,
        "JOB_STATE_EXPIRED" => JobState::Expired,
        other => {
            tracing::warn!(state = other, "Unknown job state, treating as running");
            JobState::Running
        }
    }
}

fn guess_mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("json" | "jsonl") => "application/jsonl",
        _ => "application/octet-stream",
    }
}

fn request_error(err: reqwest::Error) -> GatewayError {
    // Connection-level and timeout failures are worth retrying.
    GatewayError::Transient(anyhow!("request failed: {err}"))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let err = anyhow!("service returned {status}: {body}");
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(GatewayError::Transient(err))
    } else {
        Err(GatewayError::Permanent(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            attempts: 5,
            backoff_seconds: 2.0,
        };
        assert_eq!(retry.backoff(1), Duration::from_secs_f64(2.0));
        assert_eq!(retry.backoff(2), Duration::from_secs_f64(4.0));
        assert_eq!(retry.backoff(3), Duration::from_secs_f64(8.0));
        assert_eq!(retry.backoff(20), Duration::from_secs_f64(60.0));
    }

    #[test]
    fn job_state_mapping() {
        assert_eq!(parse_job_state("JOB_STATE_PENDING"), JobState::Pending);
        assert_eq!(parse_job_state("JOB_STATE_RUNNING"), JobState::Running);
        assert_eq!(parse_job_state("JOB_STATE_SUCCEEDED"), JobState::Succeeded);
        assert_eq!(
            parse_job_state("JOB_STATE_PARTIALLY_SUCCEEDED"),
            JobState::PartiallySucceeded
        );
        assert_eq!(parse_job_state("JOB_STATE_FAILED"), JobState::Failed);
        assert_eq!(parse_job_state("JOB_STATE_CANCELLED"), JobState::Cancelled);
        assert_eq!(parse_job_state("JOB_STATE_EXPIRED"), JobState::Expired);
        // Unknown states must not be treated as terminal.
        assert!(!parse_job_state("JOB_STATE_SOMETHING_NEW").is_terminal());
    }

    #[test]
    fn results_jsonl_parses_success_and_error_lines() {
        let blob = concat!(
            "{\"key\":\"A:B:2020:1\",\"response\":{\"candidates\":[]}}\n",
            "\n",
            "{\"key\":\"A:B:2020:2\",\"error\":{\"message\":\"bad\"}}\n",
        );
        let results = parse_results_jsonl(blob.as_bytes()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].response.is_some());
        assert!(results[1].error.is_some());
    }

    #[test]
    fn results_jsonl_rejects_garbage() {
        assert!(parse_results_jsonl(b"not json\n").is_err());
    }

    #[test]
    fn mime_type_guessing() {
        assert_eq!(guess_mime_type(Path::new("p/1.jpg")), "image/jpeg");
        assert_eq!(guess_mime_type(Path::new("p/1.png")), "image/png");
        assert_eq!(
            guess_mime_type(Path::new("requests.jsonl")),
            "application/jsonl"
        );
        assert_eq!(
            guess_mime_type(Path::new("blob.bin")),
            "application/octet-stream"
        );
    }

    #[test]
    fn wire_request_includes_generation_config_when_set() {
        let payload = RecordPayload {
            key: "A:B:2020:1".into(),
            prompt: "read the page".into(),
            image_path: "imgs/1.jpg".into(),
            generation_config: Some(serde_json::json!({"temperature": 0.2})),
        };
        let request = GeminiBatchGateway::wire_request(&payload, "files/img1");
        assert_eq!(request["contents"][0]["parts"][0]["text"], "read the page");
        assert_eq!(
            request["contents"][0]["parts"][1]["file_data"]["file_uri"],
            "files/img1"
        );
        assert_eq!(request["generation_config"]["temperature"], 0.2);

        let bare = RecordPayload {
            generation_config: None,
            ..payload
        };
        let request = GeminiBatchGateway::wire_request(&bare, "files/img1");
        assert!(request.get("generation_config").is_none());
    }
}

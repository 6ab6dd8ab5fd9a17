//! Typed configuration model.
//!
//! Mirrors the recognized YAML keys; serde defaults match the values
//! the orchestrator was tuned with in production. Secrets never appear
//! here — the gateway reads credentials from the environment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub paths: PathsConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub files: FilesConfig,
    pub prompt: PromptConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// Filesystem roots. Labels and images are read-only; only
/// `output_dir` is ever written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub label_source_dir: PathBuf,
    pub image_source_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Inclusive year range filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetYears {
    pub start: u32,
    pub end: u32,
}

/// Workload filters; empty state list means all states.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    #[serde(default)]
    pub target_states: Vec<String>,
    #[serde(default)]
    pub target_years: Option<TargetYears>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_batch_size_limit")]
    pub batch_size_limit: usize,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    /// Scan and report without touching the remote service.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            batch_size_limit: default_batch_size_limit(),
            max_concurrent_batches: default_max_concurrent_batches(),
            dry_run: false,
        }
    }
}

/// Generation parameters forwarded verbatim to the remote model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

impl GenerationConfig {
    /// True when no parameter is set and the block should be omitted
    /// from request payloads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.max_output_tokens.is_none()
            && self.response_mime_type.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_display_name_prefix")]
    pub display_name_prefix: String,
    /// Bound on any single poll/upload/download HTTP call.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            max_poll_attempts: default_max_poll_attempts(),
            display_name_prefix: default_display_name_prefix(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_upload_retry_attempts")]
    pub upload_retry_attempts: u32,
    #[serde(default = "default_upload_retry_backoff_seconds")]
    pub upload_retry_backoff_seconds: f64,
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            upload_retry_attempts: default_upload_retry_attempts(),
            upload_retry_backoff_seconds: default_upload_retry_backoff_seconds(),
            upload_concurrency: default_upload_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_registry_dir")]
    pub registry_dir: PathBuf,
    pub name: String,
    pub template_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_max_retries() -> i64 {
    3
}

fn default_batch_size_limit() -> usize {
    100
}

fn default_max_concurrent_batches() -> usize {
    1
}

fn default_poll_interval_seconds() -> u64 {
    10
}

fn default_max_poll_attempts() -> u32 {
    360
}

fn default_display_name_prefix() -> String {
    "ocr-batch-job".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    120
}

fn default_upload_retry_attempts() -> u32 {
    3
}

fn default_upload_retry_backoff_seconds() -> f64 {
    2.0
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_registry_dir() -> PathBuf {
    PathBuf::from("prompts")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/ocrbatch.db")
}

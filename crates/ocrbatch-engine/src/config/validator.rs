//! Semantic validation of a parsed [`AppConfig`].
//!
//! Parse-time checks catch shape errors; this pass catches the
//! constraints serde cannot express. Failures here are fatal at
//! startup.

use anyhow::{bail, Result};

use crate::config::types::AppConfig;

/// Validate cross-field constraints and filesystem preconditions.
///
/// The output directory is created if missing; the label and image
/// roots must already exist because they are read-only to the engine.
///
/// # Errors
///
/// Returns the first constraint violation found.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    for (label, dir) in [
        ("paths.label_source_dir", &config.paths.label_source_dir),
        ("paths.image_source_dir", &config.paths.image_source_dir),
    ] {
        if !dir.is_dir() {
            bail!("{label} does not exist or is not a directory: {}", dir.display());
        }
    }

    if let Some(years) = &config.filters.target_years {
        if years.end < years.start {
            bail!(
                "filters.target_years.end ({}) must be >= start ({})",
                years.end,
                years.start
            );
        }
    }

    if config.execution.max_retries < 0 {
        bail!("execution.max_retries must be >= 0");
    }
    if config.execution.batch_size_limit == 0 {
        bail!("execution.batch_size_limit must be >= 1");
    }
    if config.execution.max_concurrent_batches == 0 {
        bail!("execution.max_concurrent_batches must be >= 1");
    }
    if config.batch.poll_interval_seconds == 0 {
        bail!("batch.poll_interval_seconds must be >= 1");
    }
    if config.batch.max_poll_attempts == 0 {
        bail!("batch.max_poll_attempts must be >= 1");
    }
    if config.files.upload_retry_attempts == 0 {
        bail!("files.upload_retry_attempts must be >= 1");
    }
    if config.files.upload_retry_backoff_seconds < 0.0 {
        bail!("files.upload_retry_backoff_seconds must be >= 0");
    }
    if config.files.upload_concurrency == 0 {
        bail!("files.upload_concurrency must be >= 1");
    }
    if config.model.name.is_empty() {
        bail!("model.name must not be empty");
    }

    std::fs::create_dir_all(&config.paths.output_dir).map_err(|e| {
        anyhow::anyhow!(
            "cannot create paths.output_dir {}: {e}",
            config.paths.output_dir.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_config_str;

    fn valid_config(label_dir: &std::path::Path, image_dir: &std::path::Path) -> AppConfig {
        let yaml = format!(
            r"
paths:
  label_source_dir: {}
  image_source_dir: {}
  output_dir: {}
model:
  name: gemini-2.0-flash
prompt:
  name: ocr
  template_file: page.txt
",
            label_dir.display(),
            image_dir.display(),
            label_dir.join("out").display(),
        );
        parse_config_str(&yaml).unwrap()
    }

    #[test]
    fn valid_config_passes_and_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = valid_config(dir.path(), dir.path());
        validate_config(&config).unwrap();
        assert!(config.paths.output_dir.is_dir());
    }

    #[test]
    fn missing_label_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path(), dir.path());
        config.paths.label_source_dir = dir.path().join("absent");
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("label_source_dir"));
    }

    #[test]
    fn inverted_year_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path(), dir.path());
        config.filters.target_years = Some(crate::config::types::TargetYears {
            start: 1900,
            end: 1850,
        });
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("target_years"));
    }

    #[test]
    fn zero_limits_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path(), dir.path());
        config.execution.batch_size_limit = 0;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config(dir.path(), dir.path());
        config.execution.max_concurrent_batches = 0;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config(dir.path(), dir.path());
        config.batch.poll_interval_seconds = 0;
        assert!(validate_config(&config).is_err());
    }
}

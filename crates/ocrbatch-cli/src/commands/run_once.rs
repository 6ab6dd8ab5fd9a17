//! The `run-once` command: drive the state machine to quiescence.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ocrbatch_engine::config::{parser, validator};
use ocrbatch_engine::gateway::http::{GeminiBatchGateway, RetryPolicy};
use ocrbatch_engine::orchestrator::Orchestrator;
use ocrbatch_engine::sink;
use ocrbatch_engine::FlowError;
use ocrbatch_state::SqliteStateStore;

/// Parse, validate, assemble, and run.
///
/// # Errors
///
/// Returns [`FlowError`] classified for the exit-code contract:
/// configuration errors exit 1, state-store failures exit 2.
pub async fn execute(config_path: &Path) -> Result<(), FlowError> {
    let config = parser::parse_config(config_path).map_err(FlowError::Config)?;
    validator::validate_config(&config).map_err(FlowError::Config)?;

    let store = Arc::new(SqliteStateStore::open(&config.state.db_path).map_err(FlowError::Store)?);

    let api_key = match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ if config.execution.dry_run => String::new(),
        _ => {
            return Err(FlowError::Config(anyhow::anyhow!(
                "Missing GEMINI_API_KEY in environment or .env"
            )))
        }
    };
    let gateway = GeminiBatchGateway::new(
        api_key,
        config.model.name.clone(),
        Duration::from_secs(config.batch.request_timeout_seconds),
        RetryPolicy {
            attempts: config.files.upload_retry_attempts,
            backoff_seconds: config.files.upload_retry_backoff_seconds,
        },
        config.files.upload_concurrency,
    )
    .map_err(FlowError::Infrastructure)?;

    let orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(gateway),
        sink::sink_from_env(),
    )?;
    let report = orchestrator.run_to_quiescence().await?;

    println!("Run complete.");
    println!("  Batches submitted: {}", report.batches_submitted);
    println!("  Batches completed: {}", report.batches_completed);
    println!("  Batches failed:    {}", report.batches_failed);
    println!("  Records succeeded: {}", report.records_succeeded);
    println!("  Records failed:    {}", report.records_failed);
    for wave in &report.waves {
        println!();
        println!("{}", wave.render_markdown());
    }
    Ok(())
}

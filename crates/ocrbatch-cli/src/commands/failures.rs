//! The `failures` command: operator-facing failure analysis.

use std::path::Path;

use anyhow::{Context, Result};

use ocrbatch_engine::config::parser;
use ocrbatch_state::{SqliteStateStore, StateStore};

const LOG_ROWS_SHOWN: u32 = 20;

/// Print the aggregate summary, or the log history of one record.
///
/// # Errors
///
/// Returns an error on unreadable config or store failure.
pub async fn execute(config_path: &Path, record_key: Option<&str>) -> Result<()> {
    let config = parser::parse_config(config_path)?;
    let store = SqliteStateStore::open(&config.state.db_path).context("opening state store")?;

    if let Some(key) = record_key {
        let rows = store.failure_logs_for(key, LOG_ROWS_SHOWN)?;
        if rows.is_empty() {
            println!("No failure logs for {key}");
            return Ok(());
        }
        println!("Failure logs for {key} (newest first):");
        for row in rows {
            println!(
                "  attempt {} | {} | batch {} | {}",
                row.attempt_number,
                row.error_kind.as_deref().unwrap_or("unknown"),
                row.batch_id,
                row.error_message.as_deref().unwrap_or("-"),
            );
        }
        return Ok(());
    }

    let summary = store.failure_summary()?;
    println!("Failure summary");
    println!("  Records with counters: {}", summary.tracked_records);
    println!("  Log rows:              {}", summary.log_rows);
    println!("  Records with logs:     {}", summary.records_with_logs);
    println!("  Highest counter:       {}", summary.max_count);
    if !summary.by_kind.is_empty() {
        println!("  By error kind:");
        for (kind, count) in &summary.by_kind {
            println!("    {kind}: {count}");
        }
    }
    Ok(())
}

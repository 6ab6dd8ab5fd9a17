//! The `reset-failures` command: operator reset of dead-letter counters.

use std::path::Path;

use anyhow::{bail, Context, Result};

use ocrbatch_engine::config::parser;
use ocrbatch_state::{FailureFilter, SqliteStateStore, StateStore};
use ocrbatch_types::RecordKey;

/// Parsed filter flags.
#[derive(Debug, Clone)]
pub struct ResetArgs {
    pub all: bool,
    pub states: Vec<String>,
    pub schools: Vec<String>,
    pub year_start: Option<u32>,
    pub year_end: Option<u32>,
    pub dry_run: bool,
}

impl ResetArgs {
    /// Translate the flags into a store filter.
    ///
    /// # Errors
    ///
    /// Rejects flag combinations that would silently clear everything:
    /// school/year filters require `--states`, and some filter (or
    /// `--all`) must be given.
    pub fn to_filter(&self) -> Result<FailureFilter> {
        if self.all {
            return Ok(FailureFilter::default());
        }
        if self.states.is_empty() {
            if !self.schools.is_empty() || self.year_start.is_some() || self.year_end.is_some() {
                bail!("--schools, --year-start, and --year-end require --states");
            }
            bail!("must specify --all or --states");
        }
        let year_range = match (self.year_start, self.year_end) {
            (None, None) => None,
            (lo, hi) => Some((lo.unwrap_or(0), hi.unwrap_or(u32::MAX))),
        };
        Ok(FailureFilter {
            states: Some(self.states.clone()),
            schools: if self.schools.is_empty() {
                None
            } else {
                Some(self.schools.clone())
            },
            year_range,
        })
    }
}

/// Execute the reset (or preview it with `--dry-run`).
///
/// # Errors
///
/// Returns an error on bad flags, unreadable config, or store failure.
pub async fn execute(config_path: &Path, args: &ResetArgs) -> Result<()> {
    let filter = args.to_filter()?;
    let config = parser::parse_config(config_path)?;
    let store = SqliteStateStore::open(&config.state.db_path).context("opening state store")?;

    if args.dry_run {
        let counts = store.get_failure_counts()?;
        let matching: Vec<&String> = counts
            .keys()
            .filter(|raw| {
                filter.is_all()
                    || RecordKey::parse(raw)
                        .map(|key| filter.matches(&key))
                        .unwrap_or(false)
            })
            .collect();
        println!("[dry run] would clear {} failure counter(s)", matching.len());
        for key in matching.iter().take(10) {
            println!("  - {key}");
        }
        if matching.len() > 10 {
            println!("  ... and {} more", matching.len() - 10);
        }
        return Ok(());
    }

    let cleared = store.reset_failures(&filter)?;
    println!("Cleared {cleared} failure counter(s)");
    Ok(())
}

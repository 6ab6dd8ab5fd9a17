//! Human-readable wave and run reporting.

use std::collections::BTreeMap;

use ocrbatch_types::RecordOutcome;

/// How many failing keys a rendered report names.
const TOP_FAILURES: usize = 10;

/// Summary of one ingested batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveReport {
    pub batch_id: String,
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    /// Failure-log rows written during this ingest, by error kind.
    pub by_kind: BTreeMap<String, u64>,
    /// Failing keys with their attempt numbers, worst first.
    pub failing: Vec<(String, i64)>,
    pub outcomes: Vec<RecordOutcome>,
}

impl WaveReport {
    /// Render the operator-facing markdown block.
    #[must_use]
    pub fn render_markdown(&self) -> String {
        let mut lines = vec![
            "# Batch Summary".to_string(),
            format!("- Batch: `{}`", self.batch_id),
            format!("- Records: {}", self.total),
            format!("- Success: {}", self.successes),
            format!("- Failures: {}", self.failures),
        ];

        if !self.by_kind.is_empty() {
            lines.push(String::new());
            lines.push("## Failures by kind".to_string());
            for (kind, count) in &self.by_kind {
                lines.push(format!("- {kind}: {count}"));
            }
        }

        if !self.failing.is_empty() {
            lines.push(String::new());
            lines.push("## Failing records".to_string());
            for (key, attempt) in self.failing.iter().take(TOP_FAILURES) {
                lines.push(format!("- `{key}` (retry {attempt})"));
            }
            if self.failing.len() > TOP_FAILURES {
                lines.push(format!("- ... and {} more", self.failing.len() - TOP_FAILURES));
            }
        }

        lines.join("\n")
    }
}

/// Totals for one run-to-quiescence invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub batches_submitted: usize,
    pub batches_completed: usize,
    pub batches_failed: usize,
    pub records_succeeded: usize,
    pub records_failed: usize,
    pub waves: Vec<WaveReport>,
}

impl RunReport {
    /// Fold one ingested wave into the totals.
    pub fn absorb(&mut self, wave: WaveReport) {
        self.batches_completed += 1;
        self.records_succeeded += wave.successes;
        self.records_failed += wave.failures;
        self.waves.push(wave);
    }
}

//! Optional per-record observability sink.
//!
//! Mirrors the external tracking collaborator: one emit per ingested
//! record, carrying enough context to replay the generation offline.
//! The sink must never fail the run; an unconfigured or broken sink
//! degrades to a warning.

use std::sync::Arc;

use ocrbatch_types::RecordOutcome;

/// Context for one ingested record.
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub batch_id: String,
    pub record_key: String,
    pub model_name: String,
    pub prompt_name: String,
    pub prompt_template: String,
    pub success: bool,
    pub error: Option<String>,
}

impl RecordContext {
    /// Build from an ingest outcome plus batch/model identity.
    #[must_use]
    pub fn from_outcome(
        outcome: &RecordOutcome,
        batch_id: &str,
        model_name: &str,
        prompt_name: &str,
        prompt_template: &str,
    ) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            record_key: outcome.key.clone(),
            model_name: model_name.to_string(),
            prompt_name: prompt_name.to_string(),
            prompt_template: prompt_template.to_string(),
            success: outcome.success,
            error: outcome.error.clone(),
        }
    }
}

/// External observability collaborator.
pub trait RecordSink: Send + Sync {
    /// Emit one record context. Must not fail the caller.
    fn emit(&self, ctx: &RecordContext);
}

/// Sink used when no tracking project is configured; remembers why.
pub struct DisabledSink {
    reason: String,
}

impl RecordSink for DisabledSink {
    fn emit(&self, _ctx: &RecordContext) {}
}

/// Sink that forwards record contexts to the structured log stream.
pub struct LogSink;

impl RecordSink for LogSink {
    fn emit(&self, ctx: &RecordContext) {
        tracing::info!(
            batch_id = %ctx.batch_id,
            record_key = %ctx.record_key,
            model = %ctx.model_name,
            prompt_name = %ctx.prompt_name,
            success = ctx.success,
            error = ctx.error.as_deref(),
            "Record tracked"
        );
    }
}

/// Choose a sink from the environment: enabled when
/// `OCRBATCH_TRACKING_PROJECT` is set, disabled (with the reason
/// logged once) otherwise.
#[must_use]
pub fn sink_from_env() -> Arc<dyn RecordSink> {
    match std::env::var("OCRBATCH_TRACKING_PROJECT") {
        Ok(project) if !project.is_empty() => {
            tracing::info!(project, "Record tracking enabled");
            Arc::new(LogSink)
        }
        _ => {
            let reason = "OCRBATCH_TRACKING_PROJECT not set".to_string();
            tracing::warn!(reason, "Record tracking disabled");
            Arc::new(DisabledSink { reason })
        }
    }
}

impl DisabledSink {
    /// Why this sink is inert.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sink_keeps_reason_and_ignores_emits() {
        let sink = DisabledSink {
            reason: "not configured".into(),
        };
        assert_eq!(sink.reason(), "not configured");
        sink.emit(&RecordContext {
            batch_id: "b".into(),
            record_key: "k".into(),
            model_name: "m".into(),
            prompt_name: "p".into(),
            prompt_template: "t".into(),
            success: true,
            error: None,
        });
    }

    #[test]
    fn context_from_outcome_copies_fields() {
        let outcome = RecordOutcome::failure("AL:H:1849:1", "bad json");
        let ctx = RecordContext::from_outcome(&outcome, "batches/b1", "model", "ocr", "page.txt");
        assert_eq!(ctx.record_key, "AL:H:1849:1");
        assert!(!ctx.success);
        assert_eq!(ctx.error.as_deref(), Some("bad json"));
    }

    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn RecordSink) {}
    }
}

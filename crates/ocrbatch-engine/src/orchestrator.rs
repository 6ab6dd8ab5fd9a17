//! The flow state machine: service active batches, submit new ones,
//! wait, repeat until quiescence.
//!
//! State transitions are single-threaded; gateway I/O (polling,
//! uploads, downloads) runs concurrently under a cap, and every state
//! store call goes through `spawn_blocking`. A batch's rows are durable
//! before its submission is acknowledged and deleted only after its
//! results are fully ingested (or its terminal failure fully logged),
//! so a crash at any point is recovered by re-polling on the next run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use ocrbatch_state::{StateError, StateStore};
use ocrbatch_types::{BatchId, BatchStatus, ErrorKind, FailureLogRow, JobState};

use crate::builder::{build_record_payloads, BuildInputs};
use crate::config::AppConfig;
use crate::error::FlowError;
use crate::gateway::http::RetryPolicy;
use crate::gateway::{BatchGateway, GatewayError, Submission};
use crate::ingest::{ingest_results, Provenance};
use crate::prompt::PromptTemplate;
use crate::scanner::{scan_runnable_pages, ScanOutcome, ScanParams};
use crate::sink::{RecordContext, RecordSink};
use crate::summary::RunReport;

/// Drives one deployment's flow to quiescence.
pub struct Orchestrator {
    config: AppConfig,
    store: Arc<dyn StateStore>,
    gateway: Arc<dyn BatchGateway>,
    sink: Arc<dyn RecordSink>,
    template: PromptTemplate,
    provenance: Provenance,
    generation_config: Option<serde_json::Value>,
}

impl Orchestrator {
    /// Assemble the state machine. Loads the prompt template; a missing
    /// template is a configuration error.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`] when the prompt template cannot be
    /// loaded.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn StateStore>,
        gateway: Arc<dyn BatchGateway>,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self, FlowError> {
        let template = PromptTemplate::load(
            &config.prompt.registry_dir,
            &config.prompt.name,
            &config.prompt.template_file,
        )
        .map_err(FlowError::Config)?;

        let generation_config = config
            .model
            .generation_config
            .as_ref()
            .filter(|g| !g.is_empty())
            .map(|g| serde_json::to_value(g).unwrap_or_default());
        let provenance = Provenance {
            model_name: config.model.name.clone(),
            prompt_name: config.prompt.name.clone(),
            prompt_template: config.prompt.template_file.clone(),
            generation_config: generation_config.as_ref().map(ToString::to_string),
        };

        Ok(Self {
            config,
            store,
            gateway,
            sink,
            template,
            provenance,
            generation_config,
        })
    }

    /// Run SERVICE/SUBMIT/WAIT until no active batches remain and the
    /// scanner comes back empty.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Store`] on state-store failure and
    /// [`FlowError::Infrastructure`] on host-side failures; record- and
    /// batch-level errors are absorbed into the store and the report.
    pub async fn run_to_quiescence(&self) -> Result<RunReport, FlowError> {
        let mut report = RunReport::default();
        let mut wait_cycles: u32 = 0;

        loop {
            let serviced = self.service_active_batches(&mut report).await?;
            let submitted = self.submit_new_batches(&mut report).await?;
            let made_progress = serviced || submitted;
            if made_progress {
                wait_cycles = 0;
            }

            let active = self.with_store(|store| store.list_active_batches()).await?;
            if !active.is_empty() {
                if !made_progress {
                    if wait_cycles >= self.config.batch.max_poll_attempts {
                        tracing::warn!(
                            active = active.len(),
                            wait_cycles,
                            "Poll budget exhausted; leaving active batches for the next run"
                        );
                        return Ok(report);
                    }
                    wait_cycles += 1;
                    tracing::info!(
                        active = active.len(),
                        sleep_seconds = self.config.batch.poll_interval_seconds,
                        "Batches still running"
                    );
                    tokio::time::sleep(Duration::from_secs(
                        self.config.batch.poll_interval_seconds,
                    ))
                    .await;
                }
                continue;
            }

            if !made_progress {
                tracing::info!("No active batches and no runnable work; exiting");
                return Ok(report);
            }
        }
    }

    // -----------------------------------------------------------------
    // SERVICE
    // -----------------------------------------------------------------

    /// Poll every active batch and settle the terminal ones in
    /// id-ascending order. Returns whether anything was ingested or
    /// failed over.
    async fn service_active_batches(&self, report: &mut RunReport) -> Result<bool, FlowError> {
        let active = self.with_store(|store| store.list_active_batches()).await?;
        if active.is_empty() {
            return Ok(false);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.execution.max_concurrent_batches));
        let mut join_set: JoinSet<(BatchId, Result<JobState, GatewayError>)> = JoinSet::new();
        for batch_id in active {
            let gateway = Arc::clone(&self.gateway);
            let semaphore = Arc::clone(&semaphore);
            let retry = self.retry_policy();
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (
                        batch_id,
                        Err(GatewayError::Permanent(anyhow!("poll semaphore closed"))),
                    );
                };
                let state = poll_with_retries(gateway.as_ref(), &batch_id, retry).await;
                (batch_id, state)
            });
        }

        let mut polled: BTreeMap<BatchId, Result<JobState, GatewayError>> = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((batch_id, state)) => {
                    polled.insert(batch_id, state);
                }
                Err(join_err) => {
                    return Err(FlowError::Infrastructure(anyhow!(
                        "poll task panicked: {join_err}"
                    )));
                }
            }
        }

        // Terminal batches settle in id order so log timestamps stay
        // reproducible across runs.
        let mut progressed = false;
        for (batch_id, state) in polled {
            match state {
                Err(err) => {
                    tracing::warn!(
                        batch_id = %batch_id,
                        error = %err,
                        "Poll failed; batch stays active"
                    );
                }
                Ok(state) if !state.is_terminal() => {
                    tracing::info!(batch_id = %batch_id, state = %state, "Batch still in flight");
                }
                Ok(state) if state.is_success() => {
                    if self.ingest_batch(&batch_id, report).await? {
                        progressed = true;
                    }
                }
                Ok(state) => {
                    self.fail_batch(&batch_id, state).await?;
                    report.batches_failed += 1;
                    progressed = true;
                }
            }
        }
        Ok(progressed)
    }

    /// Download, ingest, and finalize one terminal-success batch.
    /// Returns false (leaving the batch active) when the download could
    /// not be completed this pass.
    async fn ingest_batch(
        &self,
        batch_id: &BatchId,
        report: &mut RunReport,
    ) -> Result<bool, FlowError> {
        let expected = {
            let id = batch_id.clone();
            self.with_store(move |store| store.batch_record_keys(&id))
                .await?
        };

        let results = match download_with_retries(
            self.gateway.as_ref(),
            batch_id,
            self.retry_policy(),
        )
        .await
        {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(
                    batch_id = %batch_id,
                    error = %err,
                    "Result download failed; batch stays active for the next pass"
                );
                return Ok(false);
            }
        };

        let wave = {
            let store = Arc::clone(&self.store);
            let id = batch_id.clone();
            let output_root = self.config.paths.output_dir.clone();
            let provenance = self.provenance.clone();
            tokio::task::spawn_blocking(move || {
                ingest_results(
                    store.as_ref(),
                    &id,
                    &expected,
                    &output_root,
                    &provenance,
                    &results,
                )
            })
            .await
            .map_err(|e| FlowError::Infrastructure(anyhow!("ingest task panicked: {e}")))?
            .map_err(|e| match e.downcast::<StateError>() {
                Ok(store_err) => FlowError::Store(store_err),
                Err(other) => FlowError::Infrastructure(other),
            })?
        };

        for outcome in &wave.outcomes {
            self.sink.emit(&RecordContext::from_outcome(
                outcome,
                batch_id.as_str(),
                &self.provenance.model_name,
                &self.provenance.prompt_name,
                &self.provenance.prompt_template,
            ));
        }

        tracing::info!(
            batch_id = %batch_id,
            records = wave.total,
            successes = wave.successes,
            failures = wave.failures,
            "Batch ingested\n{}",
            wave.render_markdown()
        );

        {
            let id = batch_id.clone();
            self.with_store(move |store| store.finalize_batch(&id, BatchStatus::Completed))
                .await?;
        }
        report.absorb(wave);
        Ok(true)
    }

    /// Settle a batch that ended `failed`, `cancelled`, or `expired`:
    /// one log row per member key, no counter bumps, members eligible
    /// again on the next wave.
    async fn fail_batch(&self, batch_id: &BatchId, state: JobState) -> Result<(), FlowError> {
        tracing::warn!(batch_id = %batch_id, state = %state, "Batch ended without results");
        let id = batch_id.clone();
        self.with_store(move |store| {
            let keys = store.batch_record_keys(&id)?;
            let counts = store.get_failure_counts()?;
            for key in &keys {
                let attempt = counts.get(key).copied().unwrap_or(0);
                store.append_failure_log(
                    &FailureLogRow::new(
                        key.as_str(),
                        id.as_str(),
                        attempt,
                        ErrorKind::BatchTerminalFailure,
                    )
                    .with_message(format!("batch ended in state {state}")),
                )?;
            }
            store.finalize_batch(&id, BatchStatus::Failed)
        })
        .await
    }

    // -----------------------------------------------------------------
    // SUBMIT
    // -----------------------------------------------------------------

    /// Fill free concurrency slots with freshly scanned waves. The
    /// scanner re-runs per slot so successive sub-batches never contend
    /// for the same keys. Returns whether anything was submitted.
    async fn submit_new_batches(&self, report: &mut RunReport) -> Result<bool, FlowError> {
        let mut progressed = false;
        loop {
            let active = self.with_store(|store| store.list_active_batches()).await?;
            if active.len() >= self.config.execution.max_concurrent_batches {
                tracing::info!(active = active.len(), "Max concurrent batches in flight");
                break;
            }

            let outcome = self.scan().await?;
            if outcome.runnable.is_empty() {
                tracing::info!(
                    candidates = outcome.total_candidates,
                    "No runnable pages available"
                );
                break;
            }
            tracing::info!(
                runnable = outcome.runnable.len(),
                candidates = outcome.total_candidates,
                "Scan found runnable pages"
            );

            if self.config.execution.dry_run {
                tracing::warn!("Dry run enabled: skipping remote submission");
                break;
            }

            let payloads = {
                let keys = outcome.runnable.clone();
                let template = self.template.clone();
                let label_root = self.config.paths.label_source_dir.clone();
                let image_root = self.config.paths.image_source_dir.clone();
                let output_root = self.config.paths.output_dir.clone();
                let generation_config = self.generation_config.clone();
                tokio::task::spawn_blocking(move || {
                    build_record_payloads(
                        &keys,
                        &BuildInputs {
                            template: &template,
                            label_root: &label_root,
                            image_root: &image_root,
                            output_root: &output_root,
                            generation_config,
                        },
                    )
                })
                .await
                .map_err(|e| FlowError::Infrastructure(anyhow!("payload build panicked: {e}")))?
            };

            let display_name = format!(
                "{}-{}",
                self.config.batch.display_name_prefix,
                payloads.len()
            );
            match self.gateway.submit(&display_name, payloads).await {
                Ok(submission) => {
                    self.track_submission(&submission).await?;
                    if submission.record_keys.is_empty() {
                        break;
                    }
                    report.batches_submitted += 1;
                    progressed = true;
                }
                Err(err) => {
                    // Whole-bundle failure: the records were never in
                    // flight, so only log rows are written.
                    tracing::error!(error = %err, "Batch submission failed");
                    let keys: Vec<String> =
                        outcome.runnable.iter().map(ToString::to_string).collect();
                    let message = err.to_string();
                    self.with_store(move |store| {
                        for key in &keys {
                            store.append_failure_log(
                                &FailureLogRow::new(
                                    key.as_str(),
                                    "",
                                    0,
                                    ErrorKind::SubmissionFailure,
                                )
                                .with_message(message.clone()),
                            )?;
                        }
                        Ok(())
                    })
                    .await?;
                    break;
                }
            }
        }
        Ok(progressed)
    }

    /// Persist a successful submission: log rows for keys whose image
    /// upload failed, then the ActiveBatch/membership/in-flight rows
    /// for the keys that made it into the bundle.
    async fn track_submission(&self, submission: &Submission) -> Result<(), FlowError> {
        let batch_id = submission.batch_id.clone();
        let record_keys = submission.record_keys.clone();
        let failed_uploads = submission.failed_uploads.clone();

        for (key, error) in &failed_uploads {
            tracing::warn!(record_key = %key, error = %error, "Image upload failed; key left out of batch");
        }

        self.with_store(move |store| {
            for (key, error) in &failed_uploads {
                store.append_failure_log(
                    &FailureLogRow::new(
                        key.as_str(),
                        batch_id.as_str(),
                        0,
                        ErrorKind::SubmissionFailure,
                    )
                    .with_message(format!("image upload failed: {error}")),
                )?;
            }
            if record_keys.is_empty() {
                return Ok(());
            }
            store.add_batch(&batch_id, &record_keys)
        })
        .await?;

        if !submission.record_keys.is_empty() {
            tracing::info!(
                batch_id = %submission.batch_id,
                records = submission.record_keys.len(),
                "Submitted batch"
            );
        }
        Ok(())
    }

    /// Snapshot the store and run the scanner off the async runtime.
    async fn scan(&self) -> Result<ScanOutcome, FlowError> {
        let store = Arc::clone(&self.store);
        let label_root = self.config.paths.label_source_dir.clone();
        let output_root = self.config.paths.output_dir.clone();
        let state_filter = self.config.filters.target_states.clone();
        let year_range = self
            .config
            .filters
            .target_years
            .map(|years| (years.start, years.end));
        let max_retries = self.config.execution.max_retries;
        let batch_size_limit = self.config.execution.batch_size_limit;

        tokio::task::spawn_blocking(move || {
            let failure_counts = store.get_failure_counts()?;
            let inflight = store.get_inflight()?;
            Ok::<_, StateError>(scan_runnable_pages(&ScanParams {
                label_root: &label_root,
                output_root: &output_root,
                state_filter: &state_filter,
                year_range,
                max_retries,
                failure_counts: &failure_counts,
                inflight: &inflight,
                batch_size_limit,
            }))
        })
        .await
        .map_err(|e| FlowError::Infrastructure(anyhow!("scan task panicked: {e}")))?
        .map_err(FlowError::Store)
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.files.upload_retry_attempts,
            backoff_seconds: self.config.files.upload_retry_backoff_seconds,
        }
    }

    /// Run one state-store operation on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T, FlowError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StateStore) -> Result<T, StateError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| FlowError::Infrastructure(anyhow!("state store task panicked: {e}")))?
            .map_err(FlowError::Store)
    }
}

/// Poll with bounded transient-error retries.
async fn poll_with_retries(
    gateway: &dyn BatchGateway,
    batch_id: &BatchId,
    retry: RetryPolicy,
) -> Result<JobState, GatewayError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match gateway.poll(batch_id).await {
            Ok(state) => return Ok(state),
            Err(err) if err.is_transient() && attempt < retry.attempts => {
                tokio::time::sleep(retry.backoff(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Download with bounded transient-error retries.
async fn download_with_retries(
    gateway: &dyn BatchGateway,
    batch_id: &BatchId,
    retry: RetryPolicy,
) -> Result<Vec<ocrbatch_types::RecordResult>, GatewayError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match gateway.download(batch_id).await {
            Ok(results) => return Ok(results),
            Err(err) if err.is_transient() && attempt < retry.attempts => {
                tokio::time::sleep(retry.backoff(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

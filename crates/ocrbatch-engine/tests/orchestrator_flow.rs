//! End-to-end state machine tests against a scripted gateway.
//!
//! These drive real waves through a real SQLite store and a real
//! output tree; only the remote service is substituted.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ocrbatch_engine::config::parser::parse_config_str;
use ocrbatch_engine::config::AppConfig;
use ocrbatch_engine::gateway::{BatchGateway, GatewayError, RecordPayload, Submission};
use ocrbatch_engine::orchestrator::Orchestrator;
use ocrbatch_engine::sink::{RecordContext, RecordSink};
use ocrbatch_state::{SqliteStateStore, StateStore};
use ocrbatch_types::{BatchId, JobState, RecordKey, RecordResult};

struct NullSink;

impl RecordSink for NullSink {
    fn emit(&self, _ctx: &RecordContext) {}
}

/// How the mock service treats one record key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordBehavior {
    Valid,
    ServiceError,
}

#[derive(Default)]
struct MockInner {
    counter: usize,
    /// Keys per created batch, in submission order.
    batches: BTreeMap<String, Vec<String>>,
    /// Recorded payloads per batch for prompt assertions.
    payloads: BTreeMap<String, Vec<RecordPayload>>,
    /// Submitted key lists in order.
    submissions: Vec<Vec<String>>,
    /// Terminal state for each successive batch; defaults to Succeeded.
    poll_plan: VecDeque<JobState>,
    poll_states: BTreeMap<String, JobState>,
    behaviors: BTreeMap<String, RecordBehavior>,
    fail_submission: bool,
}

#[derive(Default)]
struct MockGateway {
    inner: Mutex<MockInner>,
}

impl MockGateway {
    fn with_behaviors(behaviors: &[(&str, RecordBehavior)]) -> Self {
        let gateway = Self::default();
        {
            let mut inner = gateway.inner.lock().unwrap();
            for (key, behavior) in behaviors {
                inner.behaviors.insert((*key).to_string(), *behavior);
            }
        }
        gateway
    }

    fn plan_states(&self, states: &[JobState]) {
        self.inner.lock().unwrap().poll_plan = states.iter().copied().collect();
    }

    fn fail_submission(&self) {
        self.inner.lock().unwrap().fail_submission = true;
    }

    /// Pre-seed a remote batch the orchestrator never submitted in this
    /// process (crash recovery).
    fn seed_batch(&self, batch_id: &str, keys: &[&str], state: JobState) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .batches
            .insert(batch_id.to_string(), keys.iter().map(|k| (*k).to_string()).collect());
        inner.poll_states.insert(batch_id.to_string(), state);
    }

    fn submissions(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().submissions.clone()
    }

    fn prompt_for(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .payloads
            .values()
            .flatten()
            .find(|p| p.key == key)
            .map(|p| p.prompt.clone())
    }
}

/// A response whose model text is a valid artifact carrying `marker`
/// as its OCR content.
fn valid_response(marker: &str) -> serde_json::Value {
    let artifact = serde_json::json!({
        "raw_ocr": {
            "text_blocks": [
                {"block_id": 1, "position": "body", "text": marker, "font_style": "normal"}
            ],
            "layout_description": "single column"
        },
        "page_info": {"page_number": null, "is_complete_page": true, "content_type": "courses"},
        "school_name": null,
        "catalog_year": null,
        "academic_year": null,
        "courses": []
    });
    serde_json::json!({
        "candidates": [{"content": {"parts": [{"text": artifact.to_string()}]}}]
    })
}

#[async_trait]
impl BatchGateway for MockGateway {
    async fn submit(
        &self,
        _display_name: &str,
        payloads: Vec<RecordPayload>,
    ) -> Result<Submission, GatewayError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_submission {
            return Err(GatewayError::Permanent(anyhow::anyhow!(
                "bundle upload rejected"
            )));
        }
        inner.counter += 1;
        let batch_id = format!("batches/b{:04}", inner.counter);
        let keys: Vec<String> = payloads.iter().map(|p| p.key.clone()).collect();
        inner.batches.insert(batch_id.clone(), keys.clone());
        inner.payloads.insert(batch_id.clone(), payloads);
        inner.submissions.push(keys.clone());
        let state = inner.poll_plan.pop_front().unwrap_or(JobState::Succeeded);
        inner.poll_states.insert(batch_id.clone(), state);
        Ok(Submission {
            batch_id: BatchId::new(batch_id),
            record_keys: keys,
            failed_uploads: Vec::new(),
        })
    }

    async fn poll(&self, batch_id: &BatchId) -> Result<JobState, GatewayError> {
        let inner = self.inner.lock().unwrap();
        inner
            .poll_states
            .get(batch_id.as_str())
            .copied()
            .ok_or_else(|| GatewayError::Permanent(anyhow::anyhow!("unknown batch")))
    }

    async fn download(&self, batch_id: &BatchId) -> Result<Vec<RecordResult>, GatewayError> {
        let inner = self.inner.lock().unwrap();
        let keys = inner
            .batches
            .get(batch_id.as_str())
            .cloned()
            .ok_or_else(|| GatewayError::Permanent(anyhow::anyhow!("unknown batch")))?;
        Ok(keys
            .iter()
            .map(|key| {
                match inner
                    .behaviors
                    .get(key)
                    .copied()
                    .unwrap_or(RecordBehavior::Valid)
                {
                    RecordBehavior::Valid => {
                        RecordResult::ok(key.as_str(), valid_response(&format!("text of {key}")))
                    }
                    RecordBehavior::ServiceError => RecordResult::service_error(
                        key.as_str(),
                        serde_json::json!({"code": 500, "message": "inference failed"}),
                    ),
                }
            })
            .collect())
    }
}

struct Harness {
    dir: tempfile::TempDir,
    config: AppConfig,
    store: Arc<SqliteStateStore>,
}

impl Harness {
    fn new(max_concurrent_batches: usize, batch_size_limit: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["labels", "images", "out", "prompts/catalog-ocr"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        std::fs::write(
            dir.path().join("prompts/catalog-ocr/page.txt"),
            "READ THE PAGE\n{{ previous_context }}",
        )
        .unwrap();

        let yaml = format!(
            r"
paths:
  label_source_dir: {root}/labels
  image_source_dir: {root}/images
  output_dir: {root}/out
execution:
  max_retries: 3
  batch_size_limit: {batch_size_limit}
  max_concurrent_batches: {max_concurrent_batches}
model:
  name: gemini-2.0-flash
batch:
  poll_interval_seconds: 1
  max_poll_attempts: 5
prompt:
  registry_dir: {root}/prompts
  name: catalog-ocr
  template_file: page.txt
",
            root = dir.path().display(),
        );
        let config = parse_config_str(&yaml).unwrap();
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        Self { dir, config, store }
    }

    fn label(&self, key: &str) {
        let key = RecordKey::parse(key).unwrap();
        let path = key.label_path(&self.dir.path().join("labels"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "{}").unwrap();
    }

    fn output_path(&self, key: &str) -> std::path::PathBuf {
        RecordKey::parse(key)
            .unwrap()
            .output_path(&self.dir.path().join("out"))
    }

    fn orchestrator(&self, gateway: Arc<MockGateway>) -> Orchestrator {
        Orchestrator::new(
            self.config.clone(),
            Arc::clone(&self.store) as Arc<dyn StateStore>,
            gateway,
            Arc::new(NullSink),
        )
        .unwrap()
    }
}

fn assert_store_quiescent(store: &dyn StateStore) {
    assert!(store.list_active_batches().unwrap().is_empty());
    assert!(store.get_inflight().unwrap().is_empty());
}

#[tokio::test]
async fn single_book_runs_chain_to_quiescence() {
    let harness = Harness::new(1, 100);
    for page in 1..=3 {
        harness.label(&format!("AL:Howard:1849:{page}"));
    }
    let gateway = Arc::new(MockGateway::default());
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    let report = orchestrator.run_to_quiescence().await.unwrap();

    // One page per wave, in chain order.
    assert_eq!(
        gateway.submissions(),
        vec![
            vec!["AL:Howard:1849:1".to_string()],
            vec!["AL:Howard:1849:2".to_string()],
            vec!["AL:Howard:1849:3".to_string()],
        ]
    );
    for page in 1..=3 {
        assert!(harness.output_path(&format!("AL:Howard:1849:{page}")).exists());
    }
    assert_eq!(report.batches_submitted, 3);
    assert_eq!(report.batches_completed, 3);
    assert_eq!(report.records_succeeded, 3);
    assert_eq!(report.records_failed, 0);
    assert_store_quiescent(harness.store.as_ref());
}

#[tokio::test]
async fn successor_prompt_carries_predecessor_context() {
    let harness = Harness::new(1, 100);
    harness.label("AL:Howard:1849:1");
    harness.label("AL:Howard:1849:2");
    let gateway = Arc::new(MockGateway::default());
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    orchestrator.run_to_quiescence().await.unwrap();

    let first_prompt = gateway.prompt_for("AL:Howard:1849:1").unwrap();
    assert!(!first_prompt.contains("LAST_500_CHARS"));

    let second_prompt = gateway.prompt_for("AL:Howard:1849:2").unwrap();
    assert!(second_prompt.contains("LAST_500_CHARS"));
    assert!(second_prompt.contains("text of AL:Howard:1849:1"));
}

#[tokio::test]
async fn concurrent_books_get_one_page_each() {
    let harness = Harness::new(2, 1);
    for book in ["A", "B"] {
        for page in 1..=2 {
            harness.label(&format!("AL:{book}:1850:{page}"));
        }
    }
    let gateway = Arc::new(MockGateway::default());
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    orchestrator.run_to_quiescence().await.unwrap();

    // The first pass fills both slots with chain heads, never two pages
    // of the same book.
    let submissions = gateway.submissions();
    assert_eq!(
        &submissions[..2],
        &[
            vec!["AL:A:1850:1".to_string()],
            vec!["AL:B:1850:1".to_string()],
        ]
    );
    assert_eq!(submissions.len(), 4);
    for book in ["A", "B"] {
        for page in 1..=2 {
            assert!(harness.output_path(&format!("AL:{book}:1850:{page}")).exists());
        }
    }
    assert_store_quiescent(harness.store.as_ref());
}

#[tokio::test]
async fn batch_terminal_failure_requeues_without_counter_bump() {
    let harness = Harness::new(1, 100);
    harness.label("AL:Howard:1849:1");
    let gateway = Arc::new(MockGateway::default());
    gateway.plan_states(&[JobState::Failed, JobState::Succeeded]);
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    let report = orchestrator.run_to_quiescence().await.unwrap();

    // Submitted twice: the first batch expired without results, the
    // record re-queued naturally.
    assert_eq!(gateway.submissions().len(), 2);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.batches_completed, 1);
    assert!(harness.output_path("AL:Howard:1849:1").exists());

    // No bump for a purely batch-level failure, but a log row exists.
    assert!(harness.store.get_failure_counts().unwrap().is_empty());
    let logs = harness
        .store
        .failure_logs_for("AL:Howard:1849:1", 10)
        .unwrap();
    assert_eq!(
        logs.iter()
            .filter(|row| row.error_kind.as_deref() == Some("batch_terminal_failure"))
            .count(),
        1
    );
    assert_store_quiescent(harness.store.as_ref());
}

#[tokio::test]
async fn crash_recovery_ingests_committed_batch() {
    let harness = Harness::new(1, 100);
    harness.label("AL:Howard:1849:1");

    // Simulate a prior process that committed the batch then died.
    harness
        .store
        .add_batch(
            &BatchId::new("batches/prior"),
            &["AL:Howard:1849:1".to_string()],
        )
        .unwrap();
    let gateway = Arc::new(MockGateway::default());
    gateway.seed_batch("batches/prior", &["AL:Howard:1849:1"], JobState::Succeeded);
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    let report = orchestrator.run_to_quiescence().await.unwrap();

    // Recovered by polling, not by resubmitting.
    assert!(gateway.submissions().is_empty());
    assert!(harness.output_path("AL:Howard:1849:1").exists());
    assert_eq!(report.batches_completed, 1);
    assert_store_quiescent(harness.store.as_ref());
}

#[tokio::test]
async fn crash_recovery_failed_batch_makes_key_eligible_again() {
    let harness = Harness::new(1, 100);
    harness.label("AL:Howard:1849:1");
    harness
        .store
        .add_batch(
            &BatchId::new("batches/prior"),
            &["AL:Howard:1849:1".to_string()],
        )
        .unwrap();
    let gateway = Arc::new(MockGateway::default());
    gateway.seed_batch("batches/prior", &["AL:Howard:1849:1"], JobState::Expired);
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    orchestrator.run_to_quiescence().await.unwrap();

    // The expired batch was cleared and the key resubmitted fresh.
    assert_eq!(
        gateway.submissions(),
        vec![vec!["AL:Howard:1849:1".to_string()]]
    );
    assert!(harness.output_path("AL:Howard:1849:1").exists());
    assert!(harness.store.get_failure_counts().unwrap().is_empty());
    assert_store_quiescent(harness.store.as_ref());
}

#[tokio::test]
async fn submission_failure_mutates_nothing_but_logs() {
    let harness = Harness::new(1, 100);
    harness.label("AL:Howard:1849:1");
    let gateway = Arc::new(MockGateway::default());
    gateway.fail_submission();
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    let report = orchestrator.run_to_quiescence().await.unwrap();

    assert_eq!(report.batches_submitted, 0);
    assert!(harness.store.get_failure_counts().unwrap().is_empty());
    assert_store_quiescent(harness.store.as_ref());
    let logs = harness
        .store
        .failure_logs_for("AL:Howard:1849:1", 10)
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].error_kind.as_deref(), Some("submission_failure"));
}

#[tokio::test]
async fn per_record_failures_retry_until_dead_letter() {
    let harness = Harness::new(1, 100);
    harness.label("AL:Good:1850:1");
    harness.label("CA:Bad:1850:1");
    let gateway = Arc::new(MockGateway::with_behaviors(&[
        ("AL:Good:1850:1", RecordBehavior::Valid),
        ("CA:Bad:1850:1", RecordBehavior::ServiceError),
    ]));
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    let report = orchestrator.run_to_quiescence().await.unwrap();

    // Wave 1 carries both chain heads; the failing record retries alone
    // until its counter exceeds max_retries (3), i.e. 4 attempts total.
    let submissions = gateway.submissions();
    assert_eq!(
        submissions[0],
        vec!["AL:Good:1850:1".to_string(), "CA:Bad:1850:1".to_string()]
    );
    assert_eq!(submissions.len(), 4);
    for submission in &submissions[1..] {
        assert_eq!(submission, &vec!["CA:Bad:1850:1".to_string()]);
    }

    assert!(harness.output_path("AL:Good:1850:1").exists());
    assert!(!harness.output_path("CA:Bad:1850:1").exists());
    assert_eq!(
        harness
            .store
            .get_failure_counts()
            .unwrap()
            .get("CA:Bad:1850:1"),
        Some(&4)
    );
    assert_eq!(report.records_succeeded, 1);
    assert_eq!(report.records_failed, 4);
    assert_store_quiescent(harness.store.as_ref());
}

#[tokio::test]
async fn rerun_after_quiescence_is_a_no_op() {
    let harness = Harness::new(1, 100);
    harness.label("AL:Howard:1849:1");
    let gateway = Arc::new(MockGateway::default());
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));
    orchestrator.run_to_quiescence().await.unwrap();
    assert_eq!(gateway.submissions().len(), 1);

    let report = orchestrator.run_to_quiescence().await.unwrap();
    assert_eq!(gateway.submissions().len(), 1);
    assert_eq!(report.batches_submitted, 0);
    assert_eq!(report.batches_completed, 0);
}

#[tokio::test]
async fn dry_run_scans_but_never_submits() {
    let mut harness = Harness::new(1, 100);
    harness.config.execution.dry_run = true;
    harness.label("AL:Howard:1849:1");
    let gateway = Arc::new(MockGateway::default());
    let orchestrator = harness.orchestrator(Arc::clone(&gateway));

    let report = orchestrator.run_to_quiescence().await.unwrap();
    assert!(gateway.submissions().is_empty());
    assert_eq!(report.batches_submitted, 0);
    assert_store_quiescent(harness.store.as_ref());
}

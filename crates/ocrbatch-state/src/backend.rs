//! State store trait definition.
//!
//! [`StateStore`] defines the storage contract for active batches,
//! batch membership, in-flight records, failure counters, and failure
//! logs. Model types live in [`ocrbatch_types`].

use std::collections::{BTreeMap, BTreeSet};

use ocrbatch_types::{BatchId, BatchStatus, FailureLogRow, RecordKey};

use crate::error;

/// Predicate over `(state, school, year)` used by
/// [`StateStore::reset_failures`].
///
/// `None` fields match everything; an empty filter matches all rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureFilter {
    pub states: Option<Vec<String>>,
    pub schools: Option<Vec<String>>,
    pub year_range: Option<(u32, u32)>,
}

impl FailureFilter {
    /// True when the filter has no constraints at all.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.states.is_none() && self.schools.is_none() && self.year_range.is_none()
    }

    /// Whether `key` satisfies every configured constraint.
    #[must_use]
    pub fn matches(&self, key: &RecordKey) -> bool {
        if let Some(states) = &self.states {
            if !states.iter().any(|s| s.as_str() == key.state()) {
                return false;
            }
        }
        if let Some(schools) = &self.schools {
            if !schools.iter().any(|s| s.as_str() == key.school()) {
                return false;
            }
        }
        if let Some((lo, hi)) = self.year_range {
            if key.year() < lo || key.year() > hi {
                return false;
            }
        }
        true
    }
}

/// Aggregate failure statistics for operator reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureSummary {
    /// Rows in the failure-count table.
    pub tracked_records: u64,
    /// Total failure-log rows.
    pub log_rows: u64,
    /// Distinct record keys with at least one log row.
    pub records_with_logs: u64,
    /// Highest failure count observed.
    pub max_count: i64,
    /// Log rows grouped by error kind, descending by count.
    pub by_kind: Vec<(String, u64)>,
}

/// Storage contract for orchestration state.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn StateStore>`. Each operation is atomic: writes within one
/// call either all land or none do, and readers always observe a
/// consistent snapshot.
pub trait StateStore: Send + Sync {
    /// Ids of batches currently in the `active` status.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_active_batches(&self) -> error::Result<Vec<BatchId>>;

    /// Track a newly submitted batch: inserts the active-batch row, the
    /// membership rows, and the in-flight rows, all-or-nothing.
    ///
    /// # Errors
    ///
    /// [`StateError::BatchExists`](crate::StateError::BatchExists) if
    /// the id is already tracked;
    /// [`StateError::RecordInflight`](crate::StateError::RecordInflight)
    /// if any key is already in flight. Either conflict leaves the
    /// store untouched.
    fn add_batch(&self, batch_id: &BatchId, record_keys: &[String]) -> error::Result<()>;

    /// Terminate a batch: flips the status and deletes its membership
    /// and in-flight rows in one transaction.
    ///
    /// # Errors
    ///
    /// [`StateError::BatchNotActive`](crate::StateError::BatchNotActive)
    /// if the id is unknown or already terminal.
    fn finalize_batch(&self, batch_id: &BatchId, status: BatchStatus) -> error::Result<()>;

    /// Membership keys of a batch (empty once the batch is finalized).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn batch_record_keys(&self, batch_id: &BatchId) -> error::Result<Vec<String>>;

    /// Every record key currently in flight.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_inflight(&self) -> error::Result<BTreeSet<String>>;

    /// Snapshot of all failure counters.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_failure_counts(&self) -> error::Result<BTreeMap<String, i64>>;

    /// Increment a record's failure counter and return the new value.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn bump_failure(&self, record_key: &str) -> error::Result<i64>;

    /// Append one failure-log row.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn append_failure_log(&self, row: &FailureLogRow) -> error::Result<()>;

    /// Delete failure counters matching `filter`, returning the number
    /// of rows removed. Rows whose key fails to parse are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn reset_failures(&self, filter: &FailureFilter) -> error::Result<u64>;

    /// Aggregate failure statistics for operator reporting.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn failure_summary(&self) -> error::Result<FailureSummary>;

    /// Most recent failure-log rows for one record key, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn failure_logs_for(&self, record_key: &str, limit: u32) -> error::Result<Vec<FailureLogRow>>;
}

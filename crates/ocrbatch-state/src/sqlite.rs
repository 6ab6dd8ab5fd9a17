//! `SQLite`-backed implementation of [`StateStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Multi-row
//! writes (`add_batch`, `finalize_batch`, `reset_failures`) run inside
//! one transaction so a crash never leaves partial state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};

use ocrbatch_types::{BatchId, BatchStatus, FailureLogRow, RecordKey};

use crate::backend::{FailureFilter, FailureSummary, StateStore};
use crate::error::{self, StateError};

/// Idempotent DDL for the five state relations.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS active_batches (
    batch_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE INDEX IF NOT EXISTS idx_active_batches_created_at ON active_batches (created_at);
CREATE INDEX IF NOT EXISTS idx_active_batches_status ON active_batches (status);

CREATE TABLE IF NOT EXISTS batch_record_keys (
    batch_id TEXT NOT NULL,
    record_key TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (batch_id, record_key)
);

CREATE INDEX IF NOT EXISTS idx_batch_record_keys_record_key ON batch_record_keys (record_key);

CREATE TABLE IF NOT EXISTS inflight_records (
    record_key TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_inflight_records_batch_id ON inflight_records (batch_id);

CREATE TABLE IF NOT EXISTS failure_counts (
    record_key TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS failure_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_key TEXT NOT NULL,
    batch_id TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    error_kind TEXT,
    error_message TEXT,
    error_trace TEXT,
    raw_response_text TEXT,
    extracted_text TEXT,
    raw_response_blob TEXT,
    model_name TEXT,
    prompt_name TEXT,
    prompt_template TEXT,
    generation_config TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_failure_logs_record_key ON failure_logs (record_key);
CREATE INDEX IF NOT EXISTS idx_failure_logs_batch_id ON failure_logs (batch_id);
CREATE INDEX IF NOT EXISTS idx_failure_logs_created_at ON failure_logs (created_at);
CREATE INDEX IF NOT EXISTS idx_failure_logs_error_kind ON failure_logs (error_kind);
";

/// `SQLite`-backed orchestration state.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence
/// or [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or a `SQLite` error if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns a `SQLite` error if the in-memory database can't be
    /// initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    #[cfg(test)]
    fn batch_status(&self, batch_id: &BatchId) -> error::Result<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status FROM active_batches WHERE batch_id = ?1",
            [batch_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(StateError::from)
    }
}

impl StateStore for SqliteStateStore {
    fn list_active_batches(&self) -> error::Result<Vec<BatchId>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT batch_id FROM active_batches WHERE status = 'active' ORDER BY batch_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(BatchId::new).collect())
    }

    fn add_batch(&self, batch_id: &BatchId, record_keys: &[String]) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("add_batch: begin tx", e))?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT batch_id FROM active_batches WHERE batch_id = ?1",
                [batch_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("add_batch: check id", e))?;
        if exists.is_some() {
            return Err(StateError::BatchExists(batch_id.to_string()));
        }

        for key in record_keys {
            let inflight: Option<String> = tx
                .query_row(
                    "SELECT batch_id FROM inflight_records WHERE record_key = ?1",
                    [key.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StateError::backend_context("add_batch: check inflight", e))?;
            if inflight.is_some() {
                return Err(StateError::RecordInflight(key.clone()));
            }
        }

        tx.execute(
            "INSERT INTO active_batches (batch_id, status) VALUES (?1, 'active')",
            [batch_id.as_str()],
        )
        .map_err(|e| StateError::backend_context("add_batch: insert batch", e))?;

        {
            let mut membership = tx
                .prepare("INSERT INTO batch_record_keys (batch_id, record_key) VALUES (?1, ?2)")
                .map_err(|e| StateError::backend_context("add_batch: prepare membership", e))?;
            let mut inflight = tx
                .prepare("INSERT INTO inflight_records (record_key, batch_id) VALUES (?1, ?2)")
                .map_err(|e| StateError::backend_context("add_batch: prepare inflight", e))?;
            for key in record_keys {
                membership
                    .execute(rusqlite::params![batch_id.as_str(), key])
                    .map_err(|e| StateError::backend_context("add_batch: insert membership", e))?;
                inflight
                    .execute(rusqlite::params![key, batch_id.as_str()])
                    .map_err(|e| StateError::backend_context("add_batch: insert inflight", e))?;
            }
        }

        tx.commit()
            .map_err(|e| StateError::backend_context("add_batch: commit", e))?;
        Ok(())
    }

    fn finalize_batch(&self, batch_id: &BatchId, status: BatchStatus) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("finalize_batch: begin tx", e))?;

        let updated = tx
            .execute(
                "UPDATE active_batches SET status = ?1, updated_at = datetime('now') \
                 WHERE batch_id = ?2 AND status = 'active'",
                rusqlite::params![status.as_str(), batch_id.as_str()],
            )
            .map_err(|e| StateError::backend_context("finalize_batch: update status", e))?;
        if updated == 0 {
            return Err(StateError::BatchNotActive(batch_id.to_string()));
        }

        tx.execute(
            "DELETE FROM batch_record_keys WHERE batch_id = ?1",
            [batch_id.as_str()],
        )
        .map_err(|e| StateError::backend_context("finalize_batch: delete membership", e))?;
        tx.execute(
            "DELETE FROM inflight_records WHERE batch_id = ?1",
            [batch_id.as_str()],
        )
        .map_err(|e| StateError::backend_context("finalize_batch: delete inflight", e))?;

        tx.commit()
            .map_err(|e| StateError::backend_context("finalize_batch: commit", e))?;
        Ok(())
    }

    fn batch_record_keys(&self, batch_id: &BatchId) -> error::Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_key FROM batch_record_keys WHERE batch_id = ?1 ORDER BY record_key",
        )?;
        let keys = stmt
            .query_map([batch_id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn get_inflight(&self) -> error::Result<BTreeSet<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT record_key FROM inflight_records")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        Ok(keys)
    }

    fn get_failure_counts(&self) -> error::Result<BTreeMap<String, i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT record_key, count FROM failure_counts")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
        Ok(counts)
    }

    fn bump_failure(&self, record_key: &str) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO failure_counts (record_key, count, last_updated) \
             VALUES (?1, 1, datetime('now')) \
             ON CONFLICT(record_key) \
             DO UPDATE SET count = count + 1, last_updated = datetime('now')",
            [record_key],
        )
        .map_err(|e| StateError::backend_context("bump_failure: upsert", e))?;
        let count = conn.query_row(
            "SELECT count FROM failure_counts WHERE record_key = ?1",
            [record_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn append_failure_log(&self, row: &FailureLogRow) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO failure_logs \
             (record_key, batch_id, attempt_number, error_kind, error_message, error_trace, \
              raw_response_text, extracted_text, raw_response_blob, model_name, prompt_name, \
              prompt_template, generation_config) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                row.record_key,
                row.batch_id,
                row.attempt_number,
                row.error_kind,
                row.error_message,
                row.error_trace,
                row.raw_response_text,
                row.extracted_text,
                row.raw_response_blob,
                row.model_name,
                row.prompt_name,
                row.prompt_template,
                row.generation_config,
            ],
        )
        .map_err(|e| StateError::backend_context("append_failure_log: insert", e))?;
        Ok(())
    }

    fn reset_failures(&self, filter: &FailureFilter) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("reset_failures: begin tx", e))?;

        let deleted = if filter.is_all() {
            tx.execute("DELETE FROM failure_counts", [])
                .map_err(|e| StateError::backend_context("reset_failures: delete all", e))?
        } else {
            let matching: Vec<String> = {
                let mut stmt = tx
                    .prepare("SELECT record_key FROM failure_counts")
                    .map_err(|e| StateError::backend_context("reset_failures: select keys", e))?;
                let keys = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|e| StateError::backend_context("reset_failures: scan keys", e))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                keys.into_iter()
                    .filter(|raw| {
                        RecordKey::parse(raw)
                            .map(|key| filter.matches(&key))
                            .unwrap_or(false)
                    })
                    .collect()
            };

            let mut deleted = 0usize;
            let mut stmt = tx
                .prepare("DELETE FROM failure_counts WHERE record_key = ?1")
                .map_err(|e| StateError::backend_context("reset_failures: prepare delete", e))?;
            for key in &matching {
                deleted += stmt
                    .execute([key.as_str()])
                    .map_err(|e| StateError::backend_context("reset_failures: delete", e))?;
            }
            drop(stmt);
            deleted
        };

        tx.commit()
            .map_err(|e| StateError::backend_context("reset_failures: commit", e))?;
        Ok(deleted as u64)
    }

    #[allow(clippy::cast_sign_loss)]
    fn failure_summary(&self) -> error::Result<FailureSummary> {
        let conn = self.lock_conn()?;
        let tracked_records: i64 =
            conn.query_row("SELECT COUNT(*) FROM failure_counts", [], |row| row.get(0))?;
        let log_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM failure_logs", [], |row| row.get(0))?;
        let records_with_logs: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT record_key) FROM failure_logs",
            [],
            |row| row.get(0),
        )?;
        let max_count: Option<i64> =
            conn.query_row("SELECT MAX(count) FROM failure_counts", [], |row| {
                row.get(0)
            })?;

        let mut stmt = conn.prepare(
            "SELECT COALESCE(error_kind, 'unknown'), COUNT(*) AS n \
             FROM failure_logs GROUP BY error_kind ORDER BY n DESC",
        )?;
        let by_kind = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(FailureSummary {
            tracked_records: tracked_records as u64,
            log_rows: log_rows as u64,
            records_with_logs: records_with_logs as u64,
            max_count: max_count.unwrap_or(0),
            by_kind: by_kind
                .into_iter()
                .map(|(kind, n)| (kind, n as u64))
                .collect(),
        })
    }

    fn failure_logs_for(&self, record_key: &str, limit: u32) -> error::Result<Vec<FailureLogRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_key, batch_id, attempt_number, error_kind, error_message, \
                    error_trace, raw_response_text, extracted_text, raw_response_blob, \
                    model_name, prompt_name, prompt_template, generation_config \
             FROM failure_logs WHERE record_key = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![record_key, limit], |row| {
                Ok(FailureLogRow {
                    record_key: row.get(0)?,
                    batch_id: row.get(1)?,
                    attempt_number: row.get(2)?,
                    error_kind: row.get(3)?,
                    error_message: row.get(4)?,
                    error_trace: row.get(5)?,
                    raw_response_text: row.get(6)?,
                    extracted_text: row.get(7)?,
                    raw_response_blob: row.get(8)?,
                    model_name: row.get(9)?,
                    prompt_name: row.get(10)?,
                    prompt_template: row.get(11)?,
                    generation_config: row.get(12)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

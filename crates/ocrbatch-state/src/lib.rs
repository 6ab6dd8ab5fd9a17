//! Durable orchestration state for the ocrbatch engine.
//!
//! Provides the [`StateStore`] trait and the SQLite implementation
//! coordinating active batches, in-flight record keys, failure
//! counters, and failure logs. Every trait operation is atomic; a
//! crash between operations leaves the store consistent with
//! recoverable-from-remote truth.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

// Top-level re-exports for convenience.
pub use backend::{FailureFilter, FailureSummary, StateStore};
pub use error::StateError;
pub use sqlite::SqliteStateStore;

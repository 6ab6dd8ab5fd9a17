//! Shared data types for the ocrbatch orchestration engine.
//!
//! Pure model types used across the state store, engine, and CLI.
//! Kept in a leaf crate so the storage and engine crates can share
//! them without circular dependencies.

#![warn(clippy::pedantic)]

pub mod artifact;
pub mod batch;
pub mod error;
pub mod record;
pub mod result;

// Top-level re-exports for convenience.
pub use artifact::CatalogPage;
pub use batch::{BatchId, BatchStatus, JobState};
pub use error::{ErrorKind, FailureLogRow};
pub use record::{BookId, RecordKey};
pub use result::{RecordOutcome, RecordResult};

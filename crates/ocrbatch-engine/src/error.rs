//! Categorized engine error for exit-code decisions.
//!
//! The state machine surfaces record-level failures as data (counter
//! bumps, log rows, reports); only the categories below abort a run.

use ocrbatch_state::StateError;

use crate::gateway::GatewayError;

/// Top-level failure of a flow run.
#[derive(Debug)]
pub enum FlowError {
    /// Invalid configuration; fatal at startup (exit code 1).
    Config(anyhow::Error),
    /// State-store failure; treated as corruption (exit code 2).
    Store(StateError),
    /// Gateway failure that exhausted its retries.
    Gateway(GatewayError),
    /// Host-side failure (task panic, filesystem, channel).
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Store(e) => write!(f, "state store error: {e}"),
            Self::Gateway(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<StateError> for FlowError {
    fn from(e: StateError) -> Self {
        Self::Store(e)
    }
}

impl From<GatewayError> for FlowError {
    fn from(e: GatewayError) -> Self {
        Self::Gateway(e)
    }
}

impl FlowError {
    /// Process exit code mandated for this failure class.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Store(_) => 2,
            Self::Config(_) | Self::Gateway(_) | Self::Infrastructure(_) => 1,
        }
    }
}

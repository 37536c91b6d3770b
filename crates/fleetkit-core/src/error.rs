//! Core error types for fleetkit-core

use thiserror::Error;

use fleetkit_exec::{ExecError, TransferError};

/// Errors that can occur while running work across a context's hosts
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Context has no hosts to run on
    #[error("context has no hosts")]
    NoHosts,

    /// Host specification could not be parsed
    #[error("invalid host {spec:?}: {reason}")]
    InvalidHost {
        /// Text that was given
        spec: String,
        /// What is wrong with it
        reason: String,
    },

    /// Connection or channel failure
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// File transfer failure
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Per-host task panicked or was cancelled
    #[error("host task failed: {0}")]
    TaskFailed(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

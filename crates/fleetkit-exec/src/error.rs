//! Error types for fleetkit-exec

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::channel::ChannelState;

/// Errors that can occur on a connection or one of its channels
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Host name was empty
    #[error("no host given")]
    NoHost,

    /// Failed to connect to remote host (transport reason passed through)
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Operation is not valid in the channel's current state
    #[error("cannot {operation} channel in state {state:?}")]
    ChannelState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the channel was in
        state: ChannelState,
    },

    /// Unexpected or malformed channel event
    #[error("channel protocol error: {0}")]
    ChannelProtocol(String),

    /// Connection establishment timed out
    #[error("connection timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// I/O error on the transport
    #[error("I/O error: {0}")]
    IoError(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// Check if error is retryable
    ///
    /// Nothing in fleetkit retries on its own; this is a hint for callers.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. }
        )
    }
}

/// Errors that can occur while copying files over a channel
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Connection or channel failure
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Remote side reported an error (scp message or non-zero exit)
    #[error("remote error: {0}")]
    Remote(String),

    /// Wire record could not be parsed
    #[error("malformed transfer record: {0}")]
    Malformed(String),

    /// Local filesystem error
    #[error("I/O error on {path}: {message}")]
    Io {
        /// Local path involved
        path: PathBuf,
        /// Underlying error
        message: String,
    },

    /// Request cannot be carried out as given
    #[error("invalid transfer: {0}")]
    Invalid(String),

    /// Failed after some files were already transferred
    #[error("{reason} (after {transferred} files)")]
    Partial {
        /// Files completed before the failure
        transferred: usize,
        /// What went wrong
        reason: Box<TransferError>,
    },
}

impl TransferError {
    /// Wrap a local I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<russh::Error> for ExecError {
    fn from(e: russh::Error) -> Self {
        ExecError::IoError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ExecError::ConnectionFailed("refused".into()).is_retryable());
        assert!(
            ExecError::Timeout {
                timeout: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(!ExecError::NoHost.is_retryable());
        assert!(!ExecError::ChannelProtocol("bad".into()).is_retryable());
    }

    #[test]
    fn test_partial_message() {
        let err = TransferError::Partial {
            transferred: 2,
            reason: Box::new(TransferError::Remote("disk full".into())),
        };
        assert_eq!(err.to_string(), "remote error: disk full (after 2 files)");
    }

    #[test]
    fn test_channel_state_message() {
        let err = ExecError::ChannelState {
            operation: "send",
            state: ChannelState::Closed,
        };
        assert_eq!(err.to_string(), "cannot send channel in state Closed");
    }
}

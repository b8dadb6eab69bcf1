//! Error types for herald-core.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// How the persisted credential artifact looked when a command was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredsPresence {
    /// File exists with non-blank content.
    Valid,
    /// File exists but is empty or whitespace (typically after a logout).
    Empty,
    /// File does not exist.
    Missing,
}

impl fmt::Display for CredsPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredsPresence::Valid => write!(f, "valid"),
            CredsPresence::Empty => write!(f, "empty"),
            CredsPresence::Missing => write!(f, "missing"),
        }
    }
}

/// Engine error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected before any process interaction.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A non-login command was attempted with no usable session.
    #[error("session {key} is not connected (credentials {presence})")]
    NotConnected {
        /// Session key as `tenant/branch`.
        key: String,
        /// State of the on-disk credential artifact.
        presence: CredsPresence,
        /// Last known session state, when an in-memory record existed.
        state: Option<SessionState>,
    },

    /// The external client executable could not be started.
    #[error("failed to spawn messaging client: {0}")]
    Spawn(#[source] std::io::Error),

    /// No terminal state within the command's time budget.
    #[error("command timed out after {}s", timeout.as_secs())]
    Timeout {
        /// The budget that was exceeded.
        timeout: Duration,
        /// Output accumulated before the timeout.
        output: String,
    },

    /// Abnormal exit without a message-sent marker to excuse it.
    #[error("messaging client exited with code {code:?}")]
    ProcessExit {
        /// Exit code, or `None` when terminated by a signal.
        code: Option<i32>,
        /// Combined stdout/stderr of the run.
        output: String,
    },

    /// Credential directory or file operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

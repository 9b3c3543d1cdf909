//! Error types for the metaserver log subsystem.

use std::path::PathBuf;

use kfs_client::CodecError;
use thiserror::Error;

use crate::logger::LogState;

/// Result type alias for log and checkpoint operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Error variants for log and checkpoint operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// A log write or rotation was attempted outside the active state.
    #[error("log is not active (state: {state:?})")]
    LogNotActive {
        /// State the log was in.
        state: LogState,
    },

    /// The requested log state transition is not allowed from the current state.
    #[error("invalid log transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: LogState,
        /// Requested state.
        to: LogState,
    },

    /// Only mutating operations are logged.
    #[error("operation {0} does not mutate metadata")]
    NotMutating(&'static str),

    /// The log has been closed to new submissions.
    #[error("operation log is closed")]
    Closed,

    /// A record could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A checkpoint file exists but cannot be used.
    #[error("corrupt checkpoint {path:?}: {reason}")]
    CorruptCheckpoint {
        /// Checkpoint file.
        path: PathBuf,
        /// Description of the defect.
        reason: String,
    },

    /// A log file that is not the newest one cannot be read back.
    #[error("corrupt log {path:?}: {reason}")]
    CorruptLog {
        /// Log file.
        path: PathBuf,
        /// Description of the defect.
        reason: String,
    },

    /// Protocol codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A lower-level I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}

#![warn(missing_docs)]

//! KFS metaserver log subsystem: write-ahead operation log, checkpoints and restart recovery
//!
//! Mutating requests are sequenced and made durable by [`OpLog`] before their
//! results are released. [`CheckpointManager`] periodically rotates the log
//! and writes a checkpoint image, and [`recovery::recover`] rebuilds the
//! restart watermark from the newest checkpoint and the log files after it.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logger;
pub mod recovery;
pub mod request;

pub use checkpoint::{CheckpointImage, CheckpointManager, CheckpointOutcome, RecordImage};
pub use config::LoggerConfig;
pub use error::{MetaError, MetaResult};
pub use logger::{CheckpointTicket, LogState, OpLog};
pub use recovery::{recover, RecoveryPoint};
pub use request::{LogRecord, MetaOp, MetaRequest, RequestState, SeqNo};

//! Error types for the KFS protocol codec.

use thiserror::Error;

/// Result type alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Local codec failures.
///
/// These never carry a remote status code: a peer rejecting a request is
/// reported through `ResponseHeader::status`, not through this type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// An Open request carried flags other than read-only, write-only or read-write.
    #[error("unsupported open mode: {0:#o}")]
    UnsupportedOpenMode(i32),

    /// The operation line of a request does not name a known operation.
    #[error("unknown operation: {0:?}")]
    UnknownOperation(String),

    /// The request text did not contain an operation line.
    #[error("empty request")]
    EmptyRequest,

    /// A replica list held fewer entries than its advertised count.
    #[error("malformed replica list: expected {expected} servers, found {found}")]
    MalformedReplicas {
        /// Advertised number of replicas.
        expected: usize,
        /// Number of complete (host, port) pairs present.
        found: usize,
    },

    /// A layout body entry could not be parsed.
    #[error("malformed layout entry {chunk}: {reason}")]
    MalformedLayout {
        /// Index of the entry within the body.
        chunk: usize,
        /// Description of the defect.
        reason: String,
    },

    /// A "host port" pair had an unparseable port.
    #[error("malformed server location: {0:?}")]
    MalformedLocation(String),
}

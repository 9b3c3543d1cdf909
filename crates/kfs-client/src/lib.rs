#![warn(missing_docs)]

//! KFS client protocol: request/response codec for namespace, chunk, lease and write operations
//!
//! Requests are encoded into CRLF-terminated `Key: value` header blocks and
//! responses are decoded back into typed values. Decoding of scalar fields is
//! lenient and falls back to documented defaults; replica and layout lists
//! are decoded strictly.

pub mod error;
pub mod lease;
pub mod properties;
pub mod request;
pub mod response;
pub mod types;

pub use error::{CodecError, CodecResult};
pub use lease::{ChunkAlloc, ChunkLease, LeaseRenewal, LeaseType, LEASE_INTERVAL_SECS};
pub use properties::Properties;
pub use request::{OpKind, OpenIntent, Request};
pub use response::{Reply, Response, ResponseHeader};
pub use types::{
    ChunkId, ChunkLayoutInfo, FileAttr, FileId, Seq, ServerLocation, Timeval, WriteInfo,
    DIRECTORY_TYPE, KFS_VERSION_STR,
};

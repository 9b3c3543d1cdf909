//! Protocol value types: handles, server locations, layouts and attributes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CodecError, CodecResult};

/// Protocol version advertised on every request.
pub const KFS_VERSION_STR: &str = "KFS/1.0";

/// Value of the `Type` field that marks a directory.
pub const DIRECTORY_TYPE: &str = "dir";

/// Caller-assigned request sequence id, echoed back as `Cseq`.
pub type Seq = i64;

/// Identifier of a file or directory in the namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(i64);

impl FileId {
    /// The value reported when a response carries no file handle.
    pub const UNSET: FileId = FileId(-1);

    /// The root directory handle.
    pub const ROOT: FileId = FileId(2);

    /// Creates a new FileId from a raw value
    pub fn new(id: i64) -> Self {
        FileId(id)
    }

    /// Returns the raw value of this file id
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        FileId::UNSET
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a chunk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(i64);

impl ChunkId {
    /// The value reported when a response carries no chunk handle.
    pub const UNSET: ChunkId = ChunkId(-1);

    /// Creates a new ChunkId from a raw value
    pub fn new(id: i64) -> Self {
        ChunkId(id)
    }

    /// Returns the raw value of this chunk id
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Default for ChunkId {
    fn default() -> Self {
        ChunkId::UNSET
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chunk server endpoint. Two locations are equal when host and port match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerLocation {
    /// Host name or address.
    pub hostname: String,
    /// TCP port.
    pub port: i32,
}

impl ServerLocation {
    /// Creates a new location.
    pub fn new(hostname: impl Into<String>, port: i32) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Parses a `"host port"` pair.
    pub fn parse(s: &str) -> CodecResult<Self> {
        let mut tokens = s.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some(host), Some(port)) => {
                let port = port
                    .parse()
                    .map_err(|_| CodecError::MalformedLocation(s.to_string()))?;
                Ok(Self::new(host, port))
            }
            _ => Err(CodecError::MalformedLocation(s.to_string())),
        }
    }

    /// Consumes exactly `count` (host, port) pairs from a token stream.
    pub(crate) fn take_list<'a, I>(tokens: &mut I, count: usize) -> CodecResult<Vec<Self>>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut servers = Vec::new();
        for _ in 0..count {
            let (host, port) = match (tokens.next(), tokens.next()) {
                (Some(h), Some(p)) => (h, p),
                _ => {
                    return Err(CodecError::MalformedReplicas {
                        expected: count,
                        found: servers.len(),
                    })
                }
            };
            let port = port
                .parse()
                .map_err(|_| CodecError::MalformedLocation(format!("{} {}", host, port)))?;
            servers.push(Self::new(host, port));
        }
        Ok(servers)
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.hostname, self.port)
    }
}

/// Placement of one chunk of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayoutInfo {
    /// Byte offset of the chunk within the file.
    pub file_offset: i64,
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// Chunk version.
    pub chunk_version: i64,
    /// Servers holding a replica, in the order the metaserver listed them.
    pub chunk_servers: Vec<ServerLocation>,
}

/// One leg of a replicated write: the replica and the write id it handed out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInfo {
    /// The replica that accepted the prepared write.
    pub server_loc: ServerLocation,
    /// Write id returned by that replica's WritePrepare.
    pub write_id: i64,
}

impl WriteInfo {
    /// Creates a new write leg.
    pub fn new(server_loc: ServerLocation, write_id: i64) -> Self {
        Self {
            server_loc,
            write_id,
        }
    }
}

/// A (seconds, microseconds) timestamp as carried on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timeval {
    /// Seconds since the Unix epoch.
    pub sec: i64,
    /// Microseconds within the second.
    pub usec: i64,
}

impl Timeval {
    /// Creates a new timestamp.
    pub fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    /// Parses `"seconds microseconds"`. Empty or unparseable input yields (0, 0).
    pub fn parse_lenient(s: &str) -> Self {
        let mut tokens = s.split_whitespace();
        let sec = tokens.next().and_then(|t| t.parse().ok());
        let usec = tokens.next().and_then(|t| t.parse().ok());
        match (sec, usec) {
            (Some(sec), Some(usec)) => Self { sec, usec },
            _ => Self::default(),
        }
    }
}

impl fmt::Display for Timeval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sec, self.usec)
    }
}

/// File attributes returned by Lookup and LookupPath.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// File handle.
    pub file_id: FileId,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Number of chunks in the file.
    pub chunk_count: i64,
    /// Replication factor.
    pub num_replicas: i32,
    /// Modification time.
    pub mtime: Timeval,
    /// Attribute change time.
    pub ctime: Timeval,
    /// Creation time.
    pub crtime: Timeval,
}

impl Default for FileAttr {
    fn default() -> Self {
        Self {
            file_id: FileId::UNSET,
            is_directory: false,
            chunk_count: 0,
            num_replicas: 1,
            mtime: Timeval::default(),
            ctime: Timeval::default(),
            crtime: Timeval::default(),
        }
    }
}

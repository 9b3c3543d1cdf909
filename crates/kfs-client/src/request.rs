//! Request side of the KFS protocol.
//!
//! A request is an operation line followed by `Cseq`, `Version` and the
//! operation's own `Key: value` lines, each terminated by CRLF, with a blank
//! line ending the block. Field order per operation is fixed.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::debug;

use crate::error::{CodecError, CodecResult};
use crate::lease::LeaseType;
use crate::properties::Properties;
use crate::types::*;

/// Every operation kind the protocol carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Create a file.
    Create,
    /// Create a directory.
    Mkdir,
    /// Remove a directory.
    Rmdir,
    /// Rename an entry.
    Rename,
    /// List a directory.
    Readdir,
    /// Remove a file.
    Remove,
    /// Look up a name in a directory.
    Lookup,
    /// Look up a path from a root handle.
    LookupPath,
    /// Fetch the allocation of one chunk.
    GetAlloc,
    /// Fetch the layout of every chunk in a file.
    GetLayout,
    /// Allocate (or reallocate) the chunk at an offset.
    Allocate,
    /// Truncate a file.
    Truncate,
    /// Open a chunk on a chunk server.
    Open,
    /// Close a chunk on a chunk server.
    Close,
    /// Read from a chunk.
    Read,
    /// Stage data on a replica.
    WritePrepare,
    /// Commit a staged write across all replicas.
    WriteSync,
    /// Query a chunk's size.
    Size,
    /// Acquire a chunk lease.
    LeaseAcquire,
    /// Renew a chunk lease.
    LeaseRenew,
}

impl OpKind {
    /// All kinds, in protocol order.
    pub const ALL: [OpKind; 20] = [
        OpKind::Create,
        OpKind::Mkdir,
        OpKind::Rmdir,
        OpKind::Rename,
        OpKind::Readdir,
        OpKind::Remove,
        OpKind::Lookup,
        OpKind::LookupPath,
        OpKind::GetAlloc,
        OpKind::GetLayout,
        OpKind::Allocate,
        OpKind::Truncate,
        OpKind::Open,
        OpKind::Close,
        OpKind::Read,
        OpKind::WritePrepare,
        OpKind::WriteSync,
        OpKind::Size,
        OpKind::LeaseAcquire,
        OpKind::LeaseRenew,
    ];

    /// The operation line sent on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Create => "CREATE",
            OpKind::Mkdir => "MKDIR",
            OpKind::Rmdir => "RMDIR",
            OpKind::Rename => "RENAME",
            OpKind::Readdir => "READDIR",
            OpKind::Remove => "REMOVE",
            OpKind::Lookup => "LOOKUP",
            OpKind::LookupPath => "LOOKUP_PATH",
            OpKind::GetAlloc => "GETALLOC",
            OpKind::GetLayout => "GETLAYOUT",
            OpKind::Allocate => "ALLOCATE",
            OpKind::Truncate => "TRUNCATE",
            OpKind::Open => "OPEN",
            OpKind::Close => "CLOSE",
            OpKind::Read => "READ",
            OpKind::WritePrepare => "WRITE_PREPARE",
            OpKind::WriteSync => "WRITE_SYNC",
            OpKind::Size => "SIZE",
            OpKind::LeaseAcquire => "LEASE_ACQUIRE",
            OpKind::LeaseRenew => "LEASE_RENEW",
        }
    }

    /// Looks up a kind by its operation line.
    pub fn from_name(name: &str) -> Option<OpKind> {
        OpKind::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Whether the metaserver must log this operation before replying.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            OpKind::Create
                | OpKind::Mkdir
                | OpKind::Rmdir
                | OpKind::Rename
                | OpKind::Remove
                | OpKind::Allocate
                | OpKind::Truncate
        )
    }
}

/// The two intents an Open request can express.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenIntent {
    /// Read-only access.
    Read,
    /// Write-only or read-write access.
    Write,
}

impl OpenIntent {
    /// Collapses POSIX open flags into an intent. Anything other than
    /// `O_RDONLY`, `O_WRONLY` or `O_RDWR` is rejected.
    pub fn from_flags(flags: i32) -> CodecResult<Self> {
        if flags == libc::O_RDONLY {
            Ok(OpenIntent::Read)
        } else if flags == libc::O_WRONLY || flags == libc::O_RDWR {
            Ok(OpenIntent::Write)
        } else {
            Err(CodecError::UnsupportedOpenMode(flags))
        }
    }

    /// Wire form of the intent.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenIntent::Read => "READ",
            OpenIntent::Write => "WRITE",
        }
    }
}

/// A request for one operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Create a file in a directory.
    Create {
        /// Parent directory.
        parent: FileId,
        /// New file name.
        filename: String,
        /// Desired replication factor.
        num_replicas: i32,
    },
    /// Create a directory.
    Mkdir {
        /// Parent directory.
        parent: FileId,
        /// New directory name.
        dirname: String,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Parent directory.
        parent: FileId,
        /// Directory name.
        dirname: String,
    },
    /// Rename an entry.
    Rename {
        /// Directory holding the entry.
        parent: FileId,
        /// Current name within `parent`.
        old_name: String,
        /// Destination path.
        new_path: String,
        /// Replace an existing destination.
        overwrite: bool,
    },
    /// List a directory.
    Readdir {
        /// Directory to list.
        dir: FileId,
    },
    /// Remove a file.
    Remove {
        /// Parent directory.
        parent: FileId,
        /// File name.
        filename: String,
    },
    /// Look up a name in a directory.
    Lookup {
        /// Parent directory.
        parent: FileId,
        /// Name to look up.
        filename: String,
    },
    /// Look up a path relative to a root handle.
    LookupPath {
        /// Starting directory.
        root: FileId,
        /// Path to resolve.
        pathname: String,
    },
    /// Fetch the allocation of the chunk covering an offset.
    GetAlloc {
        /// File handle.
        fid: FileId,
        /// Byte offset of the chunk.
        offset: i64,
    },
    /// Fetch the full chunk layout of a file.
    GetLayout {
        /// File handle.
        fid: FileId,
    },
    /// Allocate the chunk covering an offset.
    Allocate {
        /// File handle.
        fid: FileId,
        /// Byte offset of the chunk.
        offset: i64,
    },
    /// Truncate a file.
    Truncate {
        /// File handle.
        fid: FileId,
        /// New length.
        offset: i64,
    },
    /// Open a chunk.
    Open {
        /// Chunk to open.
        chunk_id: ChunkId,
        /// POSIX access mode (`O_RDONLY`, `O_WRONLY` or `O_RDWR`).
        flags: i32,
    },
    /// Close a chunk.
    Close {
        /// Chunk to close.
        chunk_id: ChunkId,
    },
    /// Read from a chunk.
    Read {
        /// Chunk to read.
        chunk_id: ChunkId,
        /// Expected chunk version.
        chunk_version: i64,
        /// Offset within the chunk.
        offset: i64,
        /// Number of bytes.
        num_bytes: u64,
    },
    /// Stage data on a replica ahead of a WriteSync.
    WritePrepare {
        /// Chunk to write.
        chunk_id: ChunkId,
        /// Expected chunk version.
        chunk_version: i64,
        /// Offset within the chunk.
        offset: i64,
        /// Number of bytes.
        num_bytes: u64,
    },
    /// Commit staged writes on every replica.
    WriteSync {
        /// Chunk being written.
        chunk_id: ChunkId,
        /// Expected chunk version.
        chunk_version: i64,
        /// Per-replica write ids, in the order the write pipeline collected them.
        write_info: Vec<WriteInfo>,
    },
    /// Query a chunk's size.
    Size {
        /// Chunk to query.
        chunk_id: ChunkId,
        /// Expected chunk version.
        chunk_version: i64,
    },
    /// Acquire a lease on a chunk.
    LeaseAcquire {
        /// Chunk to lease.
        chunk_id: ChunkId,
    },
    /// Renew a lease on a chunk.
    LeaseRenew {
        /// Leased chunk.
        chunk_id: ChunkId,
        /// Lease id from LeaseAcquire.
        lease_id: i64,
        /// Kind of lease being renewed.
        lease_type: LeaseType,
    },
}

/// Accumulates CRLF-terminated header lines.
struct HeaderWriter {
    buf: String,
}

impl HeaderWriter {
    fn new(kind: OpKind, seq: Seq) -> Self {
        let mut w = Self {
            buf: String::with_capacity(128),
        };
        w.buf.push_str(kind.name());
        w.buf.push_str("\r\n");
        w.field("Cseq", seq);
        w.field("Version", KFS_VERSION_STR);
        w
    }

    fn field(&mut self, key: &str, value: impl std::fmt::Display) {
        let _ = write!(self.buf, "{}: {}\r\n", key, value);
    }

    fn finish(mut self) -> String {
        self.buf.push_str("\r\n");
        self.buf
    }
}

impl Request {
    /// The kind of this request.
    pub fn kind(&self) -> OpKind {
        match self {
            Request::Create { .. } => OpKind::Create,
            Request::Mkdir { .. } => OpKind::Mkdir,
            Request::Rmdir { .. } => OpKind::Rmdir,
            Request::Rename { .. } => OpKind::Rename,
            Request::Readdir { .. } => OpKind::Readdir,
            Request::Remove { .. } => OpKind::Remove,
            Request::Lookup { .. } => OpKind::Lookup,
            Request::LookupPath { .. } => OpKind::LookupPath,
            Request::GetAlloc { .. } => OpKind::GetAlloc,
            Request::GetLayout { .. } => OpKind::GetLayout,
            Request::Allocate { .. } => OpKind::Allocate,
            Request::Truncate { .. } => OpKind::Truncate,
            Request::Open { .. } => OpKind::Open,
            Request::Close { .. } => OpKind::Close,
            Request::Read { .. } => OpKind::Read,
            Request::WritePrepare { .. } => OpKind::WritePrepare,
            Request::WriteSync { .. } => OpKind::WriteSync,
            Request::Size { .. } => OpKind::Size,
            Request::LeaseAcquire { .. } => OpKind::LeaseAcquire,
            Request::LeaseRenew { .. } => OpKind::LeaseRenew,
        }
    }

    /// Encodes the request header block.
    ///
    /// The only failure is an Open request whose flags are not a valid
    /// access mode; nothing is produced in that case.
    pub fn encode(&self, seq: Seq) -> CodecResult<String> {
        let mut w = HeaderWriter::new(self.kind(), seq);
        match self {
            Request::Create {
                parent,
                filename,
                num_replicas,
            } => {
                w.field("Parent File-handle", parent);
                w.field("Filename", filename);
                w.field("Num-replicas", num_replicas);
            }
            Request::Mkdir { parent, dirname } | Request::Rmdir { parent, dirname } => {
                w.field("Parent File-handle", parent);
                w.field("Directory", dirname);
            }
            Request::Rename {
                parent,
                old_name,
                new_path,
                overwrite,
            } => {
                w.field("Parent File-handle", parent);
                w.field("Old-name", old_name);
                w.field("New-path", new_path);
                w.field("Overwrite", u8::from(*overwrite));
            }
            Request::Readdir { dir } => {
                w.field("Directory File-handle", dir);
            }
            Request::Remove { parent, filename } | Request::Lookup { parent, filename } => {
                w.field("Parent File-handle", parent);
                w.field("Filename", filename);
            }
            Request::LookupPath { root, pathname } => {
                w.field("Root File-handle", root);
                w.field("Pathname", pathname);
            }
            Request::GetAlloc { fid, offset } | Request::Allocate { fid, offset } => {
                w.field("File-handle", fid);
                w.field("Chunk-offset", offset);
            }
            Request::GetLayout { fid } => {
                w.field("File-handle", fid);
            }
            Request::Truncate { fid, offset } => {
                w.field("File-handle", fid);
                w.field("Offset", offset);
            }
            Request::Open { chunk_id, flags } => {
                let intent = OpenIntent::from_flags(*flags)?;
                w.field("Chunk-handle", chunk_id);
                w.field("Intent", intent.as_str());
            }
            Request::Close { chunk_id } | Request::LeaseAcquire { chunk_id } => {
                w.field("Chunk-handle", chunk_id);
            }
            Request::Read {
                chunk_id,
                chunk_version,
                offset,
                num_bytes,
            }
            | Request::WritePrepare {
                chunk_id,
                chunk_version,
                offset,
                num_bytes,
            } => {
                w.field("Chunk-handle", chunk_id);
                w.field("Chunk-version", chunk_version);
                w.field("Offset", offset);
                w.field("Num-bytes", num_bytes);
            }
            Request::WriteSync {
                chunk_id,
                chunk_version,
                write_info,
            } => {
                w.field("Chunk-handle", chunk_id);
                w.field("Chunk-version", chunk_version);
                w.field("Num-servers", write_info.len());
                // position in this list identifies the replica's role
                let servers = write_info
                    .iter()
                    .map(|wi| format!("{} {}", wi.server_loc, wi.write_id))
                    .collect::<Vec<_>>()
                    .join(" ");
                w.field("Servers", servers);
            }
            Request::Size {
                chunk_id,
                chunk_version,
            } => {
                w.field("Chunk-handle", chunk_id);
                w.field("Chunk-version", chunk_version);
            }
            Request::LeaseRenew {
                chunk_id,
                lease_id,
                lease_type,
            } => {
                w.field("Chunk-handle", chunk_id);
                w.field("Lease-id", lease_id);
                w.field("Lease-type", lease_type.as_str());
            }
        }
        Ok(w.finish())
    }

    /// Parses an encoded request, as a metaserver or chunk server would.
    ///
    /// Missing fields take the same defaults the response side uses; only an
    /// unknown operation line or a truncated WriteSync server list fails.
    /// Names and paths come back with surrounding whitespace trimmed.
    pub fn decode(text: &str) -> CodecResult<(Seq, Request)> {
        let op_line = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or(CodecError::EmptyRequest)?;
        let kind = OpKind::from_name(op_line)
            .ok_or_else(|| CodecError::UnknownOperation(op_line.to_string()))?;
        let props = Properties::load(text, ':');
        let seq = props.get("Cseq", -1 as Seq);

        let parent = FileId::new(props.get("Parent File-handle", -1));
        let fid = FileId::new(props.get("File-handle", -1));
        let chunk_id = ChunkId::new(props.get("Chunk-handle", -1));
        let chunk_version = props.get("Chunk-version", -1i64);

        let req = match kind {
            OpKind::Create => Request::Create {
                parent,
                filename: props.get_string("Filename", ""),
                num_replicas: props.get("Num-replicas", 1),
            },
            OpKind::Mkdir => Request::Mkdir {
                parent,
                dirname: props.get_string("Directory", ""),
            },
            OpKind::Rmdir => Request::Rmdir {
                parent,
                dirname: props.get_string("Directory", ""),
            },
            OpKind::Rename => Request::Rename {
                parent,
                old_name: props.get_string("Old-name", ""),
                new_path: props.get_string("New-path", ""),
                overwrite: props.get("Overwrite", 0u8) != 0,
            },
            OpKind::Readdir => Request::Readdir {
                dir: FileId::new(props.get("Directory File-handle", -1)),
            },
            OpKind::Remove => Request::Remove {
                parent,
                filename: props.get_string("Filename", ""),
            },
            OpKind::Lookup => Request::Lookup {
                parent,
                filename: props.get_string("Filename", ""),
            },
            OpKind::LookupPath => Request::LookupPath {
                root: FileId::new(props.get("Root File-handle", -1)),
                pathname: props.get_string("Pathname", ""),
            },
            OpKind::GetAlloc => Request::GetAlloc {
                fid,
                offset: props.get("Chunk-offset", 0),
            },
            OpKind::GetLayout => Request::GetLayout { fid },
            OpKind::Allocate => Request::Allocate {
                fid,
                offset: props.get("Chunk-offset", 0),
            },
            OpKind::Truncate => Request::Truncate {
                fid,
                offset: props.get("Offset", 0),
            },
            OpKind::Open => {
                // WRITE cannot tell write-only from read-write apart
                let flags = match props.get_str("Intent") {
                    Some("WRITE") => libc::O_WRONLY,
                    _ => libc::O_RDONLY,
                };
                Request::Open { chunk_id, flags }
            }
            OpKind::Close => Request::Close { chunk_id },
            OpKind::Read => Request::Read {
                chunk_id,
                chunk_version,
                offset: props.get("Offset", 0),
                num_bytes: props.get("Num-bytes", 0),
            },
            OpKind::WritePrepare => Request::WritePrepare {
                chunk_id,
                chunk_version,
                offset: props.get("Offset", 0),
                num_bytes: props.get("Num-bytes", 0),
            },
            OpKind::WriteSync => {
                let count = props.get("Num-servers", 0usize);
                let write_info = parse_write_info(props.get_str("Servers").unwrap_or(""), count)?;
                Request::WriteSync {
                    chunk_id,
                    chunk_version,
                    write_info,
                }
            }
            OpKind::Size => Request::Size {
                chunk_id,
                chunk_version,
            },
            OpKind::LeaseAcquire => Request::LeaseAcquire { chunk_id },
            OpKind::LeaseRenew => Request::LeaseRenew {
                chunk_id,
                lease_id: props.get("Lease-id", -1),
                lease_type: props
                    .get_str("Lease-type")
                    .and_then(LeaseType::parse)
                    .unwrap_or_default(),
            },
        };
        debug!(seq, op = kind.name(), "decoded request");
        Ok((seq, req))
    }
}

fn parse_write_info(servers: &str, count: usize) -> CodecResult<Vec<WriteInfo>> {
    let tokens: Vec<&str> = servers.split_whitespace().collect();
    let mut legs = Vec::new();
    for leg in tokens.chunks(3).take(count) {
        let [host, port, write_id] = leg else {
            break;
        };
        let port = port
            .parse()
            .map_err(|_| CodecError::MalformedLocation(format!("{} {}", host, port)))?;
        let Ok(write_id) = write_id.parse() else {
            break;
        };
        legs.push(WriteInfo::new(ServerLocation::new(*host, port), write_id));
    }
    if legs.len() < count {
        return Err(CodecError::MalformedReplicas {
            expected: count,
            found: legs.len(),
        });
    }
    Ok(legs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_encoding_field_order() {
        let req = Request::Create {
            parent: FileId::new(2),
            filename: "foo".to_string(),
            num_replicas: 3,
        };
        let text = req.encode(11).unwrap();
        assert_eq!(
            text,
            "CREATE\r\nCseq: 11\r\nVersion: KFS/1.0\r\nParent File-handle: 2\r\n\
             Filename: foo\r\nNum-replicas: 3\r\n\r\n"
        );
    }

    #[test]
    fn test_open_intents() {
        for (flags, intent) in [
            (libc::O_RDONLY, "READ"),
            (libc::O_WRONLY, "WRITE"),
            (libc::O_RDWR, "WRITE"),
        ] {
            let req = Request::Open {
                chunk_id: ChunkId::new(5),
                flags,
            };
            let text = req.encode(1).unwrap();
            assert!(text.contains(&format!("Intent: {}\r\n", intent)));
        }
    }

    #[test]
    fn test_open_unsupported_mode_is_rejected() {
        let req = Request::Open {
            chunk_id: ChunkId::new(5),
            flags: libc::O_RDWR | libc::O_CREAT,
        };
        assert_eq!(
            req.encode(1),
            Err(CodecError::UnsupportedOpenMode(libc::O_RDWR | libc::O_CREAT))
        );
        assert!(OpenIntent::from_flags(3).is_err());
    }

    #[test]
    fn test_write_sync_preserves_leg_order() {
        let req = Request::WriteSync {
            chunk_id: ChunkId::new(9),
            chunk_version: 4,
            write_info: vec![
                WriteInfo::new(ServerLocation::new("h2", 200), 71),
                WriteInfo::new(ServerLocation::new("h1", 100), 70),
            ],
        };
        let text = req.encode(3).unwrap();
        assert!(text.contains("Num-servers: 2\r\n"));
        assert!(text.contains("Servers: h2 200 71 h1 100 70\r\n"));

        let (_, decoded) = Request::decode(&text).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_write_sync_truncated_server_list() {
        let text = "WRITE_SYNC\r\nCseq: 1\r\nNum-servers: 2\r\nServers: h1 100 7\r\n\r\n";
        assert_eq!(
            Request::decode(text),
            Err(CodecError::MalformedReplicas {
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn test_lease_renew_carries_read_lease() {
        let req = Request::LeaseRenew {
            chunk_id: ChunkId::new(8),
            lease_id: 1234,
            lease_type: LeaseType::Read,
        };
        let text = req.encode(2).unwrap();
        assert!(text.ends_with("Lease-id: 1234\r\nLease-type: READ_LEASE\r\n\r\n"));
    }

    #[test]
    fn test_decode_unknown_operation() {
        assert_eq!(
            Request::decode("FROB\r\nCseq: 1\r\n\r\n"),
            Err(CodecError::UnknownOperation("FROB".to_string()))
        );
        assert_eq!(Request::decode("\r\n"), Err(CodecError::EmptyRequest));
    }

    #[test]
    fn test_mutating_kinds() {
        let mutating: Vec<_> = OpKind::ALL.iter().filter(|k| k.is_mutating()).collect();
        assert_eq!(mutating.len(), 7);
        assert!(!OpKind::Lookup.is_mutating());
        assert!(OpKind::Allocate.is_mutating());
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in OpKind::ALL {
            assert_eq!(OpKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn test_request_json_form_is_stable() {
        let req = Request::Rename {
            parent: FileId::ROOT,
            old_name: "a".to_string(),
            new_path: "/b".to_string(),
            overwrite: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"Rename":{"parent":2,"old_name":"a","new_path":"/b","overwrite":false}}"#
        );
        assert_eq!(serde_json::from_str::<Request>(&json).unwrap(), req);
    }

    #[test]
    fn test_decode_oversized_server_count() {
        let text = "WRITE_SYNC\r\nCseq: 5\r\nChunk-handle: 3\r\n\
                    Num-servers: 18446744073709551615\r\nServers: h1 100 7\r\n\r\n";
        assert_eq!(
            Request::decode(text),
            Err(CodecError::MalformedReplicas {
                expected: usize::MAX,
                found: 1
            })
        );
    }

    #[test]
    fn test_decode_trims_name_whitespace() {
        let req = Request::Create {
            parent: FileId::ROOT,
            filename: "  spaced name ".to_string(),
            num_replicas: 1,
        };
        let (_, decoded) = Request::decode(&req.encode(1).unwrap()).unwrap();
        assert_eq!(
            decoded,
            Request::Create {
                parent: FileId::ROOT,
                filename: "spaced name".to_string(),
                num_replicas: 1,
            }
        );
    }
}

//! Response side of the KFS protocol.
//!
//! Response headers are loaded into a [`Properties`] map and read with typed
//! defaults, so a missing or garbled scalar field never fails a decode. Lists
//! are the exception: a replica list or layout body that is shorter than its
//! advertised count is reported as an error rather than handed back partial.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, warn};

use crate::error::{CodecError, CodecResult};
use crate::lease::ChunkAlloc;
use crate::properties::Properties;
use crate::request::OpKind;
use crate::types::*;

/// Fields common to every response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Echo of the request's `Cseq`; -1 when absent.
    pub seq: Seq,
    /// Application status from the peer; 0 is success, -1 when absent.
    pub status: i32,
    /// Length of the raw body following the header block.
    pub content_length: usize,
}

impl ResponseHeader {
    /// A successful header for `seq`.
    pub fn ok(seq: Seq) -> Self {
        Self {
            seq,
            status: 0,
            content_length: 0,
        }
    }

    /// Whether the peer reported success.
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    fn from_props(props: &Properties) -> Self {
        Self {
            seq: props.get("Cseq", -1),
            status: props.get("Status", -1),
            content_length: props.get("Content-length", 0),
        }
    }
}

/// Operation-specific response payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Handle of the created file.
    Create {
        /// New file handle.
        file_id: FileId,
    },
    /// Handle of the created directory.
    Mkdir {
        /// New directory handle.
        file_id: FileId,
    },
    /// Directory listing size; entries follow in the body.
    Readdir {
        /// Number of entries.
        num_entries: i32,
    },
    /// Attributes of the looked-up entry.
    Lookup {
        /// Entry attributes.
        attr: FileAttr,
    },
    /// Attributes of the resolved path.
    LookupPath {
        /// Entry attributes.
        attr: FileAttr,
    },
    /// A fresh allocation, master replica first.
    Allocate(ChunkAlloc),
    /// The current allocation, replicas in server order.
    GetAlloc(ChunkAlloc),
    /// Chunk layout of a file.
    GetLayout {
        /// Advertised number of chunks.
        num_chunks: usize,
        /// Parsed layout, filled in by [`Reply::parse_layout_info`].
        chunks: Vec<ChunkLayoutInfo>,
    },
    /// Chunk size.
    Size {
        /// Size in bytes.
        size: i64,
    },
    /// Write id for the staged data.
    WritePrepare {
        /// Id to pass back in WriteSync.
        write_id: i64,
    },
    /// Granted lease.
    LeaseAcquire {
        /// Lease id; -1 when absent.
        lease_id: i64,
    },
    /// Operations whose reply carries only the common fields.
    Empty(OpKind),
}

impl Response {
    /// The operation this payload answers.
    pub fn kind(&self) -> OpKind {
        match self {
            Response::Create { .. } => OpKind::Create,
            Response::Mkdir { .. } => OpKind::Mkdir,
            Response::Readdir { .. } => OpKind::Readdir,
            Response::Lookup { .. } => OpKind::Lookup,
            Response::LookupPath { .. } => OpKind::LookupPath,
            Response::Allocate(_) => OpKind::Allocate,
            Response::GetAlloc(_) => OpKind::GetAlloc,
            Response::GetLayout { .. } => OpKind::GetLayout,
            Response::Size { .. } => OpKind::Size,
            Response::WritePrepare { .. } => OpKind::WritePrepare,
            Response::LeaseAcquire { .. } => OpKind::LeaseAcquire,
            Response::Empty(kind) => *kind,
        }
    }

    /// Renders the GetLayout body: per chunk
    /// `offset chunkId chunkVersion numServers (host port)*`.
    pub fn layout_body(&self) -> Option<String> {
        let Response::GetLayout { chunks, .. } = self else {
            return None;
        };
        let mut body = String::new();
        for chunk in chunks {
            let _ = write!(
                body,
                "{} {} {} {}",
                chunk.file_offset,
                chunk.chunk_id,
                chunk.chunk_version,
                chunk.chunk_servers.len()
            );
            for server in &chunk.chunk_servers {
                let _ = write!(body, " {}", server);
            }
            body.push(' ');
        }
        Some(body.trim_end().to_string())
    }
}

/// A decoded response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Common fields.
    pub header: ResponseHeader,
    /// Operation-specific fields.
    pub body: Response,
}

impl Reply {
    /// Creates a reply.
    pub fn new(header: ResponseHeader, body: Response) -> Self {
        Self { header, body }
    }

    /// Decodes the header block of a response to a `kind` request.
    pub fn decode(kind: OpKind, text: &str) -> CodecResult<Self> {
        let props = Properties::load(text, ':');
        let header = ResponseHeader::from_props(&props);

        let body = match kind {
            OpKind::Create => Response::Create {
                file_id: FileId::new(props.get("File-handle", -1)),
            },
            OpKind::Mkdir => Response::Mkdir {
                file_id: FileId::new(props.get("File-handle", -1)),
            },
            OpKind::Readdir => Response::Readdir {
                num_entries: props.get("Num-Entries", 0),
            },
            OpKind::Lookup => Response::Lookup {
                attr: parse_file_attr(&props),
            },
            OpKind::LookupPath => Response::LookupPath {
                attr: parse_file_attr(&props),
            },
            OpKind::Allocate => Response::Allocate(parse_allocate(&props)?),
            OpKind::GetAlloc => Response::GetAlloc(parse_get_alloc(&props)?),
            OpKind::GetLayout => Response::GetLayout {
                num_chunks: props.get("Num-chunks", 0),
                chunks: Vec::new(),
            },
            OpKind::Size => Response::Size {
                size: props.get("Size", 0),
            },
            OpKind::WritePrepare => Response::WritePrepare {
                write_id: props.get("Write-id", 0),
            },
            OpKind::LeaseAcquire => Response::LeaseAcquire {
                lease_id: props.get("Lease-id", -1),
            },
            other => Response::Empty(other),
        };

        debug!(
            seq = header.seq,
            status = header.status,
            op = kind.name(),
            "decoded response header"
        );
        Ok(Self { header, body })
    }

    /// Second pass for GetLayout: parses the content body into chunk layouts.
    ///
    /// A no-op for every other operation, and when no chunks were advertised.
    /// A missing body with chunks advertised leaves the layout empty.
    pub fn parse_layout_info(&mut self, content: Option<&str>) -> CodecResult<()> {
        let Response::GetLayout { num_chunks, chunks } = &mut self.body else {
            return Ok(());
        };
        if *num_chunks == 0 {
            return Ok(());
        }
        let Some(content) = content else {
            warn!(
                num_chunks = *num_chunks,
                "layout response advertised chunks but carried no body"
            );
            return Ok(());
        };

        let mut tokens = content.split_whitespace();
        let mut parsed = Vec::new();
        for i in 0..*num_chunks {
            parsed.push(parse_layout_entry(&mut tokens, i)?);
        }
        *chunks = parsed;
        debug!(num_chunks = chunks.len(), "parsed layout body");
        Ok(())
    }

    /// Encodes the response header block, as a server would send it.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(128);
        let content_length = match self.body.layout_body() {
            Some(body) if !body.is_empty() => body.len(),
            _ => self.header.content_length,
        };
        out.push_str("OK\r\n");
        push_field(&mut out, "Cseq", self.header.seq);
        push_field(&mut out, "Status", self.header.status);
        if content_length > 0 {
            push_field(&mut out, "Content-length", content_length);
        }
        match &self.body {
            Response::Create { file_id } | Response::Mkdir { file_id } => {
                push_field(&mut out, "File-handle", file_id);
            }
            Response::Readdir { num_entries } => {
                push_field(&mut out, "Num-Entries", num_entries);
            }
            Response::Lookup { attr } | Response::LookupPath { attr } => {
                push_field(&mut out, "File-handle", attr.file_id);
                let ftype = if attr.is_directory {
                    DIRECTORY_TYPE
                } else {
                    "file"
                };
                push_field(&mut out, "Type", ftype);
                push_field(&mut out, "Chunk-count", attr.chunk_count);
                push_field(&mut out, "Replication", attr.num_replicas);
                push_field(&mut out, "M-Time", attr.mtime);
                push_field(&mut out, "C-Time", attr.ctime);
                push_field(&mut out, "CR-Time", attr.crtime);
            }
            Response::Allocate(alloc) | Response::GetAlloc(alloc) => {
                push_field(&mut out, "Chunk-handle", alloc.chunk_id);
                push_field(&mut out, "Chunk-version", alloc.chunk_version);
                if let Some(master) = &alloc.master {
                    push_field(&mut out, "Master", master);
                }
                push_field(&mut out, "Num-replicas", alloc.servers.len());
                let replicas = alloc
                    .servers
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                push_field(&mut out, "Replicas", replicas);
            }
            Response::GetLayout { chunks, .. } => {
                push_field(&mut out, "Num-chunks", chunks.len());
            }
            Response::Size { size } => push_field(&mut out, "Size", size),
            Response::WritePrepare { write_id } => push_field(&mut out, "Write-id", write_id),
            Response::LeaseAcquire { lease_id } => push_field(&mut out, "Lease-id", lease_id),
            Response::Empty(_) => {}
        }
        out.push_str("\r\n");
        out
    }
}

fn push_field(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = write!(out, "{}: {}\r\n", key, value);
}

fn parse_file_attr(props: &Properties) -> FileAttr {
    FileAttr {
        file_id: FileId::new(props.get("File-handle", -1)),
        is_directory: props.get_str("Type") == Some(DIRECTORY_TYPE),
        chunk_count: props.get("Chunk-count", 0),
        num_replicas: props.get("Replication", 1),
        mtime: Timeval::parse_lenient(props.get_str("M-Time").unwrap_or("")),
        ctime: Timeval::parse_lenient(props.get_str("C-Time").unwrap_or("")),
        crtime: Timeval::parse_lenient(props.get_str("CR-Time").unwrap_or("")),
    }
}

fn parse_replicas(props: &Properties) -> CodecResult<Vec<ServerLocation>> {
    let count = props.get("Num-replicas", 0usize);
    let replicas = props.get_str("Replicas").unwrap_or("");
    ServerLocation::take_list(&mut replicas.split_whitespace(), count)
}

fn parse_allocate(props: &Properties) -> CodecResult<ChunkAlloc> {
    let master = match props.get_str("Master") {
        Some(m) if !m.is_empty() => Some(ServerLocation::parse(m)?),
        _ => None,
    };

    // the master leads the list; clients send the first write phase to servers[0]
    let mut servers: Vec<ServerLocation> = master.iter().cloned().collect();
    for loc in parse_replicas(props)? {
        if master.as_ref() != Some(&loc) {
            servers.push(loc);
        }
    }

    Ok(ChunkAlloc {
        chunk_id: ChunkId::new(props.get("Chunk-handle", -1)),
        chunk_version: props.get("Chunk-version", -1),
        master,
        servers,
    })
}

fn parse_get_alloc(props: &Properties) -> CodecResult<ChunkAlloc> {
    Ok(ChunkAlloc {
        chunk_id: ChunkId::new(props.get("Chunk-handle", -1)),
        chunk_version: props.get("Chunk-version", -1),
        master: None,
        servers: parse_replicas(props)?,
    })
}

fn parse_layout_entry<'a, I>(tokens: &mut I, index: usize) -> CodecResult<ChunkLayoutInfo>
where
    I: Iterator<Item = &'a str>,
{
    let mut next_num = |what: &str| -> CodecResult<i64> {
        tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| CodecError::MalformedLayout {
                chunk: index,
                reason: format!("missing or invalid {}", what),
            })
    };
    let file_offset = next_num("offset")?;
    let chunk_id = ChunkId::new(next_num("chunk id")?);
    let chunk_version = next_num("chunk version")?;
    let num_servers = next_num("server count")?;
    let num_servers = usize::try_from(num_servers).map_err(|_| CodecError::MalformedLayout {
        chunk: index,
        reason: format!("negative server count {}", num_servers),
    })?;

    let chunk_servers =
        ServerLocation::take_list(tokens, num_servers).map_err(|e| CodecError::MalformedLayout {
            chunk: index,
            reason: e.to_string(),
        })?;

    Ok(ChunkLayoutInfo {
        file_offset,
        chunk_id,
        chunk_version,
        chunk_servers,
    })
}

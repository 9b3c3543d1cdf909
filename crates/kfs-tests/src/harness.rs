//! Test Harness - temporary metaserver directories and sample protocol values

use std::path::Path;
use std::sync::Arc;

use kfs_client::{
    ChunkAlloc, ChunkId, ChunkLayoutInfo, FileAttr, FileId, LeaseType, Reply, Request, Response,
    ResponseHeader, ServerLocation, Timeval, WriteInfo,
};
use kfs_meta::{recover, LoggerConfig, MetaRequest, MetaResult, OpLog, RecoveryPoint};
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// A metaserver data directory that outlives individual log instances,
/// so a test can stop a log and recover from what it left on disk.
#[derive(Debug)]
pub struct MetaTestEnv {
    temp_dir: TempDir,
    config: LoggerConfig,
}

/// A recovered log with its worker running.
pub struct RunningLog {
    pub log: Arc<OpLog>,
    pub worker: JoinHandle<MetaResult<()>>,
    pub recovery: RecoveryPoint,
}

impl MetaTestEnv {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = LoggerConfig::with_root(temp_dir.path());
        config.sync_on_commit = false;
        Self { temp_dir, config }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    /// Recovers from the directories and primes a new, unstarted log.
    pub fn recover_log(&self) -> MetaResult<(Arc<OpLog>, RecoveryPoint)> {
        let point = recover(&self.config)?;
        let log = Arc::new(OpLog::new(self.config.clone()));
        log.set_seqno(point.last_seqno);
        tracing::debug!(last_seqno = point.last_seqno, "test log recovered");
        Ok((log, point))
    }

    /// Recovers and starts the log worker. Must be called inside a runtime.
    pub fn boot(&self) -> MetaResult<RunningLog> {
        let (log, recovery) = self.recover_log()?;
        let worker = log.start();
        Ok(RunningLog {
            log,
            worker,
            recovery,
        })
    }
}

impl Default for MetaTestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningLog {
    /// Closes the log and waits for the worker to persist what was queued.
    pub async fn shutdown(self) -> MetaResult<Arc<OpLog>> {
        self.log.close();
        self.worker.await.expect("log worker panicked")?;
        Ok(self.log)
    }
}

/// A mutating request that creates `name` under the root.
pub fn create_request(name: &str) -> MetaRequest {
    MetaRequest::new(
        1,
        Request::Create {
            parent: FileId::ROOT,
            filename: name.to_string(),
            num_replicas: 3,
        },
    )
    .expect("create is mutating")
}

pub fn loc(host: &str, port: i32) -> ServerLocation {
    ServerLocation::new(host, port)
}

/// One request of every operation kind.
pub fn sample_requests() -> Vec<Request> {
    let fid = FileId::new(1001);
    let chunk_id = ChunkId::new(77);
    vec![
        Request::Create {
            parent: FileId::ROOT,
            filename: "report.txt".to_string(),
            num_replicas: 3,
        },
        Request::Mkdir {
            parent: FileId::ROOT,
            dirname: "docs".to_string(),
        },
        Request::Rmdir {
            parent: FileId::ROOT,
            dirname: "old".to_string(),
        },
        Request::Rename {
            parent: FileId::ROOT,
            old_name: "a.txt".to_string(),
            new_path: "/docs/b.txt".to_string(),
            overwrite: true,
        },
        Request::Readdir { dir: FileId::ROOT },
        Request::Remove {
            parent: FileId::ROOT,
            filename: "tmp.bin".to_string(),
        },
        Request::Lookup {
            parent: FileId::ROOT,
            filename: "docs".to_string(),
        },
        Request::LookupPath {
            root: FileId::ROOT,
            pathname: "/docs/b.txt".to_string(),
        },
        Request::GetAlloc {
            fid,
            offset: 67_108_864,
        },
        Request::GetLayout { fid },
        Request::Allocate { fid, offset: 0 },
        Request::Truncate { fid, offset: 4096 },
        Request::Open {
            chunk_id,
            flags: libc::O_WRONLY,
        },
        Request::Close { chunk_id },
        Request::Read {
            chunk_id,
            chunk_version: 4,
            offset: 0,
            num_bytes: 65536,
        },
        Request::WritePrepare {
            chunk_id,
            chunk_version: 4,
            offset: 8192,
            num_bytes: 4096,
        },
        Request::WriteSync {
            chunk_id,
            chunk_version: 4,
            write_info: vec![
                WriteInfo::new(loc("cs1", 30000), 501),
                WriteInfo::new(loc("cs2", 30000), 502),
            ],
        },
        Request::Size {
            chunk_id,
            chunk_version: 4,
        },
        Request::LeaseAcquire { chunk_id },
        Request::LeaseRenew {
            chunk_id,
            lease_id: 9001,
            lease_type: LeaseType::Read,
        },
    ]
}

/// Replies a server would send, one per distinct response shape.
pub fn sample_replies() -> Vec<Reply> {
    let alloc = ChunkAlloc {
        chunk_id: ChunkId::new(77),
        chunk_version: 5,
        master: Some(loc("cs1", 30000)),
        servers: vec![loc("cs1", 30000), loc("cs2", 30001), loc("cs3", 30002)],
    };
    let attr = FileAttr {
        file_id: FileId::new(1001),
        is_directory: false,
        chunk_count: 2,
        num_replicas: 3,
        mtime: Timeval::new(1_700_000_000, 250),
        ctime: Timeval::new(1_700_000_001, 0),
        crtime: Timeval::new(1_699_999_999, 999_999),
    };
    let chunks = vec![
        ChunkLayoutInfo {
            file_offset: 0,
            chunk_id: ChunkId::new(77),
            chunk_version: 5,
            chunk_servers: vec![loc("cs1", 30000), loc("cs2", 30001)],
        },
        ChunkLayoutInfo {
            file_offset: 67_108_864,
            chunk_id: ChunkId::new(78),
            chunk_version: 1,
            chunk_servers: vec![loc("cs3", 30002)],
        },
    ];
    let layout = Response::GetLayout {
        num_chunks: chunks.len(),
        chunks,
    };
    let layout_len = layout.layout_body().map_or(0, |b| b.len());

    let ok = ResponseHeader::ok;
    vec![
        Reply::new(ok(1), Response::Create { file_id: FileId::new(1001) }),
        Reply::new(ok(2), Response::Mkdir { file_id: FileId::new(1002) }),
        Reply::new(ok(3), Response::Readdir { num_entries: 12 }),
        Reply::new(ok(4), Response::Lookup { attr: attr.clone() }),
        Reply::new(
            ok(5),
            Response::LookupPath {
                attr: FileAttr {
                    is_directory: true,
                    ..attr
                },
            },
        ),
        Reply::new(ok(6), Response::Allocate(alloc.clone())),
        Reply::new(
            ok(7),
            Response::GetAlloc(ChunkAlloc {
                master: None,
                ..alloc
            }),
        ),
        Reply::new(
            ResponseHeader {
                content_length: layout_len,
                ..ok(8)
            },
            layout,
        ),
        Reply::new(ok(9), Response::Size { size: 1_048_576 }),
        Reply::new(ok(10), Response::WritePrepare { write_id: 501 }),
        Reply::new(ok(11), Response::LeaseAcquire { lease_id: 9001 }),
        Reply::new(
            ResponseHeader {
                status: -22,
                ..ok(12)
            },
            Response::Empty(kfs_client::OpKind::LeaseRenew),
        ),
    ]
}

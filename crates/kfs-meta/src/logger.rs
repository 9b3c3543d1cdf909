//! Write-ahead operation log.
//!
//! Mutating requests are queued on `pending`, given a sequence number by the
//! single log worker as they are dequeued, appended to the active log file,
//! and then handed on through `logged`. The order requests leave `pending`
//! is their sequence order, and `logged` preserves it.
//!
//! Log files are named `log.<n>` under the configured directory, with `n`
//! strictly increasing. Each file starts with a header line recording the
//! first sequence number it may contain, followed by one JSON record per
//! logged request.
//!
//! Watermarks:
//! - `nextseq`: last sequence number handed out
//! - `committed`: highest sequence number known to be on disk
//! - `checkpointed`: highest sequence number covered by a checkpoint
//!
//! `checkpointed <= committed <= nextseq` at all times.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::LoggerConfig;
use crate::error::{MetaError, MetaResult};
use crate::request::{MetaRequest, RequestState, SeqNo};

/// Log file format version.
pub const LOG_VERSION: u32 = 1;

const LOG_PREFIX: &str = "log.";

/// Lifecycle of the active log file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogState {
    /// No log file has been started yet.
    Unstarted,
    /// A log file is open for appends.
    Active,
    /// The last log file was finished; the next `start_log` opens a new one.
    Rotating,
}

/// First line of every log file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    /// Log format version.
    pub version: u32,
    /// Sequence number of the first record this file may contain.
    pub start_seqno: SeqNo,
}

/// Posted by the log worker once it has rotated the log for a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointTicket {
    /// Every request with a sequence number up to this one is in `logged`.
    pub covered: SeqNo,
    /// The log file that was finished.
    pub finished_log: PathBuf,
    /// The log file now receiving appends.
    pub next_log: PathBuf,
}

/// Path of log file number `n` in `dir`.
pub fn log_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{}{}", LOG_PREFIX, n))
}

/// Parses the number out of a `log.<n>` file name.
pub fn parse_log_name(name: &str) -> Option<u64> {
    name.strip_prefix(LOG_PREFIX)?.parse().ok()
}

/// Log file numbers present in `dir`, ascending. A missing directory has none.
pub fn list_logs(dir: &Path) -> MetaResult<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut nums = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(n) = entry.file_name().to_str().and_then(parse_log_name) {
            nums.push(n);
        }
    }
    nums.sort_unstable();
    Ok(nums)
}

struct LogFile {
    state: LogState,
    lognum: Option<u64>,
    name: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

/// The metaserver's operation log.
///
/// Shared behind an `Arc`; the worker spawned by [`OpLog::start`] is the only
/// writer of the active log file.
pub struct OpLog {
    config: LoggerConfig,
    nextseq: AtomicU64,
    committed: AtomicU64,
    incp: AtomicU64,
    file: Mutex<LogFile>,
    pending_tx: Mutex<Option<mpsc::UnboundedSender<MetaRequest>>>,
    pending_rx: AsyncMutex<mpsc::UnboundedReceiver<MetaRequest>>,
    logged_tx: Mutex<Option<mpsc::UnboundedSender<MetaRequest>>>,
    logged_rx: AsyncMutex<mpsc::UnboundedReceiver<MetaRequest>>,
    cpdone_tx: Mutex<Option<mpsc::UnboundedSender<CheckpointTicket>>>,
    cpdone_rx: AsyncMutex<mpsc::UnboundedReceiver<CheckpointTicket>>,
}

impl OpLog {
    /// Creates an unstarted log. Call [`OpLog::set_seqno`] after recovery and
    /// before [`OpLog::start`].
    pub fn new(config: LoggerConfig) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (logged_tx, logged_rx) = mpsc::unbounded_channel();
        let (cpdone_tx, cpdone_rx) = mpsc::unbounded_channel();
        debug!(log_dir = %config.log_dir.display(), "creating operation log");
        Self {
            config,
            nextseq: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            incp: AtomicU64::new(0),
            file: Mutex::new(LogFile {
                state: LogState::Unstarted,
                lognum: None,
                name: None,
                writer: None,
            }),
            pending_tx: Mutex::new(Some(pending_tx)),
            pending_rx: AsyncMutex::new(pending_rx),
            logged_tx: Mutex::new(Some(logged_tx)),
            logged_rx: AsyncMutex::new(logged_rx),
            cpdone_tx: Mutex::new(Some(cpdone_tx)),
            cpdone_rx: AsyncMutex::new(cpdone_rx),
        }
    }

    /// The configuration this log was created with.
    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LogState {
        self.file.lock().state
    }

    /// Path of the current (or last finished) log file.
    pub fn name(&self) -> Option<PathBuf> {
        self.file.lock().name.clone()
    }

    /// Last sequence number handed out.
    pub fn nextseq(&self) -> SeqNo {
        self.nextseq.load(Ordering::SeqCst)
    }

    /// Highest sequence number known to be on disk.
    pub fn committed(&self) -> SeqNo {
        self.committed.load(Ordering::SeqCst)
    }

    /// Highest sequence number included in the most recent checkpoint.
    pub fn checkpointed(&self) -> SeqNo {
        self.incp.load(Ordering::SeqCst)
    }

    /// Whether `req` is on disk.
    pub fn is_committed(&self, req: &MetaRequest) -> bool {
        req.seqno != 0 && req.seqno <= self.committed()
    }

    /// Primes every watermark with `last`, the highest sequence number found
    /// by recovery. Numbers up to `last` count as committed and are never
    /// handed out again.
    pub fn set_seqno(&self, last: SeqNo) {
        self.incp.store(last, Ordering::SeqCst);
        self.committed.store(last, Ordering::SeqCst);
        self.nextseq.store(last, Ordering::SeqCst);
        info!(seqno = last, "primed log sequence numbers");
    }

    pub(crate) fn set_checkpointed(&self, seqno: SeqNo) {
        debug_assert!(seqno <= self.committed());
        self.incp.fetch_max(seqno, Ordering::SeqCst);
    }

    /// Queues an unsequenced request. Fails only once the log is closed.
    pub fn add_pending(&self, mut req: MetaRequest) -> MetaResult<()> {
        req.seqno = 0;
        req.state = RequestState::Pending;
        let tx = self.pending_tx.lock();
        let tx = tx.as_ref().ok_or(MetaError::Closed)?;
        tx.send(req).map_err(|_| MetaError::Closed)
    }

    /// Waits for the next pending request and assigns it the next sequence
    /// number. Checkpoint markers are passed through unnumbered. Returns None
    /// once the log is closed and the queue is empty.
    pub async fn get_pending(&self) -> Option<MetaRequest> {
        let mut rx = self.pending_rx.lock().await;
        let mut req = rx.recv().await?;
        if !req.is_checkpoint() {
            req.seqno = self.nextseq.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(seqno = req.seqno, "assigned sequence number");
        }
        Some(req)
    }

    /// Appends `req` to the active log file, makes it durable, advances
    /// `committed` and moves the request to `logged`.
    pub fn log(&self, mut req: MetaRequest) -> MetaResult<()> {
        {
            let mut file = self.file.lock();
            let state = file.state;
            let writer = match (state, file.writer.as_mut()) {
                (LogState::Active, Some(w)) => w,
                _ => return Err(MetaError::LogNotActive { state }),
            };
            req.log(writer)?;
            writer.flush()?;
            if self.config.sync_on_commit {
                writer.get_ref().sync_data()?;
            }
        }
        self.committed.fetch_max(req.seqno, Ordering::SeqCst);
        debug!(seqno = req.seqno, "logged request");
        req.state = RequestState::Logged;
        self.add_logged(req);
        Ok(())
    }

    /// Hands a request to the result consumers.
    pub fn add_logged(&self, req: MetaRequest) {
        let tx = self.logged_tx.lock();
        match tx.as_ref() {
            Some(tx) if tx.send(req).is_ok() => {}
            _ => warn!("logged queue closed, dropping result"),
        }
    }

    /// Waits for the next logged request. Returns None once the worker has
    /// stopped and every result has been taken.
    ///
    /// The [`CheckpointManager`](crate::CheckpointManager) is the only
    /// consumer; it must see every logged request to complete a checkpoint.
    pub(crate) async fn next_result(&self) -> Option<MetaRequest> {
        self.logged_rx.lock().await.recv().await
    }

    /// Takes the next logged request if one is ready.
    pub(crate) fn next_result_nowait(&self) -> Option<MetaRequest> {
        self.logged_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Posts a completed log rotation for the checkpointer.
    pub(crate) fn save_cp(&self, ticket: CheckpointTicket) {
        let tx = self.cpdone_tx.lock();
        match tx.as_ref() {
            Some(tx) if tx.send(ticket).is_ok() => {}
            _ => warn!("checkpoint queue closed, dropping ticket"),
        }
    }

    /// Waits for the worker to rotate the log for a requested checkpoint.
    pub(crate) async fn wait_for_cp(&self) -> Option<CheckpointTicket> {
        self.cpdone_rx.lock().await.recv().await
    }

    /// Opens a new log file whose records start at `seqno`.
    pub fn start_log(&self, seqno: SeqNo) -> MetaResult<PathBuf> {
        let mut file = self.file.lock();
        if file.state == LogState::Active {
            return Err(MetaError::InvalidTransition {
                from: LogState::Active,
                to: LogState::Active,
            });
        }

        fs::create_dir_all(&self.config.log_dir)?;
        let lognum = match file.lognum {
            Some(n) => n + 1,
            None => list_logs(&self.config.log_dir)?
                .last()
                .map_or(0, |n| n + 1),
        };
        let path = log_path(&self.config.log_dir, lognum);
        let handle = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut writer = BufWriter::new(handle);
        let header = LogHeader {
            version: LOG_VERSION,
            start_seqno: seqno,
        };
        serde_json::to_writer(&mut writer, &header)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        file.state = LogState::Active;
        file.lognum = Some(lognum);
        file.name = Some(path.clone());
        file.writer = Some(writer);
        info!(log = %path.display(), start_seqno = seqno, "started log file");
        Ok(path)
    }

    /// Flushes and closes the active log file so a checkpoint can read a
    /// consistent on-disk state.
    pub fn finish_log(&self) -> MetaResult<PathBuf> {
        let mut file = self.file.lock();
        if file.state != LogState::Active {
            return Err(MetaError::InvalidTransition {
                from: file.state,
                to: LogState::Rotating,
            });
        }
        if let Some(mut writer) = file.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        file.state = LogState::Rotating;
        let name = file.name.clone().unwrap_or_default();
        info!(log = %name.display(), committed = self.committed(), "finished log file");
        Ok(name)
    }

    /// Stops accepting submissions. The worker still logs everything queued
    /// before the call, then finishes the active file and exits.
    pub fn close(&self) {
        if self.pending_tx.lock().take().is_some() {
            info!(nextseq = self.nextseq(), "closing operation log");
        }
    }

    /// Whether [`OpLog::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.pending_tx.lock().is_none()
    }

    pub(crate) fn submit_checkpoint(&self) -> MetaResult<()> {
        let tx = self.pending_tx.lock();
        let tx = tx.as_ref().ok_or(MetaError::Closed)?;
        tx.send(MetaRequest::checkpoint_marker())
            .map_err(|_| MetaError::Closed)
    }

    /// Spawns the log worker. It owns the active log file until it returns;
    /// an I/O failure ends it with the error and closes the log, so later
    /// submissions fail with [`MetaError::Closed`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<MetaResult<()>> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            let result = log.run().await;
            if let Err(e) = &result {
                log.pending_tx.lock().take();
                let mut rx = log.pending_rx.lock().await;
                let mut dropped = 0usize;
                while rx.try_recv().is_ok() {
                    dropped += 1;
                }
                error!(
                    error = %e,
                    committed = log.committed(),
                    dropped,
                    "log writer stopped"
                );
            }
            // wake consumers waiting on results or checkpoints
            log.logged_tx.lock().take();
            log.cpdone_tx.lock().take();
            result
        })
    }

    async fn run(self: &Arc<Self>) -> MetaResult<()> {
        if self.state() != LogState::Active {
            let seqno = self.committed() + 1;
            self.blocking(move |log| log.start_log(seqno).map(drop)).await?;
        }
        while let Some(req) = self.get_pending().await {
            if req.is_checkpoint() {
                self.blocking(OpLog::rotate).await?;
            } else {
                self.blocking(move |log| log.log(req)).await?;
            }
        }
        self.blocking(|log| log.finish_log().map(drop)).await?;
        info!(committed = self.committed(), "log writer drained");
        Ok(())
    }

    /// Runs file I/O off the async worker threads.
    async fn blocking<T, F>(self: &Arc<Self>, f: F) -> MetaResult<T>
    where
        F: FnOnce(&OpLog) -> MetaResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let log = Arc::clone(self);
        task::spawn_blocking(move || f(&log))
            .await
            .map_err(|e| MetaError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
    }

    fn rotate(&self) -> MetaResult<()> {
        let covered = self.committed();
        let finished_log = self.finish_log()?;
        let next_log = self.start_log(covered + 1)?;
        self.save_cp(CheckpointTicket {
            covered,
            finished_log,
            next_log,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::LogRecord;
    use kfs_client::{FileId, Request};
    use tempfile::TempDir;

    fn test_log(dir: &TempDir) -> Arc<OpLog> {
        Arc::new(OpLog::new(LoggerConfig::with_root(dir.path())))
    }

    fn create(name: &str) -> MetaRequest {
        MetaRequest::new(
            1,
            Request::Create {
                parent: FileId::ROOT,
                filename: name.to_string(),
                num_replicas: 3,
            },
        )
        .unwrap()
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_log_file_names() {
        assert_eq!(log_path(Path::new("/x"), 7), PathBuf::from("/x/log.7"));
        assert_eq!(parse_log_name("log.12"), Some(12));
        assert_eq!(parse_log_name("log.x"), None);
        assert_eq!(parse_log_name("chkpt.3"), None);
    }

    #[tokio::test]
    async fn test_sequence_numbers_start_at_one() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        for i in 0..3 {
            log.add_pending(create(&format!("f{}", i))).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(log.get_pending().await.unwrap().seqno);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(log.nextseq(), 3);
        assert_eq!(log.committed(), 0);
    }

    #[tokio::test]
    async fn test_log_requires_active_state() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        log.add_pending(create("a")).unwrap();
        let req = log.get_pending().await.unwrap();
        let err = log.log(req).unwrap_err();
        assert!(matches!(
            err,
            MetaError::LogNotActive {
                state: LogState::Unstarted
            }
        ));
        assert_eq!(log.committed(), 0);
    }

    #[test]
    fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        assert_eq!(log.state(), LogState::Unstarted);
        assert!(log.finish_log().is_err());

        let first = log.start_log(1).unwrap();
        assert_eq!(log.state(), LogState::Active);
        assert!(matches!(
            log.start_log(1),
            Err(MetaError::InvalidTransition { .. })
        ));

        let finished = log.finish_log().unwrap();
        assert_eq!(first, finished);
        assert_eq!(log.state(), LogState::Rotating);

        let second = log.start_log(1).unwrap();
        assert_eq!(first.file_name().unwrap(), "log.0");
        assert_eq!(second.file_name().unwrap(), "log.1");
        assert_eq!(list_logs(&log.config().log_dir).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_start_log_continues_after_existing_files() {
        let dir = TempDir::new().unwrap();
        {
            let log = test_log(&dir);
            log.start_log(1).unwrap();
            log.finish_log().unwrap();
            log.start_log(1).unwrap();
            log.finish_log().unwrap();
        }
        let log = test_log(&dir);
        let path = log.start_log(1).unwrap();
        assert_eq!(path.file_name().unwrap(), "log.2");
    }

    #[tokio::test]
    async fn test_log_appends_record_and_commits() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let path = log.start_log(1).unwrap();

        log.add_pending(create("a")).unwrap();
        let req = log.get_pending().await.unwrap();
        let queued = req.clone();
        assert!(!log.is_committed(&queued));

        log.log(req).unwrap();
        assert!(log.is_committed(&queued));
        assert_eq!(log.committed(), 1);

        let result = log.next_result_nowait().unwrap();
        assert_eq!(result.seqno, 1);
        assert_eq!(result.state, RequestState::Logged);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        let header: LogHeader = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(header.start_seqno, 1);
        assert_eq!(header.version, LOG_VERSION);
    }

    #[tokio::test]
    async fn test_worker_logs_in_order() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let worker = log.start();

        for i in 0..5 {
            log.add_pending(create(&format!("f{}", i))).unwrap();
        }
        let mut seqnos = Vec::new();
        for _ in 0..5 {
            let r = log.next_result().await.unwrap();
            assert!(log.is_committed(&r));
            seqnos.push(r.seqno);
        }
        assert_eq!(seqnos, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.committed(), 5);

        log.close();
        worker.await.unwrap().unwrap();
        assert_eq!(log.state(), LogState::Rotating);
        assert!(log.next_result().await.is_none());
    }

    #[tokio::test]
    async fn test_close_persists_queued_requests() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        for i in 0..3 {
            log.add_pending(create(&format!("f{}", i))).unwrap();
        }
        log.close();
        assert!(log.is_closed());
        assert!(matches!(
            log.add_pending(create("late")),
            Err(MetaError::Closed)
        ));

        log.start().await.unwrap().unwrap();
        assert_eq!(log.committed(), 3);

        let lines = read_lines(&log_path(&log.config().log_dir, 0));
        assert_eq!(lines.len(), 4);
    }

    #[tokio::test]
    async fn test_rotation_marker_posts_ticket() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let worker = log.start();

        log.add_pending(create("a")).unwrap();
        log.add_pending(create("b")).unwrap();
        log.submit_checkpoint().unwrap();
        log.add_pending(create("c")).unwrap();

        let ticket = log.wait_for_cp().await.unwrap();
        assert_eq!(ticket.covered, 2);
        assert_eq!(ticket.finished_log.file_name().unwrap(), "log.0");
        assert_eq!(ticket.next_log.file_name().unwrap(), "log.1");

        log.close();
        worker.await.unwrap().unwrap();

        let second = read_lines(&ticket.next_log);
        let header: LogHeader = serde_json::from_str(&second[0]).unwrap();
        assert_eq!(header.start_seqno, 3);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_set_seqno_primes_watermarks() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        log.set_seqno(5);
        assert_eq!(log.checkpointed(), 5);
        assert_eq!(log.committed(), 5);
        assert_eq!(log.nextseq(), 5);

        let mut old = create("old");
        old.seqno = 5;
        assert!(log.is_committed(&old));

        log.add_pending(create("new")).unwrap();
        let fresh = log.get_pending().await.unwrap();
        assert_eq!(fresh.seqno, 6);
        assert!(!log.is_committed(&fresh));
    }

    #[tokio::test]
    async fn test_io_failure_stops_worker() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let mut config = LoggerConfig::with_root(dir.path());
        config.log_dir = blocker;

        let log = Arc::new(OpLog::new(config));
        log.add_pending(create("a")).unwrap();
        let result = log.start().await.unwrap();
        assert!(matches!(result, Err(MetaError::Io(_))));
        assert_eq!(log.committed(), 0);
        assert!(log.next_result().await.is_none());
    }

    #[tokio::test]
    async fn test_submit_after_worker_failure_is_rejected() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let mut config = LoggerConfig::with_root(dir.path());
        config.log_dir = blocker;

        let log = Arc::new(OpLog::new(config));
        log.add_pending(create("a")).unwrap();
        assert!(log.start().await.unwrap().is_err());

        assert!(log.is_closed());
        assert!(matches!(log.add_pending(create("b")), Err(MetaError::Closed)));
        assert!(matches!(log.submit_checkpoint(), Err(MetaError::Closed)));
        assert!(log.get_pending().await.is_none());
        assert_eq!(log.nextseq(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters_get_dense_sequence() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let worker = log.start();

        let mut producers = Vec::new();
        for p in 0..4 {
            let log = Arc::clone(&log);
            producers.push(tokio::spawn(async move {
                for i in 0..25 {
                    log.add_pending(create(&format!("p{}-{}", p, i))).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        log.close();
        worker.await.unwrap().unwrap();

        let mut seqnos = Vec::new();
        while let Some(req) = log.next_result().await {
            seqnos.push(req.seqno);
        }
        assert_eq!(seqnos, (1..=100).collect::<Vec<SeqNo>>());
        assert_eq!(log.committed(), 100);

        let mut on_disk = Vec::new();
        for line in read_lines(&log_path(&log.config().log_dir, 0)).iter().skip(1) {
            let record: LogRecord = serde_json::from_str(line).unwrap();
            on_disk.push(record.seqno);
        }
        assert_eq!(on_disk, seqnos);
    }
}

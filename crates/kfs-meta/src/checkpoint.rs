//! Checkpoints of committed metadata state.
//!
//! A checkpoint is taken by pushing a marker through the log's pending
//! queue. When the log worker reaches it, everything sequenced before it is
//! already in `logged`; the worker finishes the current log file, starts the
//! next one at `covered + 1` and posts a ticket. The manager then drains
//! `logged` up to `covered` into its image and writes `chkpt.<covered>`.
//!
//! The image is written to a temporary file, synced and renamed into place,
//! and only then is the log's `checkpointed` watermark advanced. An
//! interrupted checkpoint leaves the previous checkpoint and the log files
//! after it as the recovery source.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{MetaError, MetaResult};
use crate::logger::OpLog;
use crate::request::{LogRecord, MetaRequest, RequestState, SeqNo};

/// Checkpoint file format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const CHECKPOINT_PREFIX: &str = "chkpt.";

/// First line of every checkpoint file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Checkpoint format version.
    pub version: u32,
    /// Highest sequence number included.
    pub seqno: SeqNo,
}

/// Path of the checkpoint covering `seqno` in `dir`.
pub fn checkpoint_path(dir: &Path, seqno: SeqNo) -> PathBuf {
    dir.join(format!("{}{}", CHECKPOINT_PREFIX, seqno))
}

/// Parses the sequence number out of a `chkpt.<seqno>` file name.
/// Temporary files do not parse.
pub fn parse_checkpoint_name(name: &str) -> Option<SeqNo> {
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}

/// Complete checkpoints in `dir`, ascending by sequence number.
pub fn list_checkpoints(dir: &Path) -> MetaResult<Vec<SeqNo>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut seqnos = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(s) = entry.file_name().to_str().and_then(parse_checkpoint_name) {
            seqnos.push(s);
        }
    }
    seqnos.sort_unstable();
    Ok(seqnos)
}

/// Metadata state that committed requests are folded into.
pub trait CheckpointImage: Send {
    /// Folds one committed request into the image.
    fn apply(&mut self, req: &MetaRequest) -> MetaResult<()>;

    /// Serializes the image after the checkpoint header.
    fn write_to(&self, w: &mut dyn Write) -> MetaResult<()>;
}

/// An image that keeps every committed record in sequence order.
#[derive(Clone, Debug, Default)]
pub struct RecordImage {
    records: Vec<LogRecord>,
}

impl RecordImage {
    /// Creates an empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records held, in sequence order.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the image holds nothing.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest sequence number held, or 0.
    pub fn last_seqno(&self) -> SeqNo {
        self.records.last().map_or(0, |r| r.seqno)
    }

    /// Reads a checkpoint file written from a `RecordImage`.
    pub fn load(path: &Path) -> MetaResult<(CheckpointHeader, RecordImage)> {
        let corrupt = |reason: String| MetaError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason,
        };
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();
        let header: CheckpointHeader = match lines.next() {
            Some(line) => serde_json::from_str(&line?).map_err(|e| corrupt(e.to_string()))?,
            None => return Err(corrupt("empty file".to_string())),
        };
        if header.version != CHECKPOINT_VERSION {
            return Err(corrupt(format!("unsupported version {}", header.version)));
        }

        let mut image = RecordImage::new();
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: LogRecord =
                serde_json::from_str(&line).map_err(|e| corrupt(e.to_string()))?;
            image.records.push(record);
        }
        if image.last_seqno() > header.seqno {
            return Err(corrupt(format!(
                "record {} beyond checkpoint seqno {}",
                image.last_seqno(),
                header.seqno
            )));
        }
        Ok((header, image))
    }
}

impl CheckpointImage for RecordImage {
    fn apply(&mut self, req: &MetaRequest) -> MetaResult<()> {
        let record = req.record()?;
        if record.seqno <= self.last_seqno() {
            warn!(seqno = record.seqno, "skipping record already in image");
            return Ok(());
        }
        self.records.push(record);
        Ok(())
    }

    fn write_to(&self, w: &mut dyn Write) -> MetaResult<()> {
        for record in &self.records {
            serde_json::to_writer(&mut *w, record)?;
            w.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Result of one completed checkpoint.
#[derive(Debug)]
pub struct CheckpointOutcome {
    /// Highest sequence number covered.
    pub seqno: SeqNo,
    /// The checkpoint file.
    pub path: PathBuf,
    /// Log file finished for this checkpoint.
    pub finished_log: PathBuf,
    /// Requests folded in by this checkpoint; their results can be released.
    pub released: Vec<MetaRequest>,
}

/// Drives checkpoints against an [`OpLog`].
///
/// The manager is the metaserver's consumer of logged results: everything
/// it takes from `logged` is folded into the image before being handed back.
pub struct CheckpointManager<I: CheckpointImage> {
    log: Arc<OpLog>,
    image: I,
    dir: PathBuf,
    absorbed: SeqNo,
    last_checkpoint: Option<PathBuf>,
}

impl<I: CheckpointImage> CheckpointManager<I> {
    /// Creates a manager whose image already reflects everything up to the
    /// log's current `committed` watermark.
    pub fn new(log: Arc<OpLog>, image: I) -> Self {
        let dir = log.config().checkpoint_dir.clone();
        let absorbed = log.committed();
        Self {
            log,
            image,
            dir,
            absorbed,
            last_checkpoint: None,
        }
    }

    /// The image being maintained.
    pub fn image(&self) -> &I {
        &self.image
    }

    /// Highest sequence number folded into the image.
    pub fn absorbed(&self) -> SeqNo {
        self.absorbed
    }

    /// The most recent checkpoint written by this manager.
    pub fn last_checkpoint(&self) -> Option<&Path> {
        self.last_checkpoint.as_deref()
    }

    fn include(&mut self, req: &MetaRequest) -> MetaResult<()> {
        self.image.apply(req)?;
        self.absorbed = self.absorbed.max(req.seqno);
        Ok(())
    }

    /// Folds every result already logged into the image without waiting,
    /// returning the requests so their results can be released.
    pub fn absorb(&mut self) -> MetaResult<Vec<MetaRequest>> {
        let mut released = Vec::new();
        while let Some(req) = self.log.next_result_nowait() {
            self.include(&req)?;
            released.push(req);
        }
        if !released.is_empty() {
            debug!(count = released.len(), absorbed = self.absorbed, "absorbed results");
        }
        Ok(released)
    }

    /// Waits for the next logged result and folds it into the image before
    /// handing it back. Returns None once the log worker has stopped and
    /// every result has been taken.
    pub async fn next_result(&mut self) -> MetaResult<Option<MetaRequest>> {
        let Some(req) = self.log.next_result().await else {
            return Ok(None);
        };
        self.include(&req)?;
        Ok(Some(req))
    }

    /// Takes a checkpoint covering everything submitted before this call.
    pub async fn checkpoint(&mut self) -> MetaResult<CheckpointOutcome> {
        self.log.submit_checkpoint()?;
        let ticket = self.log.wait_for_cp().await.ok_or(MetaError::Closed)?;

        let mut released = Vec::new();
        while self.absorbed < ticket.covered {
            let req = self.log.next_result().await.ok_or(MetaError::Closed)?;
            self.include(&req)?;
            released.push(req);
        }

        let path = self.write_image(ticket.covered)?;
        self.log.set_checkpointed(ticket.covered);
        self.last_checkpoint = Some(path.clone());
        for req in &mut released {
            req.state = RequestState::Checkpointed;
        }
        info!(
            seqno = ticket.covered,
            checkpoint = %path.display(),
            released = released.len(),
            "checkpoint complete"
        );
        Ok(CheckpointOutcome {
            seqno: ticket.covered,
            path,
            finished_log: ticket.finished_log,
            released,
        })
    }

    fn write_image(&self, seqno: SeqNo) -> MetaResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = checkpoint_path(&self.dir, seqno);
        let tmp = path.with_extension(format!("{}.tmp", seqno));

        let mut writer = BufWriter::new(File::create(&tmp)?);
        let header = CheckpointHeader {
            version: CHECKPOINT_VERSION,
            seqno,
        };
        serde_json::to_writer(&mut writer, &header)?;
        writer.write_all(b"\n")?;
        self.image.write_to(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp, &path)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(path)
    }

    /// Takes a checkpoint every `interval` until `shutdown` flips to true or
    /// the log closes. Results absorbed between checkpoints are dropped after
    /// being folded in.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> MetaResult<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.absorb()?;
                    match self.checkpoint().await {
                        Ok(_) => {}
                        Err(MetaError::Closed) => break,
                        Err(e) => return Err(e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(checkpointed = self.log.checkpointed(), "checkpointer stopped");
        Ok(())
    }
}

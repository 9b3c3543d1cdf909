//! Restart recovery: newest checkpoint plus the log records after it.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::checkpoint::{checkpoint_path, list_checkpoints, CheckpointHeader};
use crate::config::LoggerConfig;
use crate::error::{MetaError, MetaResult};
use crate::logger::{list_logs, log_path, LogHeader, LOG_VERSION};
use crate::request::{LogRecord, MetaRequest, SeqNo};

/// What a restarting metaserver resumes from.
#[derive(Debug, Default)]
pub struct RecoveryPoint {
    /// The newest complete checkpoint, if any.
    pub checkpoint: Option<PathBuf>,
    /// Highest sequence number covered by that checkpoint.
    pub checkpointed: SeqNo,
    /// Highest sequence number found anywhere; pass to `OpLog::set_seqno`.
    pub last_seqno: SeqNo,
    /// Logged requests after the checkpoint, in sequence order.
    pub replay: Vec<MetaRequest>,
}

/// Scans the checkpoint and log directories of `config`.
///
/// A final line that does not parse is a write torn by a crash and is
/// dropped with a warning. Anything unreadable before the final line of a
/// file is an error.
pub fn recover(config: &LoggerConfig) -> MetaResult<RecoveryPoint> {
    let mut point = RecoveryPoint::default();

    if let Some(&seqno) = list_checkpoints(&config.checkpoint_dir)?.last() {
        let path = checkpoint_path(&config.checkpoint_dir, seqno);
        let header = read_checkpoint_header(&path)?;
        if header.seqno != seqno {
            return Err(MetaError::CorruptCheckpoint {
                path,
                reason: format!("header seqno {} does not match file name", header.seqno),
            });
        }
        point.checkpointed = seqno;
        point.last_seqno = seqno;
        point.checkpoint = Some(path);
    }

    for n in list_logs(&config.log_dir)? {
        let path = log_path(&config.log_dir, n);
        for record in read_log(&path)? {
            if record.seqno <= point.checkpointed {
                continue;
            }
            if record.seqno <= point.last_seqno {
                return Err(MetaError::CorruptLog {
                    path,
                    reason: format!(
                        "seqno {} after {} is out of order",
                        record.seqno, point.last_seqno
                    ),
                });
            }
            point.last_seqno = record.seqno;
            point.replay.push(MetaRequest::from_record(record));
        }
    }

    info!(
        checkpointed = point.checkpointed,
        last_seqno = point.last_seqno,
        replay = point.replay.len(),
        "recovery scan complete"
    );
    Ok(point)
}

fn read_checkpoint_header(path: &Path) -> MetaResult<CheckpointHeader> {
    let mut line = String::new();
    BufReader::new(File::open(path)?).read_line(&mut line)?;
    serde_json::from_str(line.trim_end()).map_err(|e| MetaError::CorruptCheckpoint {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Reads the records of one log file.
pub fn read_log(path: &Path) -> MetaResult<Vec<LogRecord>> {
    let corrupt = |reason: String| MetaError::CorruptLog {
        path: path.to_path_buf(),
        reason,
    };
    let data = fs::read(path)?;
    let lines: Vec<&[u8]> = data
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .collect();

    let Some((first, rest)) = lines.split_first() else {
        warn!(log = %path.display(), "empty log file");
        return Ok(Vec::new());
    };
    let header: LogHeader = match serde_json::from_slice(first) {
        Ok(header) => header,
        Err(_) if rest.is_empty() => {
            warn!(log = %path.display(), "torn log header");
            return Ok(Vec::new());
        }
        Err(e) => return Err(corrupt(e.to_string())),
    };
    if header.version != LOG_VERSION {
        return Err(corrupt(format!("unsupported version {}", header.version)));
    }

    let mut records = Vec::with_capacity(rest.len());
    for (i, line) in rest.iter().enumerate() {
        match serde_json::from_slice::<LogRecord>(line) {
            Ok(record) if record.seqno < header.start_seqno => {
                return Err(corrupt(format!(
                    "seqno {} precedes start {}",
                    record.seqno, header.start_seqno
                )));
            }
            Ok(record) => records.push(record),
            Err(_) if i + 1 == rest.len() => {
                warn!(log = %path.display(), after = records.len(), "dropping torn log tail");
            }
            Err(e) => return Err(corrupt(e.to_string())),
        }
    }
    debug!(log = %path.display(), records = records.len(), "read log file");
    Ok(records)
}

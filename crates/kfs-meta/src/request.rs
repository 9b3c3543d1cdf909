//! Units of work for the operation log.

use std::io::Write;

use kfs_client::{Request, Seq};
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};

/// Log sequence number. Zero means "not yet logged".
pub type SeqNo = u64;

/// Which log queue a request currently sits in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Submitted, waiting for a sequence number.
    Pending,
    /// Sequenced and durable in the active log file.
    Logged,
    /// Included in a completed checkpoint.
    Checkpointed,
}

/// What a queued item asks the log worker to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaOp {
    /// Persist a metadata mutation.
    Mutation {
        /// The client's request sequence id.
        cseq: Seq,
        /// The mutating request.
        request: Request,
    },
    /// Rotate the log so a checkpoint can be taken at this point in the order.
    Checkpoint,
}

/// A request travelling through the log queues.
#[derive(Clone, Debug)]
pub struct MetaRequest {
    /// Log sequence number; 0 until assigned by `get_pending`.
    pub seqno: SeqNo,
    /// The work to do.
    pub op: MetaOp,
    /// Queue membership.
    pub state: RequestState,
}

/// On-disk form of one logged mutation: a single JSON line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number.
    pub seqno: SeqNo,
    /// The client's request sequence id.
    pub cseq: Seq,
    /// The mutating request.
    pub op: Request,
}

impl MetaRequest {
    /// Wraps a mutating request for submission. Read-only requests are rejected.
    pub fn new(cseq: Seq, request: Request) -> MetaResult<Self> {
        let kind = request.kind();
        if !kind.is_mutating() {
            return Err(MetaError::NotMutating(kind.name()));
        }
        Ok(Self {
            seqno: 0,
            op: MetaOp::Mutation { cseq, request },
            state: RequestState::Pending,
        })
    }

    pub(crate) fn checkpoint_marker() -> Self {
        Self {
            seqno: 0,
            op: MetaOp::Checkpoint,
            state: RequestState::Pending,
        }
    }

    /// Rebuilds a logged request from its on-disk record.
    pub fn from_record(record: LogRecord) -> Self {
        Self {
            seqno: record.seqno,
            op: MetaOp::Mutation {
                cseq: record.cseq,
                request: record.op,
            },
            state: RequestState::Logged,
        }
    }

    /// True for checkpoint markers.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self.op, MetaOp::Checkpoint)
    }

    /// The wrapped request, if this is a mutation.
    pub fn request(&self) -> Option<&Request> {
        match &self.op {
            MetaOp::Mutation { request, .. } => Some(request),
            MetaOp::Checkpoint => None,
        }
    }

    /// The record written to the log for this request.
    pub fn record(&self) -> MetaResult<LogRecord> {
        match &self.op {
            MetaOp::Mutation { cseq, request } => Ok(LogRecord {
                seqno: self.seqno,
                cseq: *cseq,
                op: request.clone(),
            }),
            MetaOp::Checkpoint => Err(MetaError::NotMutating("CHECKPOINT")),
        }
    }

    /// Appends this request's record to `w` as one line.
    pub fn log<W: Write>(&self, w: &mut W) -> MetaResult<()> {
        let record = self.record()?;
        serde_json::to_writer(&mut *w, &record)?;
        w.write_all(b"\n")?;
        Ok(())
    }
}

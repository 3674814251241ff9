//! Back-channel control messages and the correlation-tag allocator.
//!
//! Data-path workers report per-vbucket stream outcomes to the feed actor
//! over a buffered back channel. Producers never block the actor: posting
//! is best-effort and aborts once the feed's finish signal fires.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use cascade_common::types::{Opaque, Seqno, Vbucket, Vbuuid};
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Upstream status carried on stream-request and stream-end responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// The stream was accepted / ended cleanly.
    Success,
    /// The upstream requires a rollback to an earlier seqno before the
    /// stream can start.
    Rollback,
    /// The vbucket is no longer hosted by the node this feeder talks to.
    NotMyVbucket,
    /// Any other upstream failure.
    Failed,
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamStatus::Success => "success",
            StreamStatus::Rollback => "rollback",
            StreamStatus::NotMyVbucket => "not-my-vbucket",
            StreamStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Messages posted by data-path workers onto the feed's back channel.
#[derive(Debug, Clone)]
pub enum Feedback {
    /// Upstream answered a stream-request for one vbucket. On
    /// [`StreamStatus::Rollback`] the `seqno` is the rollback point.
    StreamRequest {
        bucket: String,
        opaque: Opaque,
        status: StreamStatus,
        vbucket: Vbucket,
        vbuuid: Vbuuid,
        seqno: Seqno,
    },
    /// Upstream answered a stream-end for one vbucket.
    StreamEnd {
        bucket: String,
        opaque: Opaque,
        status: StreamStatus,
        vbucket: Vbucket,
    },
    /// A bucket's data path drained and exited.
    KvdataFinished { bucket: String },
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feedback::StreamRequest {
                bucket,
                opaque,
                status,
                vbucket,
                vbuuid,
                seqno,
            } => write!(
                f,
                "{{stream-request {status} {bucket} vb:{vbucket} vbuuid:{vbuuid:x} seqno:{seqno} #{opaque:x}}}"
            ),
            Feedback::StreamEnd {
                bucket,
                opaque,
                status,
                vbucket,
            } => write!(f, "{{stream-end {status} {bucket} vb:{vbucket} #{opaque:x}}}"),
            Feedback::KvdataFinished { bucket } => write!(f, "{{kvdata-finished {bucket}}}"),
        }
    }
}

/// Producer handle for the back channel. Cloned into every data-path
/// worker the feed owns.
#[derive(Clone)]
pub struct FeedbackSender {
    tx: mpsc::Sender<Feedback>,
    fin: watch::Receiver<bool>,
}

impl FeedbackSender {
    pub(crate) fn new(tx: mpsc::Sender<Feedback>, fin: watch::Receiver<bool>) -> Self {
        Self { tx, fin }
    }

    /// Post feedback without blocking. Drops the message if the feed has
    /// finished or the channel is full; the reconciler's deadline covers
    /// the lost-message case.
    pub fn post(&self, feedback: Feedback) {
        if *self.fin.borrow() {
            return;
        }
        if let Err(e) = self.tx.try_send(feedback) {
            warn!(error = %e, "back channel post dropped");
        }
    }
}

/// Generate a 16-bit correlation tag for one batch of stream requests.
///
/// Bits 26..41 of the unix-nanosecond clock: the value changes every
/// ~67 ms, which is collision-unlikely within a batch's lifetime, and the
/// reconciler additionally matches on (bucket, vbucket).
pub fn new_opaque() -> Opaque {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    ((nanos >> 26) & 0xFFFF) as Opaque
}

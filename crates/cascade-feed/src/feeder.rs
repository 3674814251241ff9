//! Upstream bucket feeder contract.
//!
//! A feeder owns one CDC connection for one bucket and exposes a single
//! inbound channel of classified frames. The wire driver that produces
//! the frames lives outside this crate; the feed actor only opens and
//! closes feeders and issues batched stream-request / stream-end calls
//! against them.

use async_trait::async_trait;
use bytes::Bytes;
use cascade_common::types::{Opaque, Seqno, Vbucket, Vbuuid};
use cascade_common::Result;
use tokio::sync::mpsc;

use crate::control::StreamStatus;
use crate::timestamp::Timestamp;

/// A classified CDC frame, as delivered on a feeder's event channel.
/// The feed core never decodes mutation payloads; keys and values travel
/// as opaque bytes for the data path.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Upstream acknowledged a stream-request. On
    /// [`StreamStatus::Rollback`] the `seqno` is the rollback point,
    /// otherwise it echoes the requested start.
    StreamBegin {
        opaque: Opaque,
        vbucket: Vbucket,
        status: StreamStatus,
        seqno: Seqno,
        vbuuid: Vbuuid,
    },
    /// Upstream acknowledged a stream-end.
    StreamEnd {
        opaque: Opaque,
        vbucket: Vbucket,
        status: StreamStatus,
    },
    /// Snapshot boundary marker.
    SnapshotMarker {
        vbucket: Vbucket,
        start: Seqno,
        end: Seqno,
    },
    /// A document mutation.
    Mutation {
        vbucket: Vbucket,
        seqno: Seqno,
        key: Bytes,
        value: Bytes,
    },
    /// A document deletion.
    Deletion {
        vbucket: Vbucket,
        seqno: Seqno,
        key: Bytes,
    },
}

/// Bucket-scoped upstream connection.
#[async_trait]
pub trait BucketFeeder: Send + Sync {
    /// Request streams for every vbucket in `ts`, correlated by `opaque`.
    /// Must be non-blocking or bounded; per-vbucket outcomes arrive as
    /// [`StreamEvent::StreamBegin`] frames on the event channel.
    async fn start_vbucket_streams(&mut self, opaque: Opaque, ts: &Timestamp) -> Result<()>;

    /// End streams for every vbucket in `ts`, correlated by `opaque`.
    async fn end_vbucket_streams(&mut self, opaque: Opaque, ts: &Timestamp) -> Result<()>;

    /// Hand over the single inbound event channel. The data-path worker
    /// is the only consumer; returns `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>>;

    /// Tear down the upstream connection.
    async fn close_feed(&mut self) -> Result<()>;
}

/// Opens feeders. Covers cluster/pool/bucket connection establishment;
/// failures map to the DCP error family.
#[async_trait]
pub trait FeederFactory: Send + Sync {
    async fn open_feed(
        &self,
        name: &str,
        pool: &str,
        bucket: &str,
    ) -> Result<Box<dyn BucketFeeder>>;
}

/// Derive a unique upstream connection name for a bucket feed.
pub(crate) fn connection_name(bucket: &str, topic: &str) -> String {
    let uuid64 = uuid::Uuid::new_v4().as_u128() as u64;
    format!("proj-{}-{}-{}", bucket, topic, uuid64)
}

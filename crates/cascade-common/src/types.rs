//! Common types used throughout Cascade.

/// Partition number within a bucket. The smallest unit of stream
/// subscription.
pub type Vbucket = u16;

/// Mutation sequence number within a vbucket.
pub type Seqno = u64;

/// History-branch identifier of a vbucket after failover.
pub type Vbuuid = u64;

/// Subscriber (engine instance) identifier.
pub type InstanceId = u64;

/// Correlation tag carried on each stream-request/stream-end round trip.
pub type Opaque = u16;

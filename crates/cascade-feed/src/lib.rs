//! Feed control plane for Cascade.
//!
//! A feed is a topic-scoped subscription to upstream mutation streams
//! across a set of buckets. The [`Feed`] actor owns all per-bucket stream
//! state: it opens, restarts and shuts down per-vbucket upstream streams,
//! reconciles asynchronous data-path feedback against its outstanding
//! request book-keeping, and coordinates the lifecycle of bucket feeders,
//! data-path workers and downstream endpoints.

mod actor;
pub mod control;
pub mod endpoint;
pub mod engine;
pub mod feed;
pub mod feeder;
pub mod kvdata;
pub mod timestamp;
pub mod topology;

pub use control::{Feedback, FeedbackSender, StreamStatus};
pub use endpoint::{EndpointTable, RouterEndpoint, RouterEndpointFactory};
pub use engine::{Engine, Evaluator, Router, Subscriber, SubscriberSet};
pub use feed::{
    AddBucketsRequest, AddInstancesRequest, DelBucketsRequest, DelInstancesRequest, Feed,
    FeedContext, MutationTopicRequest, RepairEndpointsRequest, RestartVbucketsRequest,
    ShutdownVbucketsRequest, TopicResponse,
};
pub use feeder::{BucketFeeder, FeederFactory, StreamEvent};
pub use kvdata::{KvData, KvDataContext, KvDataFactory};
pub use timestamp::{Timestamp, TsEntry};
pub use topology::{FailoverLog, Topology};

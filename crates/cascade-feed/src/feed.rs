//! Public feed surface.
//!
//! A [`Feed`] is a cheap handle onto the single-owner actor that holds all
//! per-bucket stream state. Synchronous operations marshal into commands
//! on the request channel and block on a per-command reply; the data-path
//! entry points post onto the buffered back channel and never block.

use std::sync::Arc;

use cascade_common::config::FeedConfig;
use cascade_common::types::InstanceId;
use cascade_common::{Error, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

use crate::actor::FeedActor;
use crate::control::{Feedback, FeedbackSender};
use crate::endpoint::RouterEndpointFactory;
use crate::engine::SubscriberSet;
use crate::feeder::{FeederFactory, StreamEvent};
use crate::kvdata::KvDataFactory;
use crate::timestamp::Timestamp;
use crate::topology::Topology;

/// Collaborator factories and configuration for one feed.
pub struct FeedContext {
    pub config: FeedConfig,
    pub endpoint_factory: Arc<dyn RouterEndpointFactory>,
    pub feeder_factory: Arc<dyn FeederFactory>,
    pub kvdata_factory: Arc<dyn KvDataFactory>,
    pub topology: Arc<dyn Topology>,
}

/// Start a mutation topic: subscribers plus one request timestamp per
/// bucket.
pub struct MutationTopicRequest {
    pub endpoint_type: String,
    pub req_timestamps: Vec<Timestamp>,
    pub subscribers: SubscriberSet,
}

/// Restart upstream streams for the listed buckets.
pub struct RestartVbucketsRequest {
    pub restart_timestamps: Vec<Timestamp>,
}

/// Shut down upstream streams for the listed buckets.
pub struct ShutdownVbucketsRequest {
    pub shutdown_timestamps: Vec<Timestamp>,
}

/// Add buckets, with their subscribers, to a running feed.
pub struct AddBucketsRequest {
    pub req_timestamps: Vec<Timestamp>,
    pub subscribers: SubscriberSet,
}

/// Remove buckets and all their upstream and downstream elements, except
/// endpoints.
pub struct DelBucketsRequest {
    pub buckets: Vec<String>,
}

/// Install additional subscribers on a running feed.
pub struct AddInstancesRequest {
    pub subscribers: SubscriberSet,
}

/// Remove subscribers by instance id.
pub struct DelInstancesRequest {
    pub instance_ids: Vec<InstanceId>,
}

/// Restart the listed endpoint addresses if they are not active.
pub struct RepairEndpointsRequest {
    pub endpoints: Vec<String>,
}

/// Snapshot of a feed's engines and per-bucket stream state.
#[derive(Debug, Clone, Serialize)]
pub struct TopicResponse {
    pub topic: String,
    pub instance_ids: Vec<InstanceId>,
    pub active_timestamps: Vec<Timestamp>,
    pub rollback_timestamps: Vec<Timestamp>,
}

/// Commands multiplexed on the feed's request channel.
pub(crate) enum FeedCommand {
    Start {
        req: MutationTopicRequest,
        reply: oneshot::Sender<Result<TopicResponse>>,
    },
    RestartVbuckets {
        req: RestartVbucketsRequest,
        reply: oneshot::Sender<Result<TopicResponse>>,
    },
    ShutdownVbuckets {
        req: ShutdownVbucketsRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    AddBuckets {
        req: AddBucketsRequest,
        reply: oneshot::Sender<Result<TopicResponse>>,
    },
    DelBuckets {
        req: DelBucketsRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    AddInstances {
        req: AddInstancesRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    DelInstances {
        req: DelInstancesRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    RepairEndpoints {
        req: RepairEndpointsRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    GetTopicResponse {
        reply: oneshot::Sender<TopicResponse>,
    },
    GetStatistics {
        reply: oneshot::Sender<serde_json::Value>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle onto one topic feed.
#[derive(Clone)]
pub struct Feed {
    topic: String,
    cluster: String,
    cmd_tx: mpsc::Sender<FeedCommand>,
    feedback: FeedbackSender,
}

impl Feed {
    /// Create a feed for `topic` and spawn its actor.
    pub fn new(topic: impl Into<String>, ctx: FeedContext) -> Feed {
        let topic = topic.into();
        let cluster = ctx.config.cluster_addr.clone();
        let chan_size = ctx.config.feed_chan_size.max(1);

        let (cmd_tx, cmd_rx) = mpsc::channel(chan_size);
        let (back_tx, back_rx) = mpsc::channel(chan_size);
        let (fin_tx, fin_rx) = watch::channel(false);
        let feedback = FeedbackSender::new(back_tx.clone(), fin_rx.clone());

        let actor = FeedActor::new(topic.clone(), ctx, cmd_rx, back_rx, back_tx, fin_tx, fin_rx);
        tokio::spawn(actor.run());
        info!(topic = %topic, cluster = %cluster, "feed started");

        Feed {
            topic,
            cluster,
            cmd_tx,
            feedback,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Start the feed.
    /// Synchronous call.
    pub async fn mutation_topic(&self, req: MutationTopicRequest) -> Result<TopicResponse> {
        self.call(|reply| FeedCommand::Start { req, reply }).await?
    }

    /// Restart upstream vbuckets for specified buckets.
    /// Synchronous call.
    pub async fn restart_vbuckets(&self, req: RestartVbucketsRequest) -> Result<TopicResponse> {
        self.call(|reply| FeedCommand::RestartVbuckets { req, reply })
            .await?
    }

    /// Shut down vbucket streams for specified buckets.
    /// Synchronous call.
    pub async fn shutdown_vbuckets(&self, req: ShutdownVbucketsRequest) -> Result<()> {
        self.call(|reply| FeedCommand::ShutdownVbuckets { req, reply })
            .await?
    }

    /// Add buckets, opening their upstream and data path.
    /// Synchronous call.
    pub async fn add_buckets(&self, req: AddBucketsRequest) -> Result<TopicResponse> {
        self.call(|reply| FeedCommand::AddBuckets { req, reply }).await?
    }

    /// Remove buckets and all their upstream and downstream elements,
    /// except endpoints.
    /// Synchronous call.
    pub async fn del_buckets(&self, req: DelBucketsRequest) -> Result<()> {
        self.call(|reply| FeedCommand::DelBuckets { req, reply }).await?
    }

    /// Install additional subscribers.
    /// Synchronous call.
    pub async fn add_instances(&self, req: AddInstancesRequest) -> Result<()> {
        self.call(|reply| FeedCommand::AddInstances { req, reply })
            .await?
    }

    /// Remove subscribers.
    /// Synchronous call.
    pub async fn del_instances(&self, req: DelInstancesRequest) -> Result<()> {
        self.call(|reply| FeedCommand::DelInstances { req, reply })
            .await?
    }

    /// Restart the specified endpoints if they are not active.
    /// Synchronous call.
    pub async fn repair_endpoints(&self, req: RepairEndpointsRequest) -> Result<()> {
        self.call(|reply| FeedCommand::RepairEndpoints { req, reply })
            .await?
    }

    /// Snapshot of the feed's current state.
    /// Synchronous call.
    pub async fn topic_response(&self) -> Result<TopicResponse> {
        self.call(|reply| FeedCommand::GetTopicResponse { reply }).await
    }

    /// Nested statistics document for this feed.
    /// Synchronous call.
    pub async fn statistics(&self) -> Result<serde_json::Value> {
        self.call(|reply| FeedCommand::GetStatistics { reply }).await
    }

    /// Shut down the feed, its upstream connections and downstream
    /// endpoints.
    /// Synchronous call.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| FeedCommand::Shutdown { reply }).await
    }

    /// Feedback from the data path: upstream answered a stream-request.
    /// Asynchronous call.
    pub fn post_stream_request(&self, bucket: &str, event: &StreamEvent) {
        if let StreamEvent::StreamBegin {
            opaque,
            vbucket,
            status,
            seqno,
            vbuuid,
        } = event
        {
            self.feedback.post(Feedback::StreamRequest {
                bucket: bucket.to_string(),
                opaque: *opaque,
                status: *status,
                vbucket: *vbucket,
                vbuuid: *vbuuid,
                seqno: *seqno,
            });
        }
    }

    /// Feedback from the data path: upstream answered a stream-end.
    /// Asynchronous call.
    pub fn post_stream_end(&self, bucket: &str, event: &StreamEvent) {
        if let StreamEvent::StreamEnd {
            opaque,
            vbucket,
            status,
        } = event
        {
            self.feedback.post(Feedback::StreamEnd {
                bucket: bucket.to_string(),
                opaque: *opaque,
                status: *status,
                vbucket: *vbucket,
            });
        }
    }

    /// Feedback from the data path: a bucket's worker drained and exited.
    /// Asynchronous call.
    pub fn post_kvdata_finished(&self, bucket: &str) {
        self.feedback.post(Feedback::KvdataFinished {
            bucket: bucket.to_string(),
        });
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> FeedCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Closed(self.topic.clone()))?;
        rx.await.map_err(|_| Error::Closed(self.topic.clone()))
    }
}

//! Data-path worker contract.
//!
//! One worker per active bucket. It consumes the bucket feeder's event
//! channel, hosts the bucket's engines, fans evaluated mutations out to
//! the endpoint table, and reports per-vbucket stream outcomes back to the
//! feed over the back channel. The worker implementation lives outside
//! this crate; the feed actor creates, updates and closes workers through
//! this contract.

use std::collections::HashMap;

use async_trait::async_trait;
use cascade_common::config::FeedConfig;
use cascade_common::types::InstanceId;
use cascade_common::Result;
use tokio::sync::mpsc;

use crate::control::FeedbackSender;
use crate::endpoint::EndpointTable;
use crate::engine::Engine;
use crate::feeder::StreamEvent;
use crate::timestamp::Timestamp;

/// Per-bucket data-path worker.
#[async_trait]
pub trait KvData: Send + Sync {
    /// Refresh the worker's view of the bucket's request timestamp after a
    /// restart.
    async fn update_ts(&self, ts: &Timestamp) -> Result<()>;

    /// Install or refresh engines and the endpoint table.
    async fn add_engines(
        &self,
        engines: &HashMap<InstanceId, Engine>,
        endpoints: &EndpointTable,
    ) -> Result<()>;

    /// Remove the named engines.
    async fn delete_engines(&self, ids: &[InstanceId]) -> Result<()>;

    /// Worker statistics document.
    async fn statistics(&self) -> serde_json::Value;

    /// Stop the worker and release its channels.
    async fn close(&self) -> Result<()>;
}

/// Everything a data-path worker needs at spawn time.
pub struct KvDataContext {
    pub topic: String,
    pub bucket: String,
    /// The request timestamp the worker starts from.
    pub ts: Timestamp,
    pub engines: HashMap<InstanceId, Engine>,
    pub endpoints: EndpointTable,
    /// The feeder's single inbound event channel.
    pub events: mpsc::Receiver<StreamEvent>,
    /// Back-channel producer for stream outcomes.
    pub feedback: FeedbackSender,
    /// Mutation-channel sizing and sync cadence, forwarded from the feed
    /// configuration.
    pub config: FeedConfig,
}

/// Spawns data-path workers.
#[async_trait]
pub trait KvDataFactory: Send + Sync {
    async fn spawn(&self, ctx: KvDataContext) -> Result<Box<dyn KvData>>;
}

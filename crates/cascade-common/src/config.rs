//! Feed configuration.
//!
//! A single struct carries every knob the feed control plane recognises.
//! Unknown keys in the source document are ignored, so a feed can be
//! configured from a larger deployment-wide document.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one feed instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedConfig {
    /// Configured number of vbuckets per bucket.
    pub max_vbuckets: usize,

    /// KV cluster address `<host:port>`.
    pub cluster_addr: String,

    /// Wait for a response to a stream-request batch, in milliseconds.
    pub feed_wait_stream_req_timeout: u64,

    /// Wait for a response to a stream-end batch, in milliseconds.
    pub feed_wait_stream_end_timeout: u64,

    /// Channel size for the feed's request path and back path.
    pub feed_chan_size: usize,

    /// Channel size of the per-bucket data-path routine. Forwarded to the
    /// data-path worker; the control plane does not consume it.
    pub mutation_chan_size: usize,

    /// Period, in milliseconds, for the data path's periodic sync messages.
    /// Forwarded to the data-path worker.
    pub vbucket_sync_timeout: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_vbuckets: 1024,
            cluster_addr: "localhost:9000".to_string(),
            feed_wait_stream_req_timeout: 10_000,
            feed_wait_stream_end_timeout: 10_000,
            feed_chan_size: 64,
            mutation_chan_size: 10_000,
            vbucket_sync_timeout: 500,
        }
    }
}

impl FeedConfig {
    /// Parse a configuration document. Keys the feed does not recognise
    /// are ignored.
    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Stream-request reconciler deadline.
    pub fn stream_req_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_wait_stream_req_timeout)
    }

    /// Stream-end reconciler deadline.
    pub fn stream_end_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_wait_stream_end_timeout)
    }

    /// Data-path sync period.
    pub fn vbucket_sync_period(&self) -> Duration {
        Duration::from_millis(self.vbucket_sync_timeout)
    }
}

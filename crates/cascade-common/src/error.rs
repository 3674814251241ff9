//! Error types for Cascade.

use thiserror::Error;

/// Result type alias for Cascade operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cascade.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed subscriber set: evaluators and routers disagree
    #[error("inconsistent feed: {0}")]
    InconsistentFeed(String),

    /// A vbucket carries a branch id with no failover history
    #[error("invalid vbucket branch: {0}")]
    InvalidVbucketBranch(String),

    /// Operation names a bucket the feed does not carry
    #[error("invalid bucket: {0}")]
    InvalidBucket(String),

    /// A vbucket outside the feed's partition space, or with an
    /// empty failover log
    #[error("invalid vbucket: {0}")]
    InvalidVbucket(String),

    /// Upstream feeder connection failure
    #[error("feeder error: {0}")]
    Feeder(String),

    /// Upstream reports the vbucket is no longer hosted here
    #[error("not my vbucket: {0}")]
    NotMyVbucket(String),

    /// Upstream rejected a stream-request
    #[error("stream request failed: {0}")]
    StreamRequest(String),

    /// Upstream rejected a stream-end
    #[error("stream end failed: {0}")]
    StreamEnd(String),

    /// Feedback for a batch did not complete within the timeout
    #[error("response timeout: {0}")]
    ResponseTimeout(String),

    /// Cluster topology lookup failure
    #[error("cluster info error: {0}")]
    ClusterInfo(String),

    /// CDC connection to the cluster failed
    #[error("dcp connection error: {0}")]
    DcpConnection(String),

    /// Named pool is absent on the cluster
    #[error("dcp pool error: {0}")]
    DcpPool(String),

    /// Named bucket is absent on the cluster
    #[error("dcp bucket error: {0}")]
    DcpBucket(String),

    /// Downstream endpoint transport failure
    #[error("endpoint error: {0}")]
    Endpoint(String),

    /// The feed has been shut down
    #[error("feed closed: {0}")]
    Closed(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(e.into())
    }
}

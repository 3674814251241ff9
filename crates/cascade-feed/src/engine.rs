//! Subscriber engines.
//!
//! An engine binds one subscriber's evaluator to its router. Engines are
//! installed on the feed per bucket and pushed to the bucket's data-path
//! worker, which invokes the evaluator per mutation and routes the result
//! through the router's endpoints. The feed core only manages their
//! lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use cascade_common::types::InstanceId;
use cascade_common::{Error, Result};

/// Per-subscriber mutation evaluator, hosted by the data path.
pub trait Evaluator: Send + Sync + std::fmt::Debug {
    /// The bucket this evaluator subscribes to.
    fn bucket(&self) -> &str;
}

/// Per-subscriber routing policy: which downstream addresses receive the
/// evaluator's output.
pub trait Router: Send + Sync + std::fmt::Debug {
    fn endpoints(&self) -> Vec<String>;
}

/// A subscriber-scoped (evaluator, router) pair.
#[derive(Clone)]
pub struct Engine {
    id: InstanceId,
    evaluator: Arc<dyn Evaluator>,
    router: Arc<dyn Router>,
}

impl Engine {
    pub fn new(id: InstanceId, evaluator: Arc<dyn Evaluator>, router: Arc<dyn Router>) -> Self {
        Self {
            id,
            evaluator,
            router,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn bucket(&self) -> &str {
        self.evaluator.bucket()
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("bucket", &self.bucket())
            .finish()
    }
}

/// Supplies the subscriber set of a request: matching maps of evaluators
/// and routers keyed by instance id.
pub trait Subscriber: Send + Sync {
    fn evaluators(&self) -> Result<HashMap<InstanceId, Arc<dyn Evaluator>>>;
    fn routers(&self) -> Result<HashMap<InstanceId, Arc<dyn Router>>>;
}

/// A concrete subscriber set carried inside feed requests.
#[derive(Clone, Default)]
pub struct SubscriberSet {
    pub evaluators: HashMap<InstanceId, Arc<dyn Evaluator>>,
    pub routers: HashMap<InstanceId, Arc<dyn Router>>,
}

impl Subscriber for SubscriberSet {
    fn evaluators(&self) -> Result<HashMap<InstanceId, Arc<dyn Evaluator>>> {
        Ok(self.evaluators.clone())
    }

    fn routers(&self) -> Result<HashMap<InstanceId, Arc<dyn Router>>> {
        Ok(self.routers.clone())
    }
}

/// Extract and cross-check a request's subscriber set.
pub(crate) fn subscriber_set(
    req: &dyn Subscriber,
) -> Result<(
    HashMap<InstanceId, Arc<dyn Evaluator>>,
    HashMap<InstanceId, Arc<dyn Router>>,
)> {
    let evaluators = req
        .evaluators()
        .map_err(|e| Error::InconsistentFeed(format!("evaluators: {e}")))?;
    let routers = req
        .routers()
        .map_err(|e| Error::InconsistentFeed(format!("routers: {e}")))?;

    if evaluators.len() != routers.len() {
        return Err(Error::InconsistentFeed(format!(
            "{} evaluators vs {} routers",
            evaluators.len(),
            routers.len()
        )));
    }
    for id in evaluators.keys() {
        if !routers.contains_key(id) {
            return Err(Error::InconsistentFeed(format!("no router for instance {id}")));
        }
    }
    Ok((evaluators, routers))
}

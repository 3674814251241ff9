//! The feed actor.
//!
//! Exactly one task runs [`FeedActor::run`]; every mutable field of the
//! feed is owned by that task and touched from nowhere else. Client
//! commands arrive on the request channel, data-path feedback on the
//! buffered back channel, and a periodic tick reports back-channel depth.
//! The stream-feedback reconcilers run synchronously inside the actor and
//! are the only back-channel consumer while they run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cascade_common::config::FeedConfig;
use cascade_common::types::{InstanceId, Opaque};
use cascade_common::{Error, Result};
use futures::FutureExt;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::control::{new_opaque, Feedback, FeedbackSender, StreamStatus};
use crate::endpoint::{equivalent_addr, EndpointTable, RouterEndpoint, RouterEndpointFactory};
use crate::engine::{subscriber_set, Engine, Router, Subscriber};
use crate::feed::{
    AddBucketsRequest, AddInstancesRequest, DelBucketsRequest, DelInstancesRequest, FeedCommand,
    FeedContext, MutationTopicRequest, RepairEndpointsRequest, RestartVbucketsRequest,
    ShutdownVbucketsRequest, TopicResponse,
};
use crate::feeder::{connection_name, BucketFeeder, FeederFactory};
use crate::kvdata::{KvData, KvDataContext, KvDataFactory};
use crate::timestamp::Timestamp;
use crate::topology::{latest_branches, Topology};

/// Which batched stream operation to issue against a feeder.
enum StreamOp {
    Start,
    End,
}

/// Outcome of classifying one back-channel message during a reconciler
/// wait.
enum Classified {
    /// Matched the batch; keep waiting.
    Matched,
    /// Matched and the batch is complete.
    Done,
    /// Not ours; set aside and re-enqueue afterwards.
    Skip(Feedback),
}

pub(crate) struct FeedActor {
    topic: String,
    endpoint_type: String,
    config: FeedConfig,

    endpoint_factory: Arc<dyn RouterEndpointFactory>,
    feeder_factory: Arc<dyn FeederFactory>,
    kvdata_factory: Arc<dyn KvDataFactory>,
    topology: Arc<dyn Topology>,

    // upstream book-keeping, all keyed by bucket.
    // req_tss: outstanding stream requests; a vbucket leaves only on a
    // success, rollback or error response from the data path.
    req_tss: HashMap<String, Timestamp>,
    // act_tss: vbuckets whose stream-begin came back SUCCESS.
    act_tss: HashMap<String, Timestamp>,
    // roll_tss: vbuckets whose stream-begin came back ROLLBACK.
    roll_tss: HashMap<String, Timestamp>,

    feeders: HashMap<String, Box<dyn BucketFeeder>>,
    // downstream
    kvdata: HashMap<String, Box<dyn KvData>>,
    engines: HashMap<String, HashMap<InstanceId, Engine>>,
    endpoints: EndpointTable,

    cmd_rx: mpsc::Receiver<FeedCommand>,
    back_rx: mpsc::Receiver<Feedback>,
    back_tx: mpsc::Sender<Feedback>,
    fin_tx: watch::Sender<bool>,
    fin_rx: watch::Receiver<bool>,
    finished: bool,
}

impl FeedActor {
    pub(crate) fn new(
        topic: String,
        ctx: FeedContext,
        cmd_rx: mpsc::Receiver<FeedCommand>,
        back_rx: mpsc::Receiver<Feedback>,
        back_tx: mpsc::Sender<Feedback>,
        fin_tx: watch::Sender<bool>,
        fin_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            topic,
            endpoint_type: String::new(),
            config: ctx.config,
            endpoint_factory: ctx.endpoint_factory,
            feeder_factory: ctx.feeder_factory,
            kvdata_factory: ctx.kvdata_factory,
            topology: ctx.topology,
            req_tss: HashMap::new(),
            act_tss: HashMap::new(),
            roll_tss: HashMap::new(),
            feeders: HashMap::new(),
            kvdata: HashMap::new(),
            engines: HashMap::new(),
            endpoints: HashMap::new(),
            cmd_rx,
            back_rx,
            back_tx,
            fin_tx,
            fin_rx,
            finished: false,
        }
    }

    /// Run the actor until shutdown. A panic anywhere in the loop is
    /// caught, logged, and followed by the same shutdown path a client
    /// request would take.
    pub(crate) async fn run(mut self) {
        if let Err(panic) = AssertUnwindSafe(self.serve()).catch_unwind().await {
            error!(
                topic = %self.topic,
                panic = panic_message(panic.as_ref()),
                "feed actor crashed; shutting down"
            );
            let _ = AssertUnwindSafe(self.shutdown()).catch_unwind().await;
        }
    }

    async fn serve(&mut self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // every handle dropped: release upstream and
                    // downstream resources before exiting.
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                fb = self.back_rx.recv() => {
                    if let Some(fb) = fb {
                        self.handle_feedback(fb).await;
                    }
                }
                _ = ticker.tick() => {
                    let depth = self.back_rx.len();
                    if depth > 0 {
                        debug!(topic = %self.topic, depth, "back channel has pending messages");
                    }
                }
            }
        }
    }

    /// Returns true when the actor should exit.
    async fn handle_command(&mut self, cmd: FeedCommand) -> bool {
        match cmd {
            FeedCommand::Start { req, reply } => {
                let result = self.start(req).await.map(|_| self.topic_response());
                let _ = reply.send(result);
            }
            FeedCommand::RestartVbuckets { req, reply } => {
                let result = self
                    .restart_vbuckets(req)
                    .await
                    .map(|_| self.topic_response());
                let _ = reply.send(result);
            }
            FeedCommand::ShutdownVbuckets { req, reply } => {
                let _ = reply.send(self.shutdown_vbuckets(req).await);
            }
            FeedCommand::AddBuckets { req, reply } => {
                let result = self.add_buckets(req).await.map(|_| self.topic_response());
                let _ = reply.send(result);
            }
            FeedCommand::DelBuckets { req, reply } => {
                let _ = reply.send(self.del_buckets(req).await);
            }
            FeedCommand::AddInstances { req, reply } => {
                let _ = reply.send(self.add_instances(req).await);
            }
            FeedCommand::DelInstances { req, reply } => {
                let _ = reply.send(self.del_instances(req).await);
            }
            FeedCommand::RepairEndpoints { req, reply } => {
                let _ = reply.send(self.repair_endpoints(req).await);
            }
            FeedCommand::GetTopicResponse { reply } => {
                let _ = reply.send(self.topic_response());
            }
            FeedCommand::GetStatistics { reply } => {
                let _ = reply.send(self.statistics().await);
            }
            FeedCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ---- client commands

    /// Start a new feed: install subscribers, then open streams bucket by
    /// bucket. A per-bucket failure cleans that bucket and moves on; the
    /// last error wins.
    async fn start(&mut self, req: MutationTopicRequest) -> Result<()> {
        self.endpoint_type = req.endpoint_type;
        self.process_subscribers(&req.subscribers).await?;

        let opaque = new_opaque();
        let mut last_err = None;
        for ts in &req.req_timestamps {
            if let Err(e) = self.start_bucket_streams(opaque, ts, false).await {
                error!(topic = %self.topic, bucket = %ts.bucket(), error = %e, "stream start failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Restart a subset of upstreams. A vbucket restart implies an
    /// endpoint repair across every currently-known address.
    async fn restart_vbuckets(&mut self, req: RestartVbucketsRequest) -> Result<()> {
        let raddrs: Vec<String> = self.endpoints.keys().cloned().collect();
        if let Err(e) = self
            .repair_endpoints(RepairEndpointsRequest { endpoints: raddrs })
            .await
        {
            error!(topic = %self.topic, error = %e, "endpoint repair during restart failed");
        }

        let opaque = new_opaque();
        let mut last_err = None;
        for ts in &req.restart_timestamps {
            if let Err(e) = self.start_bucket_streams(opaque, ts, true).await {
                error!(topic = %self.topic, bucket = %ts.bucket(), error = %e, "stream restart failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shut down a subset of upstream streams. Unknown buckets are
    /// reported but deliberately not cleaned up.
    async fn shutdown_vbuckets(&mut self, req: ShutdownVbucketsRequest) -> Result<()> {
        let opaque = new_opaque();
        let mut last_err = None;
        for req_ts in &req.shutdown_timestamps {
            let pool = req_ts.pool().to_string();
            let bucket = req_ts.bucket().to_string();

            let vbnos = match self.topology.local_vbuckets(&pool, &bucket).await {
                Ok(v) => v,
                Err(e) => {
                    error!(topic = %self.topic, bucket = %bucket, error = %e, "vbmap lookup failed");
                    last_err = Some(e);
                    continue;
                }
            };
            let ts = req_ts.select_vbuckets(&vbnos);

            let (Some(act_ts), Some(roll_ts), Some(out_ts)) = (
                self.act_tss.get(&bucket).cloned(),
                self.roll_tss.get(&bucket).cloned(),
                self.req_tss.get(&bucket).cloned(),
            ) else {
                error!(topic = %self.topic, bucket = %bucket, "shutdown for bucket the feed does not carry");
                last_err = Some(Error::InvalidBucket(bucket));
                continue;
            };

            if let Err(e) = self
                .bucket_feed(opaque, &pool, &bucket, &ts, StreamOp::End)
                .await
            {
                last_err = Some(e);
                continue;
            }
            let (end_ts, _fail_ts, err) = self.wait_stream_ends(opaque, &bucket, &ts).await;

            // forget the vbuckets that are confirmed down
            let ended = end_ts.vbuckets();
            self.act_tss
                .insert(bucket.clone(), act_ts.filter_vbuckets(&ended));
            self.req_tss
                .insert(bucket.clone(), out_ts.filter_vbuckets(&ended));
            self.roll_tss
                .insert(bucket.clone(), roll_ts.filter_vbuckets(&ended));
            if let Some(e) = err {
                last_err = Some(e);
            }
            info!(
                topic = %self.topic, bucket = %bucket, opaque,
                ended = ?ended, "stream-end completed"
            );
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Add buckets to a running feed; Start for the newly listed buckets.
    async fn add_buckets(&mut self, req: AddBucketsRequest) -> Result<()> {
        self.process_subscribers(&req.subscribers).await?;

        let opaque = new_opaque();
        let mut last_err = None;
        for ts in &req.req_timestamps {
            if let Err(e) = self.start_bucket_streams(opaque, ts, false).await {
                error!(topic = %self.topic, bucket = %ts.bucket(), error = %e, "stream start failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove buckets and all their upstream and downstream elements,
    /// engines included, endpoints excluded.
    async fn del_buckets(&mut self, req: DelBucketsRequest) -> Result<()> {
        for bucket in &req.buckets {
            self.cleanup_bucket(bucket, true).await;
        }
        Ok(())
    }

    /// Install additional subscribers and push them to every bucket's
    /// data path.
    async fn add_instances(&mut self, req: AddInstancesRequest) -> Result<()> {
        self.process_subscribers(&req.subscribers).await?;

        let mut err = None;
        for (bucket, engines) in &self.engines {
            match self.kvdata.get(bucket) {
                Some(kv) => {
                    if let Err(e) = kv.add_engines(engines, &self.endpoints).await {
                        error!(topic = %self.topic, bucket = %bucket, error = %e, "add-engines failed");
                    }
                }
                None => {
                    error!(topic = %self.topic, bucket = %bucket, "add-instances for bucket with no data path");
                    err = Some(Error::InvalidBucket(bucket.clone()));
                }
            }
        }
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove subscribers by id, informing each affected bucket's data
    /// path.
    async fn del_instances(&mut self, req: DelInstancesRequest) -> Result<()> {
        let mut kept: HashMap<String, HashMap<InstanceId, Engine>> = HashMap::new();
        let mut doomed: HashMap<String, Vec<InstanceId>> = HashMap::new();
        for (bucket, engines) in &self.engines {
            let mut keep = HashMap::new();
            let mut drop_ids = Vec::new();
            for (&id, engine) in engines {
                if req.instance_ids.contains(&id) {
                    drop_ids.push(id);
                } else {
                    keep.insert(id, engine.clone());
                }
            }
            kept.insert(bucket.clone(), keep);
            if !drop_ids.is_empty() {
                doomed.insert(bucket.clone(), drop_ids);
            }
        }

        let mut err = None;
        for (bucket, ids) in &doomed {
            match self.kvdata.get(bucket) {
                Some(kv) => {
                    if let Err(e) = kv.delete_engines(ids).await {
                        error!(topic = %self.topic, bucket = %bucket, error = %e, "delete-engines failed");
                    }
                }
                None => {
                    error!(topic = %self.topic, bucket = %bucket, "del-instances for bucket with no data path");
                    err = Some(Error::InvalidBucket(bucket.clone()));
                }
            }
        }
        self.engines = kept;
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Restart the listed endpoint addresses if they are not active, then
    /// push the refreshed endpoint table to every data path. Transport
    /// errors are aggregated; the last one is returned.
    async fn repair_endpoints(&mut self, req: RepairEndpointsRequest) -> Result<()> {
        let mut last_err = None;
        for raddr in &req.endpoints {
            debug!(topic = %self.topic, endpoint = %raddr, "trying to repair");
            if let Err(e) = self.ensure_endpoint(raddr).await {
                error!(topic = %self.topic, endpoint = %raddr, error = %e, "error repairing endpoint");
                last_err = Some(e);
            }
        }

        for (bucket, kv) in &self.kvdata {
            // though only endpoints have been updated
            let engines = self.engines.get(bucket).cloned().unwrap_or_default();
            if let Err(e) = kv.add_engines(&engines, &self.endpoints).await {
                error!(topic = %self.topic, bucket = %bucket, error = %e, "endpoint push failed");
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- the per-bucket stream machine

    /// Open (or restart) upstream streams for one bucket, per the request
    /// timestamp. Shared by Start, RestartVbuckets and AddBuckets.
    async fn start_bucket_streams(
        &mut self,
        opaque: Opaque,
        req_ts: &Timestamp,
        restart: bool,
    ) -> Result<()> {
        let pool = req_ts.pool().to_string();
        let bucket = req_ts.bucket().to_string();

        if restart && !self.carries_bucket(&bucket) {
            self.cleanup_bucket(&bucket, false).await;
            return Err(Error::InvalidBucket(bucket));
        }

        let vbnos = match self.topology.local_vbuckets(&pool, &bucket).await {
            Ok(v) => v,
            Err(e) => {
                self.cleanup_bucket(&bucket, false).await;
                return Err(e);
            }
        };
        let ts = req_ts.select_vbuckets(&vbnos);

        // never re-request an already active vbucket
        let ts = match self.act_tss.get(&bucket) {
            Some(act) => ts.filter_vbuckets(&act.vbuckets()),
            None => ts,
        };
        // forget previous rollbacks for the vbuckets being re-requested
        let roll_base = self
            .roll_tss
            .get(&bucket)
            .map(|roll| roll.filter_vbuckets(&ts.vbuckets()));
        // vbuckets with an outstanding request are left alone
        let ts = match self.req_tss.get(&bucket) {
            Some(outstanding) => ts.filter_vbuckets(&outstanding.vbuckets()),
            None => ts,
        };
        let out_ts = ts.union(self.req_tss.get(&bucket));

        // a restarted bucket refreshes its data path before the upstream
        if restart {
            if let Some(kv) = self.kvdata.get(&bucket) {
                if let Err(e) = kv.update_ts(&ts).await {
                    error!(topic = %self.topic, bucket = %bucket, error = %e, "update-ts failed");
                }
            }
        }

        if let Err(e) = self
            .bucket_feed(opaque, &pool, &bucket, &ts, StreamOp::Start)
            .await
        {
            self.cleanup_bucket(&bucket, false).await;
            return Err(e);
        }
        if let Err(e) = self.start_data_path(&bucket, &ts, !restart).await {
            self.cleanup_bucket(&bucket, false).await;
            return Err(e);
        }

        // wait for the streams to start
        let (roll, fail, act, err) = self.wait_stream_requests(opaque, &bucket, &ts).await;
        let act_full = act.union(self.act_tss.get(&bucket));
        self.roll_tss
            .insert(bucket.clone(), roll.union(roll_base.as_ref()));
        self.act_tss.insert(bucket.clone(), act_full);
        // forget vbuckets for which a response was received
        let out_ts = out_ts
            .filter_vbuckets(&roll.vbuckets())
            .filter_vbuckets(&act.vbuckets())
            .filter_vbuckets(&fail.vbuckets());
        self.req_tss.insert(bucket.clone(), out_ts);

        info!(
            topic = %self.topic, bucket = %bucket, opaque,
            rollback = ?roll.vbuckets(), active = ?act.vbuckets(),
            "stream-request completed"
        );
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn carries_bucket(&self, bucket: &str) -> bool {
        self.req_tss.contains_key(bucket)
            || self.act_tss.contains_key(bucket)
            || self.roll_tss.contains_key(bucket)
    }

    /// Open or reuse the bucket's feeder and issue one batched stream
    /// operation against it. A new feeder fetches failover logs for the
    /// requested vbuckets before connecting, to pin their latest branch.
    async fn bucket_feed(
        &mut self,
        opaque: Opaque,
        pool: &str,
        bucket: &str,
        ts: &Timestamp,
        op: StreamOp,
    ) -> Result<()> {
        if !self.feeders.contains_key(bucket) {
            if matches!(op, StreamOp::End) {
                return Err(Error::Feeder(format!("{bucket}: no feeder for stream-end")));
            }
            let vbnos = ts.vbuckets();
            let logs = self.topology.failover_logs(pool, bucket, &vbnos).await?;
            let _vbuuids = latest_branches(bucket, &vbnos, &logs)?;

            let name = connection_name(bucket, &self.topic);
            let feeder = self
                .feeder_factory
                .open_feed(&name, pool, bucket)
                .await
                .map_err(|e| Error::Feeder(format!("{bucket}: {e}")))?;
            self.feeders.insert(bucket.to_string(), feeder);
        }

        let feeder = match self.feeders.get_mut(bucket) {
            Some(f) => f,
            None => return Err(Error::Feeder(format!("{bucket}: feeder lost"))),
        };
        match op {
            StreamOp::Start => {
                info!(topic = %self.topic, bucket = %bucket, start = %ts, "start-timestamp");
                feeder
                    .start_vbucket_streams(opaque, ts)
                    .await
                    .map_err(|e| Error::Feeder(format!("{bucket}: {e}")))
            }
            StreamOp::End => {
                info!(topic = %self.topic, bucket = %bucket, stop = %ts, "stop-timestamp");
                feeder
                    .end_vbucket_streams(opaque, ts)
                    .await
                    .map_err(|e| Error::Feeder(format!("{bucket}: {e}")))
            }
        }
    }

    /// Open the bucket's data path if it is not already open. An existing
    /// worker is refreshed with the new timestamp instead (unless the
    /// restart path already did so).
    async fn start_data_path(
        &mut self,
        bucket: &str,
        ts: &Timestamp,
        update_existing: bool,
    ) -> Result<()> {
        if let Some(kv) = self.kvdata.get(bucket) {
            if update_existing {
                if let Err(e) = kv.update_ts(ts).await {
                    error!(topic = %self.topic, bucket = %bucket, error = %e, "update-ts failed");
                }
            }
            return Ok(());
        }

        let events = self
            .feeders
            .get_mut(bucket)
            .and_then(|f| f.take_events())
            .ok_or_else(|| Error::Feeder(format!("{bucket}: mutation channel unavailable")))?;
        let ctx = KvDataContext {
            topic: self.topic.clone(),
            bucket: bucket.to_string(),
            ts: ts.clone(),
            engines: self.engines.get(bucket).cloned().unwrap_or_default(),
            endpoints: self.endpoints.clone(),
            events,
            feedback: FeedbackSender::new(self.back_tx.clone(), self.fin_rx.clone()),
            config: self.config.clone(),
        };
        let kv = self.kvdata_factory.spawn(ctx).await?;
        self.kvdata.insert(bucket.to_string(), kv);
        Ok(())
    }

    /// Shut down upstream and data path for one bucket and drop its
    /// book-keeping.
    async fn cleanup_bucket(&mut self, bucket: &str, engines_too: bool) {
        if engines_too {
            self.engines.remove(bucket);
        }
        self.req_tss.remove(bucket);
        self.act_tss.remove(bucket);
        self.roll_tss.remove(bucket);
        if let Some(mut feeder) = self.feeders.remove(bucket) {
            if let Err(e) = feeder.close_feed().await {
                error!(topic = %self.topic, bucket = %bucket, error = %e, "feeder close failed");
            }
        }
        if let Some(kv) = self.kvdata.remove(bucket) {
            if let Err(e) = kv.close().await {
                error!(topic = %self.topic, bucket = %bucket, error = %e, "data path close failed");
            }
        }
    }

    // ---- subscribers and endpoints

    async fn process_subscribers(&mut self, subs: &dyn Subscriber) -> Result<()> {
        let (evaluators, routers) = subscriber_set(subs)?;

        // start a fresh set of endpoints from the routers
        self.start_endpoints(&routers).await;

        for (id, evaluator) in evaluators {
            let Some(router) = routers.get(&id).cloned() else {
                continue;
            };
            let bucket = evaluator.bucket().to_string();
            let engine = Engine::new(id, evaluator, router);
            info!(topic = %self.topic, instance = id, bucket = %bucket, "new engine created");
            self.engines.entry(bucket).or_default().insert(id, engine);
        }
        Ok(())
    }

    /// Start every endpoint any router advertises; existing live
    /// endpoints are reused. Failures are logged and iterated past.
    async fn start_endpoints(&mut self, routers: &HashMap<InstanceId, Arc<dyn Router>>) {
        for router in routers.values() {
            for raddr in router.endpoints() {
                if let Err(e) = self.ensure_endpoint(&raddr).await {
                    error!(topic = %self.topic, endpoint = %raddr, error = %e, "error starting endpoint");
                }
            }
        }
    }

    /// Look up, probe, and if needed (re)construct the endpoint for
    /// `raddr`, registering it under both the raw and canonical address.
    async fn ensure_endpoint(&mut self, raddr: &str) -> Result<()> {
        let (canonical, existing) = self.get_endpoint(raddr)?;
        let endpoint = match existing {
            Some(ep) if ep.ping() => {
                info!(topic = %self.topic, endpoint = %raddr, "endpoint active");
                ep
            }
            _ => {
                // endpoint absent, or found but not responding
                info!(topic = %self.topic, endpoint = %raddr, "endpoint starting");
                self.endpoint_factory
                    .create(&self.topic, &self.endpoint_type, raddr)
                    .await?
            }
        };
        // both the advertised and the canonical spelling resolve to the
        // same transport
        self.endpoints.insert(raddr.to_string(), endpoint.clone());
        self.endpoints.insert(canonical, endpoint);
        Ok(())
    }

    /// Normalise `raddr` against the current endpoint address set and
    /// return the canonical form plus the endpoint, if one is registered.
    fn get_endpoint(&self, raddr: &str) -> Result<(String, Option<Arc<dyn RouterEndpoint>>)> {
        let known: Vec<String> = self.endpoints.keys().cloned().collect();
        let canonical = equivalent_addr(raddr, &known)?;
        if canonical != raddr {
            debug!(topic = %self.topic, endpoint = %raddr, taken_as = %canonical, "endpoint address normalised");
        }
        let endpoint = self.endpoints.get(&canonical).cloned();
        Ok((canonical, endpoint))
    }

    // ---- back-channel handling between commands

    async fn handle_feedback(&mut self, fb: Feedback) {
        match fb {
            Feedback::StreamRequest {
                bucket,
                opaque: _,
                status,
                vbucket,
                vbuuid: _,
                seqno,
            } => {
                let Some(out_ts) = self.req_tss.get(&bucket) else {
                    error!(topic = %self.topic, bucket = %bucket, vbucket, "stream-request feedback for unknown bucket");
                    return;
                };
                let Some(entry) = out_ts.get(vbucket) else {
                    error!(topic = %self.topic, bucket = %bucket, vbucket, "stream-request feedback with no outstanding request");
                    return;
                };
                debug!(topic = %self.topic, bucket = %bucket, vbucket, status = %status, "back channel flush");
                let pool = out_ts.pool().to_string();
                let trimmed = out_ts.filter_vbuckets(&[vbucket]);
                self.req_tss.insert(bucket.clone(), trimmed);

                match status {
                    StreamStatus::Rollback => {
                        self.roll_tss
                            .entry(bucket.clone())
                            .or_insert_with(|| Timestamp::new(pool.clone(), bucket.clone()))
                            .append(vbucket, seqno, entry.vbuuid, 0, 0);
                    }
                    StreamStatus::Success => {
                        self.act_tss
                            .entry(bucket.clone())
                            .or_insert_with(|| Timestamp::new(pool.clone(), bucket.clone()))
                            .append(vbucket, entry.seqno, entry.vbuuid, 0, 0);
                    }
                    // failures leave the vbucket out of every set; the
                    // synchronous reconciler timed out on it already
                    _ => {}
                }
            }
            Feedback::StreamEnd {
                bucket, vbucket, ..
            } => {
                debug!(topic = %self.topic, bucket = %bucket, vbucket, "back channel flush stream-end");
                for tss in [&mut self.req_tss, &mut self.act_tss, &mut self.roll_tss] {
                    if let Some(ts) = tss.get(&bucket) {
                        tss.insert(bucket.clone(), ts.filter_vbuckets(&[vbucket]));
                    }
                }
            }
            Feedback::KvdataFinished { bucket } => {
                let done = self
                    .act_tss
                    .get(&bucket)
                    .map(|act| act.is_empty())
                    .unwrap_or(false);
                if done {
                    // bucket is drained
                    debug!(topic = %self.topic, bucket = %bucket, "self deleting bucket");
                    self.cleanup_bucket(&bucket, false).await;
                }
            }
        }
    }

    // ---- stream-feedback reconcilers

    /// Wait for the data path to report stream-request outcomes for every
    /// vbucket in `ts`, bounded by the configured timeout. Returns the
    /// (rollback, failed, active) classification and the last
    /// classification error, or the timeout error if none.
    async fn wait_stream_requests(
        &mut self,
        opaque: Opaque,
        bucket: &str,
        ts: &Timestamp,
    ) -> (Timestamp, Timestamp, Timestamp, Option<Error>) {
        let mut roll_ts = Timestamp::new(ts.pool(), bucket);
        let mut fail_ts = Timestamp::new(ts.pool(), bucket);
        let mut act_ts = Timestamp::new(ts.pool(), bucket);
        let mut remaining = ts.vbuckets();
        if remaining.is_empty() {
            return (roll_ts, fail_ts, act_ts, None);
        }

        let mut err: Option<Error> = None;
        let deadline = Instant::now() + self.config.stream_req_timeout();
        let (timed_out, finished) = self
            .wait_on_feedback(deadline, |msg| match msg {
                Feedback::StreamRequest {
                    bucket: b,
                    opaque: o,
                    status,
                    vbucket,
                    vbuuid,
                    seqno,
                } if b == bucket && o == opaque && ts.contains(vbucket) => {
                    match status {
                        StreamStatus::Success => act_ts.append(vbucket, seqno, vbuuid, 0, 0),
                        StreamStatus::Rollback => roll_ts.append(vbucket, seqno, vbuuid, 0, 0),
                        StreamStatus::NotMyVbucket => {
                            fail_ts.append(vbucket, seqno, vbuuid, 0, 0);
                            err = Some(Error::NotMyVbucket(format!("{b} vb {vbucket}")));
                        }
                        StreamStatus::Failed => {
                            fail_ts.append(vbucket, seqno, vbuuid, 0, 0);
                            err = Some(Error::StreamRequest(format!("{b} vb {vbucket}")));
                        }
                    }
                    remaining.retain(|&v| v != vbucket);
                    if remaining.is_empty() {
                        Classified::Done
                    } else {
                        Classified::Matched
                    }
                }
                other => Classified::Skip(other),
            })
            .await;

        if timed_out && err.is_none() {
            err = Some(Error::ResponseTimeout(format!(
                "stream-request {bucket} #{opaque:x}"
            )));
        }
        if finished && err.is_none() {
            err = Some(Error::Closed(self.topic.clone()));
        }
        (roll_ts, fail_ts, act_ts, err)
    }

    /// Wait for the data path to report stream-end outcomes for every
    /// vbucket in `ts`. Returns the (ended, failed) classification and
    /// the last classification error, or the timeout error if none.
    async fn wait_stream_ends(
        &mut self,
        opaque: Opaque,
        bucket: &str,
        ts: &Timestamp,
    ) -> (Timestamp, Timestamp, Option<Error>) {
        let mut end_ts = Timestamp::new(ts.pool(), bucket);
        let mut fail_ts = Timestamp::new(ts.pool(), bucket);
        let mut remaining = ts.vbuckets();
        if remaining.is_empty() {
            return (end_ts, fail_ts, None);
        }

        let mut err: Option<Error> = None;
        let deadline = Instant::now() + self.config.stream_end_timeout();
        let (timed_out, finished) = self
            .wait_on_feedback(deadline, |msg| match msg {
                Feedback::StreamEnd {
                    bucket: b,
                    opaque: o,
                    status,
                    vbucket,
                } if b == bucket && o == opaque && ts.contains(vbucket) => {
                    match status {
                        StreamStatus::Success => end_ts.append(vbucket, 0, 0, 0, 0),
                        StreamStatus::NotMyVbucket => {
                            fail_ts.append(vbucket, 0, 0, 0, 0);
                            err = Some(Error::NotMyVbucket(format!("{b} vb {vbucket}")));
                        }
                        _ => {
                            fail_ts.append(vbucket, 0, 0, 0, 0);
                            err = Some(Error::StreamEnd(format!("{b} vb {vbucket}")));
                        }
                    }
                    remaining.retain(|&v| v != vbucket);
                    if remaining.is_empty() {
                        Classified::Done
                    } else {
                        Classified::Matched
                    }
                }
                other => Classified::Skip(other),
            })
            .await;

        if timed_out && err.is_none() {
            err = Some(Error::ResponseTimeout(format!(
                "stream-end {bucket} #{opaque:x}"
            )));
        }
        if finished && err.is_none() {
            err = Some(Error::Closed(self.topic.clone()));
        }
        (end_ts, fail_ts, err)
    }

    /// Drain the back channel until `classify` reports the batch done,
    /// the deadline fires, or the finish signal trips. Messages the
    /// classifier sets aside are re-enqueued afterwards in their original
    /// order. Returns (timed_out, finished).
    async fn wait_on_feedback(
        &mut self,
        deadline: Instant,
        mut classify: impl FnMut(Feedback) -> Classified,
    ) -> (bool, bool) {
        let mut held = Vec::new();
        let mut fin = self.fin_rx.clone();
        let outcome = loop {
            tokio::select! {
                msg = self.back_rx.recv() => match msg {
                    Some(msg) => match classify(msg) {
                        Classified::Matched => {}
                        Classified::Done => break (false, false),
                        Classified::Skip(m) => held.push(m),
                    },
                    None => break (false, false),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    error!(topic = %self.topic, "feedback timeout");
                    break (true, false);
                }
                _ = fin.changed() => break (false, true),
            }
        };
        // re-populate in the same order
        for msg in held {
            if self.back_tx.try_send(msg).is_err() {
                warn!(topic = %self.topic, "back channel full; held feedback dropped");
            }
        }
        outcome
    }

    // ---- snapshots

    /// Compose a topic response for the caller. Active timestamps are
    /// reported even when empty; rollback timestamps only when non-empty.
    fn topic_response(&self) -> TopicResponse {
        let mut instance_ids: Vec<InstanceId> = self
            .engines
            .values()
            .flat_map(|m| m.keys().copied())
            .collect();
        instance_ids.sort_unstable();

        let mut active: Vec<Timestamp> = self.act_tss.values().cloned().collect();
        active.sort_by(|a, b| a.bucket().cmp(b.bucket()));
        let mut rollback: Vec<Timestamp> = self
            .roll_tss
            .values()
            .filter(|ts| !ts.is_empty())
            .cloned()
            .collect();
        rollback.sort_by(|a, b| a.bucket().cmp(b.bucket()));

        TopicResponse {
            topic: self.topic.clone(),
            instance_ids,
            active_timestamps: active,
            rollback_timestamps: rollback,
        }
    }

    async fn statistics(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        doc.insert("topic".into(), json!(self.topic));
        let instance_ids: Vec<String> = self
            .engines
            .values()
            .flat_map(|m| m.keys().map(|id| id.to_string()))
            .collect();
        doc.insert("engines".into(), json!(instance_ids));

        let mut buckets = serde_json::Map::new();
        let names: std::collections::BTreeSet<&String> = self
            .req_tss
            .keys()
            .chain(self.act_tss.keys())
            .chain(self.roll_tss.keys())
            .collect();
        for bucket in names {
            let vbnos = |tss: &HashMap<String, Timestamp>| {
                tss.get(bucket).map(|ts| ts.vbuckets()).unwrap_or_default()
            };
            buckets.insert(
                bucket.clone(),
                json!({
                    "reqts": vbnos(&self.req_tss),
                    "actts": vbnos(&self.act_tss),
                    "rollts": vbnos(&self.roll_tss),
                }),
            );
        }
        doc.insert("buckets".into(), serde_json::Value::Object(buckets));

        for (bucket, kv) in &self.kvdata {
            doc.insert(format!("bucket-{bucket}"), kv.statistics().await);
        }
        let mut endpoints = serde_json::Map::new();
        for (raddr, ep) in &self.endpoints {
            endpoints.insert(raddr.clone(), ep.statistics());
        }
        doc.insert("endpoints".into(), serde_json::Value::Object(endpoints));
        serde_json::Value::Object(doc)
    }

    // ---- teardown

    /// Close every feeder, data-path worker and endpoint, then trip the
    /// finish signal. Safe to call more than once.
    async fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        for (bucket, feeder) in self.feeders.iter_mut() {
            if let Err(e) = feeder.close_feed().await {
                error!(topic = %self.topic, bucket = %bucket, error = %e, "feeder close failed");
            }
        }
        self.feeders.clear();
        for (bucket, kv) in std::mem::take(&mut self.kvdata) {
            if let Err(e) = kv.close().await {
                error!(topic = %self.topic, bucket = %bucket, error = %e, "data path close failed");
            }
        }
        // the table is double-keyed; close each transport exactly once
        let mut closed: Vec<Arc<dyn RouterEndpoint>> = Vec::new();
        for (_, ep) in std::mem::take(&mut self.endpoints) {
            if closed.iter().any(|c| Arc::ptr_eq(c, &ep)) {
                continue;
            }
            if let Err(e) = ep.close().await {
                error!(topic = %self.topic, error = %e, "endpoint close failed");
            }
            closed.push(ep);
        }
        let _ = self.fin_tx.send(true);
        info!(topic = %self.topic, "feed stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

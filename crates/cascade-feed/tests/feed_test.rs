//! End-to-end tests for the feed actor, driven by a scripted mock cluster.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cascade_common::config::FeedConfig;
use cascade_common::types::{InstanceId, Seqno, Vbucket, Vbuuid};
use cascade_common::{Error, Result};
use cascade_feed::{
    AddBucketsRequest, AddInstancesRequest, BucketFeeder, DelBucketsRequest, DelInstancesRequest,
    EndpointTable, Engine, Evaluator, FailoverLog, Feed, FeedContext, FeederFactory, Feedback,
    KvData, KvDataContext, KvDataFactory, MutationTopicRequest, RepairEndpointsRequest,
    RestartVbucketsRequest, Router, RouterEndpoint, RouterEndpointFactory, ShutdownVbucketsRequest,
    StreamEvent, StreamStatus, SubscriberSet, Timestamp, Topology, TopicResponse,
};
use serde_json::Value;
use tokio::sync::mpsc;

const BUCKET: &str = "beer";
const EP_ADDR: &str = "localhost:9104";

#[derive(Debug, Clone, Copy)]
enum StartReply {
    Success,
    Rollback(Seqno),
    NotMyVbucket,
    Silent,
    Delayed(u64),
}

#[derive(Debug, Clone, Copy)]
enum EndReply {
    Success,
    Silent,
}

/// Scripted upstream cluster plus recordings of everything the feed did
/// to it.
#[derive(Default)]
struct ClusterSim {
    local: HashMap<String, Vec<Vbucket>>,
    start_replies: HashMap<(String, Vbucket), StartReply>,
    end_replies: HashMap<(String, Vbucket), EndReply>,

    feeds_opened: Vec<String>,
    stream_starts: Vec<(String, Vbucket)>,
    stream_ends: Vec<(String, Vbucket)>,
    feeders_closed: Vec<String>,
    kvdata_closed: Vec<String>,
    update_ts_calls: Vec<(String, Vec<Vbucket>)>,
    add_engines_calls: usize,
    deleted_engine_ids: Vec<InstanceId>,
    endpoints_created: Vec<String>,
    endpoints_closed: Vec<String>,
    endpoint_alive: HashMap<String, Arc<AtomicBool>>,
}

type SharedSim = Arc<Mutex<ClusterSim>>;

struct MockTopology {
    sim: SharedSim,
}

#[async_trait]
impl Topology for MockTopology {
    async fn local_vbuckets(&self, _pool: &str, bucket: &str) -> Result<Vec<Vbucket>> {
        self.sim
            .lock()
            .unwrap()
            .local
            .get(bucket)
            .cloned()
            .ok_or_else(|| Error::ClusterInfo(bucket.to_string()))
    }

    async fn failover_logs(
        &self,
        _pool: &str,
        _bucket: &str,
        vbuckets: &[Vbucket],
    ) -> Result<HashMap<Vbucket, FailoverLog>> {
        Ok(vbuckets
            .iter()
            .map(|&vb| (vb, FailoverLog(vec![(0xA000 + vb as Vbuuid, 0)])))
            .collect())
    }
}

struct MockFeeder {
    bucket: String,
    sim: SharedSim,
    events_tx: mpsc::Sender<StreamEvent>,
    events_rx: Option<mpsc::Receiver<StreamEvent>>,
}

#[async_trait]
impl BucketFeeder for MockFeeder {
    async fn start_vbucket_streams(&mut self, opaque: u16, ts: &Timestamp) -> Result<()> {
        let replies: Vec<_> = {
            let mut sim = self.sim.lock().unwrap();
            ts.entries()
                .iter()
                .map(|e| {
                    sim.stream_starts.push((self.bucket.clone(), e.vbucket));
                    let reply = sim
                        .start_replies
                        .get(&(self.bucket.clone(), e.vbucket))
                        .copied()
                        .unwrap_or(StartReply::Success);
                    (*e, reply)
                })
                .collect()
        };
        for (entry, reply) in replies {
            match reply {
                StartReply::Success => {
                    let _ = self.events_tx.try_send(StreamEvent::StreamBegin {
                        opaque,
                        vbucket: entry.vbucket,
                        status: StreamStatus::Success,
                        seqno: entry.seqno,
                        vbuuid: entry.vbuuid,
                    });
                }
                StartReply::Rollback(seqno) => {
                    let _ = self.events_tx.try_send(StreamEvent::StreamBegin {
                        opaque,
                        vbucket: entry.vbucket,
                        status: StreamStatus::Rollback,
                        seqno,
                        vbuuid: entry.vbuuid,
                    });
                }
                StartReply::NotMyVbucket => {
                    let _ = self.events_tx.try_send(StreamEvent::StreamBegin {
                        opaque,
                        vbucket: entry.vbucket,
                        status: StreamStatus::NotMyVbucket,
                        seqno: 0,
                        vbuuid: 0,
                    });
                }
                StartReply::Silent => {}
                StartReply::Delayed(ms) => {
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        let _ = tx.try_send(StreamEvent::StreamBegin {
                            opaque,
                            vbucket: entry.vbucket,
                            status: StreamStatus::Success,
                            seqno: entry.seqno,
                            vbuuid: entry.vbuuid,
                        });
                    });
                }
            }
        }
        Ok(())
    }

    async fn end_vbucket_streams(&mut self, opaque: u16, ts: &Timestamp) -> Result<()> {
        let replies: Vec<_> = {
            let mut sim = self.sim.lock().unwrap();
            ts.entries()
                .iter()
                .map(|e| {
                    sim.stream_ends.push((self.bucket.clone(), e.vbucket));
                    let reply = sim
                        .end_replies
                        .get(&(self.bucket.clone(), e.vbucket))
                        .copied()
                        .unwrap_or(EndReply::Success);
                    (e.vbucket, reply)
                })
                .collect()
        };
        for (vbucket, reply) in replies {
            match reply {
                EndReply::Success => {
                    let _ = self.events_tx.try_send(StreamEvent::StreamEnd {
                        opaque,
                        vbucket,
                        status: StreamStatus::Success,
                    });
                }
                EndReply::Silent => {}
            }
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events_rx.take()
    }

    async fn close_feed(&mut self) -> Result<()> {
        self.sim.lock().unwrap().feeders_closed.push(self.bucket.clone());
        Ok(())
    }
}

struct MockFeederFactory {
    sim: SharedSim,
}

#[async_trait]
impl FeederFactory for MockFeederFactory {
    async fn open_feed(&self, name: &str, _pool: &str, bucket: &str) -> Result<Box<dyn BucketFeeder>> {
        self.sim.lock().unwrap().feeds_opened.push(name.to_string());
        let (events_tx, events_rx) = mpsc::channel(1024);
        Ok(Box::new(MockFeeder {
            bucket: bucket.to_string(),
            sim: self.sim.clone(),
            events_tx,
            events_rx: Some(events_rx),
        }))
    }
}

struct MockKvData {
    bucket: String,
    sim: SharedSim,
}

#[async_trait]
impl KvData for MockKvData {
    async fn update_ts(&self, ts: &Timestamp) -> Result<()> {
        self.sim
            .lock()
            .unwrap()
            .update_ts_calls
            .push((self.bucket.clone(), ts.vbuckets()));
        Ok(())
    }

    async fn add_engines(
        &self,
        _engines: &HashMap<InstanceId, Engine>,
        _endpoints: &EndpointTable,
    ) -> Result<()> {
        self.sim.lock().unwrap().add_engines_calls += 1;
        Ok(())
    }

    async fn delete_engines(&self, ids: &[InstanceId]) -> Result<()> {
        self.sim.lock().unwrap().deleted_engine_ids.extend_from_slice(ids);
        Ok(())
    }

    async fn statistics(&self) -> Value {
        serde_json::json!({ "bucket": self.bucket })
    }

    async fn close(&self) -> Result<()> {
        self.sim.lock().unwrap().kvdata_closed.push(self.bucket.clone());
        Ok(())
    }
}

struct MockKvDataFactory {
    sim: SharedSim,
}

#[async_trait]
impl KvDataFactory for MockKvDataFactory {
    async fn spawn(&self, ctx: KvDataContext) -> Result<Box<dyn KvData>> {
        let bucket = ctx.bucket.clone();
        let feedback = ctx.feedback.clone();
        let mut events = ctx.events;
        let task_bucket = bucket.clone();
        // a stand-in for the real data path: translate stream control
        // frames into back-channel feedback.
        tokio::spawn(async move {
            let mut active: HashSet<Vbucket> = HashSet::new();
            let mut begun = false;
            while let Some(event) = events.recv().await {
                match event {
                    StreamEvent::StreamBegin {
                        opaque,
                        vbucket,
                        status,
                        seqno,
                        vbuuid,
                    } => {
                        if status == StreamStatus::Success {
                            active.insert(vbucket);
                            begun = true;
                        }
                        feedback.post(Feedback::StreamRequest {
                            bucket: task_bucket.clone(),
                            opaque,
                            status,
                            vbucket,
                            vbuuid,
                            seqno,
                        });
                    }
                    StreamEvent::StreamEnd {
                        opaque,
                        vbucket,
                        status,
                    } => {
                        if status == StreamStatus::Success {
                            active.remove(&vbucket);
                        }
                        feedback.post(Feedback::StreamEnd {
                            bucket: task_bucket.clone(),
                            opaque,
                            status,
                            vbucket,
                        });
                        if begun && active.is_empty() {
                            feedback.post(Feedback::KvdataFinished {
                                bucket: task_bucket.clone(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        });
        Ok(Box::new(MockKvData {
            bucket,
            sim: self.sim.clone(),
        }))
    }
}

struct MockEndpoint {
    addr: String,
    sim: SharedSim,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl RouterEndpoint for MockEndpoint {
    fn ping(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.sim.lock().unwrap().endpoints_closed.push(self.addr.clone());
        Ok(())
    }

    fn statistics(&self) -> Value {
        serde_json::json!({ "addr": self.addr })
    }
}

struct MockEndpointFactory {
    sim: SharedSim,
}

#[async_trait]
impl RouterEndpointFactory for MockEndpointFactory {
    async fn create(
        &self,
        _topic: &str,
        _endpoint_type: &str,
        raddr: &str,
    ) -> Result<Arc<dyn RouterEndpoint>> {
        let mut sim = self.sim.lock().unwrap();
        sim.endpoints_created.push(raddr.to_string());
        let alive = Arc::new(AtomicBool::new(true));
        sim.endpoint_alive.insert(raddr.to_string(), alive.clone());
        Ok(Arc::new(MockEndpoint {
            addr: raddr.to_string(),
            sim: self.sim.clone(),
            alive,
        }))
    }
}

#[derive(Debug)]
struct TestEvaluator {
    bucket: String,
}

impl Evaluator for TestEvaluator {
    fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[derive(Debug)]
struct TestRouter {
    endpoints: Vec<String>,
}

impl Router for TestRouter {
    fn endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }
}

fn subscribers(instances: &[(InstanceId, &str)], raddrs: &[&str]) -> SubscriberSet {
    let mut set = SubscriberSet::default();
    for &(id, bucket) in instances {
        set.evaluators.insert(
            id,
            Arc::new(TestEvaluator {
                bucket: bucket.to_string(),
            }),
        );
        set.routers.insert(
            id,
            Arc::new(TestRouter {
                endpoints: raddrs.iter().map(|r| r.to_string()).collect(),
            }),
        );
    }
    set
}

fn req_ts(bucket: &str, entries: &[(Vbucket, Seqno, Vbuuid)]) -> Timestamp {
    let mut ts = Timestamp::new("default", bucket);
    for &(vb, seqno, vbuuid) in entries {
        ts.append(vb, seqno, vbuuid, 0, 0);
    }
    ts
}

fn start_request() -> MutationTopicRequest {
    MutationTopicRequest {
        endpoint_type: "dataport".to_string(),
        req_timestamps: vec![req_ts(BUCKET, &[(0, 100, 0xB0), (1, 200, 0xB1), (2, 300, 0xB2)])],
        subscribers: subscribers(&[(0x10, BUCKET)], &[EP_ADDR]),
    }
}

struct Harness {
    sim: SharedSim,
    feed: Feed,
}

fn harness_with(setup: impl FnOnce(&mut ClusterSim)) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let mut sim = ClusterSim::default();
    sim.local.insert(BUCKET.to_string(), (0..8).collect());
    setup(&mut sim);
    let sim = Arc::new(Mutex::new(sim));

    let config = FeedConfig {
        feed_wait_stream_req_timeout: 300,
        feed_wait_stream_end_timeout: 300,
        feed_chan_size: 32,
        ..Default::default()
    };
    let ctx = FeedContext {
        config,
        endpoint_factory: Arc::new(MockEndpointFactory { sim: sim.clone() }),
        feeder_factory: Arc::new(MockFeederFactory { sim: sim.clone() }),
        kvdata_factory: Arc::new(MockKvDataFactory { sim: sim.clone() }),
        topology: Arc::new(MockTopology { sim: sim.clone() }),
    };
    Harness {
        sim,
        feed: Feed::new("maint", ctx),
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

async fn bucket_vbnos(feed: &Feed, bucket: &str) -> (Vec<u64>, Vec<u64>, Vec<u64>) {
    let stats = feed.statistics().await.unwrap();
    let get = |key: &str| -> Vec<u64> {
        stats["buckets"][bucket][key]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default()
    };
    let sets = (get("reqts"), get("actts"), get("rollts"));
    assert_disjoint(&sets);
    sets
}

fn assert_disjoint(sets: &(Vec<u64>, Vec<u64>, Vec<u64>)) {
    let (req, act, roll) = sets;
    for vb in req {
        assert!(!act.contains(vb) && !roll.contains(vb), "vb {vb} in two sets");
    }
    for vb in act {
        assert!(!roll.contains(vb), "vb {vb} in two sets");
    }
}

fn active_for<'a>(resp: &'a TopicResponse, bucket: &str) -> &'a Timestamp {
    resp.active_timestamps
        .iter()
        .find(|ts| ts.bucket() == bucket)
        .expect("bucket missing from active timestamps")
}

#[tokio::test]
async fn happy_start() {
    let h = harness();
    let resp = h.feed.mutation_topic(start_request()).await.unwrap();

    let act = active_for(&resp, BUCKET);
    assert_eq!(act.vbuckets(), vec![0, 1, 2]);
    assert_eq!(act.get(0).unwrap().seqno, 100);
    assert_eq!(act.get(0).unwrap().vbuuid, 0xB0);
    assert_eq!(act.get(1).unwrap().seqno, 200);
    assert_eq!(act.get(2).unwrap().vbuuid, 0xB2);
    assert!(resp.rollback_timestamps.is_empty());
    assert_eq!(resp.instance_ids, vec![0x10]);

    let (req, act, roll) = bucket_vbnos(&h.feed, BUCKET).await;
    assert!(req.is_empty());
    assert_eq!(act, vec![0, 1, 2]);
    assert!(roll.is_empty());

    let sim = h.sim.lock().unwrap();
    assert_eq!(sim.stream_starts.len(), 3);
    assert_eq!(sim.feeds_opened.len(), 1);
    assert!(sim.feeds_opened[0].starts_with("proj-beer-maint-"));
}

#[tokio::test]
async fn rollback_is_not_a_call_error() {
    let h = harness_with(|sim| {
        sim.start_replies
            .insert((BUCKET.to_string(), 1), StartReply::Rollback(150));
    });
    let resp = h.feed.mutation_topic(start_request()).await.unwrap();

    let act = active_for(&resp, BUCKET);
    assert_eq!(act.vbuckets(), vec![0, 2]);
    let roll = resp
        .rollback_timestamps
        .iter()
        .find(|ts| ts.bucket() == BUCKET)
        .unwrap();
    assert_eq!(roll.vbuckets(), vec![1]);
    assert_eq!(roll.get(1).unwrap().seqno, 150);
    assert_eq!(roll.get(1).unwrap().vbuuid, 0xB1);

    let (req, _, _) = bucket_vbnos(&h.feed, BUCKET).await;
    assert!(req.is_empty());
}

#[tokio::test]
async fn timeout_leaves_request_outstanding() {
    let h = harness_with(|sim| {
        sim.start_replies
            .insert((BUCKET.to_string(), 2), StartReply::Delayed(600));
    });
    let err = h.feed.mutation_topic(start_request()).await.unwrap_err();
    assert!(matches!(err, Error::ResponseTimeout(_)), "got {err:?}");

    let (req, act, _) = bucket_vbnos(&h.feed, BUCKET).await;
    assert_eq!(act, vec![0, 1]);
    assert_eq!(req, vec![2]);

    // the late SUCCESS moves the vbucket to active with no client action
    tokio::time::sleep(Duration::from_millis(500)).await;
    let (req, act, _) = bucket_vbnos(&h.feed, BUCKET).await;
    assert_eq!(act, vec![0, 1, 2]);
    assert!(req.is_empty());

    let resp = h.feed.topic_response().await.unwrap();
    assert_eq!(active_for(&resp, BUCKET).get(2).unwrap().seqno, 300);
}

#[tokio::test]
async fn duplicate_start_is_idempotent() {
    let h = harness();
    h.feed.mutation_topic(start_request()).await.unwrap();
    assert_eq!(h.sim.lock().unwrap().stream_starts.len(), 3);

    let resp = h.feed.mutation_topic(start_request()).await.unwrap();
    assert_eq!(active_for(&resp, BUCKET).vbuckets(), vec![0, 1, 2]);
    // every vbucket was already active: nothing went upstream
    assert_eq!(h.sim.lock().unwrap().stream_starts.len(), 3);
    assert_eq!(h.sim.lock().unwrap().feeds_opened.len(), 1);
}

#[tokio::test]
async fn shutdown_vbuckets_subset() {
    let h = harness();
    h.feed.mutation_topic(start_request()).await.unwrap();

    h.feed
        .shutdown_vbuckets(ShutdownVbucketsRequest {
            shutdown_timestamps: vec![req_ts(BUCKET, &[(1, 0, 0), (2, 0, 0)])],
        })
        .await
        .unwrap();

    let (req, act, roll) = bucket_vbnos(&h.feed, BUCKET).await;
    assert_eq!(act, vec![0]);
    assert!(req.is_empty());
    assert!(roll.is_empty());

    let resp = h.feed.topic_response().await.unwrap();
    assert_eq!(active_for(&resp, BUCKET).get(0).unwrap().seqno, 100);
    assert_eq!(h.sim.lock().unwrap().stream_ends.len(), 2);
}

#[tokio::test]
async fn kvdata_fin_cleans_drained_bucket() {
    let h = harness();
    h.feed.mutation_topic(start_request()).await.unwrap();
    h.feed
        .shutdown_vbuckets(ShutdownVbucketsRequest {
            shutdown_timestamps: vec![req_ts(BUCKET, &[(1, 0, 0), (2, 0, 0)])],
        })
        .await
        .unwrap();

    h.feed
        .shutdown_vbuckets(ShutdownVbucketsRequest {
            shutdown_timestamps: vec![req_ts(BUCKET, &[(0, 0, 0)])],
        })
        .await
        .unwrap();

    // the data path drains and posts its finish; the actor self-deletes
    // the bucket on the next turn
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let sim = h.sim.lock().unwrap();
        assert_eq!(sim.feeders_closed, vec![BUCKET.to_string()]);
        assert_eq!(sim.kvdata_closed, vec![BUCKET.to_string()]);
    }
    let stats = h.feed.statistics().await.unwrap();
    assert!(stats["buckets"]
        .as_object()
        .unwrap()
        .get(BUCKET)
        .is_none());
}

#[tokio::test]
async fn not_my_vbucket_fails_partition() {
    let h = harness_with(|sim| {
        sim.start_replies
            .insert((BUCKET.to_string(), 1), StartReply::NotMyVbucket);
    });
    let err = h.feed.mutation_topic(start_request()).await.unwrap_err();
    assert!(matches!(err, Error::NotMyVbucket(_)), "got {err:?}");

    // the failed vbucket lands in no set; the rest carried on
    let (req, act, roll) = bucket_vbnos(&h.feed, BUCKET).await;
    assert_eq!(act, vec![0, 2]);
    assert!(req.is_empty());
    assert!(roll.is_empty());
}

#[tokio::test]
async fn inconsistent_subscribers_fail_before_side_effects() {
    let h = harness();
    let mut subs = subscribers(&[(0x10, BUCKET), (0x11, BUCKET)], &[EP_ADDR]);
    subs.routers.remove(&0x11);

    let err = h
        .feed
        .mutation_topic(MutationTopicRequest {
            endpoint_type: "dataport".to_string(),
            req_timestamps: vec![req_ts(BUCKET, &[(0, 100, 0xB0)])],
            subscribers: subs,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InconsistentFeed(_)), "got {err:?}");

    let sim = h.sim.lock().unwrap();
    assert!(sim.stream_starts.is_empty());
    assert!(sim.endpoints_created.is_empty());
    assert!(sim.feeds_opened.is_empty());
}

#[tokio::test]
async fn shutdown_unknown_bucket_reports_invalid_bucket() {
    let h = harness_with(|sim| {
        sim.local.insert("unknown".to_string(), vec![0]);
    });
    h.feed.mutation_topic(start_request()).await.unwrap();

    let err = h
        .feed
        .shutdown_vbuckets(ShutdownVbucketsRequest {
            shutdown_timestamps: vec![req_ts("unknown", &[(0, 0, 0)])],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBucket(_)), "got {err:?}");

    // cleanup is deliberately skipped; the started bucket is untouched
    let (_, act, _) = bucket_vbnos(&h.feed, BUCKET).await;
    assert_eq!(act, vec![0, 1, 2]);
    assert!(h.sim.lock().unwrap().stream_ends.is_empty());
}

#[tokio::test]
async fn del_then_add_buckets_matches_fresh_start() {
    let h = harness();
    h.feed.mutation_topic(start_request()).await.unwrap();

    h.feed
        .del_buckets(DelBucketsRequest {
            buckets: vec![BUCKET.to_string()],
        })
        .await
        .unwrap();
    {
        let sim = h.sim.lock().unwrap();
        assert_eq!(sim.feeders_closed, vec![BUCKET.to_string()]);
        assert_eq!(sim.kvdata_closed, vec![BUCKET.to_string()]);
    }
    let stats = h.feed.statistics().await.unwrap();
    assert!(stats["buckets"].as_object().unwrap().is_empty());

    let resp = h
        .feed
        .add_buckets(AddBucketsRequest {
            req_timestamps: vec![req_ts(
                BUCKET,
                &[(0, 100, 0xB0), (1, 200, 0xB1), (2, 300, 0xB2)],
            )],
            subscribers: subscribers(&[(0x10, BUCKET)], &[EP_ADDR]),
        })
        .await
        .unwrap();

    let act = active_for(&resp, BUCKET);
    assert_eq!(act.vbuckets(), vec![0, 1, 2]);
    assert_eq!(act.get(1).unwrap().seqno, 200);
    assert_eq!(resp.instance_ids, vec![0x10]);
    // a fresh feeder was opened for the re-added bucket
    assert_eq!(h.sim.lock().unwrap().feeds_opened.len(), 2);
}

#[tokio::test]
async fn held_feedback_is_replayed_in_order() {
    let h = harness_with(|sim| {
        sim.start_replies
            .insert((BUCKET.to_string(), 5), StartReply::Silent);
        sim.end_replies
            .insert((BUCKET.to_string(), 0), EndReply::Silent);
    });
    let err = h
        .feed
        .mutation_topic(MutationTopicRequest {
            endpoint_type: "dataport".to_string(),
            req_timestamps: vec![req_ts(BUCKET, &[(0, 100, 0xB0), (5, 500, 0xB5)])],
            subscribers: subscribers(&[(0x10, BUCKET)], &[EP_ADDR]),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResponseTimeout(_)));
    let (req, act, _) = bucket_vbnos(&h.feed, BUCKET).await;
    assert_eq!(act, vec![0]);
    assert_eq!(req, vec![5]);

    // while the stream-end reconciler waits on vb 0, post two conflicting
    // answers for vb 5; only the first may win
    let feed = h.feed.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        feed.post_stream_request(
            BUCKET,
            &StreamEvent::StreamBegin {
                opaque: 0,
                vbucket: 5,
                status: StreamStatus::Rollback,
                seqno: 42,
                vbuuid: 0xB5,
            },
        );
        feed.post_stream_request(
            BUCKET,
            &StreamEvent::StreamBegin {
                opaque: 0,
                vbucket: 5,
                status: StreamStatus::Success,
                seqno: 500,
                vbuuid: 0xB5,
            },
        );
    });

    let err = h
        .feed
        .shutdown_vbuckets(ShutdownVbucketsRequest {
            shutdown_timestamps: vec![req_ts(BUCKET, &[(0, 0, 0)])],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResponseTimeout(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (req, act, roll) = bucket_vbnos(&h.feed, BUCKET).await;
    assert_eq!(act, vec![0]);
    assert!(req.is_empty());
    assert_eq!(roll, vec![5], "first-posted rollback must win");

    let resp = h.feed.topic_response().await.unwrap();
    let roll_ts = resp
        .rollback_timestamps
        .iter()
        .find(|ts| ts.bucket() == BUCKET)
        .unwrap();
    assert_eq!(roll_ts.get(5).unwrap().seqno, 42);
    assert_eq!(roll_ts.get(5).unwrap().vbuuid, 0xB5);
}

#[tokio::test]
async fn add_instances_without_data_path_is_invalid_bucket() {
    let h = harness();
    let err = h
        .feed
        .add_instances(AddInstancesRequest {
            subscribers: subscribers(&[(0x20, BUCKET)], &[EP_ADDR]),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBucket(_)), "got {err:?}");
}

#[tokio::test]
async fn del_instances_updates_engines_and_data_path() {
    let h = harness();
    h.feed
        .mutation_topic(MutationTopicRequest {
            endpoint_type: "dataport".to_string(),
            req_timestamps: vec![req_ts(BUCKET, &[(0, 100, 0xB0)])],
            subscribers: subscribers(&[(0x10, BUCKET), (0x11, BUCKET)], &[EP_ADDR]),
        })
        .await
        .unwrap();

    h.feed
        .del_instances(DelInstancesRequest {
            instance_ids: vec![0x11],
        })
        .await
        .unwrap();

    let resp = h.feed.topic_response().await.unwrap();
    assert_eq!(resp.instance_ids, vec![0x10]);
    assert_eq!(h.sim.lock().unwrap().deleted_engine_ids, vec![0x11]);
}

#[tokio::test]
async fn repair_endpoints_restarts_dead_endpoint() {
    let h = harness();
    h.feed.mutation_topic(start_request()).await.unwrap();
    assert_eq!(h.sim.lock().unwrap().endpoints_created, vec![EP_ADDR.to_string()]);

    // kill the transport, then ask for a repair
    h.sim.lock().unwrap().endpoint_alive[EP_ADDR].store(false, Ordering::SeqCst);
    let before = h.sim.lock().unwrap().add_engines_calls;
    h.feed
        .repair_endpoints(RepairEndpointsRequest {
            endpoints: vec![EP_ADDR.to_string()],
        })
        .await
        .unwrap();

    let sim = h.sim.lock().unwrap();
    assert_eq!(sim.endpoints_created.len(), 2);
    // the refreshed endpoint table was pushed to the data path
    assert!(sim.add_engines_calls > before);
}

#[tokio::test]
async fn restart_vbuckets_refreshes_data_path() {
    let h = harness_with(|sim| {
        sim.start_replies
            .insert((BUCKET.to_string(), 2), StartReply::Silent);
    });
    // vb 2 times out and stays outstanding
    let err = h.feed.mutation_topic(start_request()).await.unwrap_err();
    assert!(matches!(err, Error::ResponseTimeout(_)));

    // let the upstream answer this time
    h.sim
        .lock()
        .unwrap()
        .start_replies
        .remove(&(BUCKET.to_string(), 2));
    // drop the outstanding entry by ending it out-of-band, then restart
    h.feed.post_stream_end(
        BUCKET,
        &StreamEvent::StreamEnd {
            opaque: 0,
            vbucket: 2,
            status: StreamStatus::Success,
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let resp = h
        .feed
        .restart_vbuckets(RestartVbucketsRequest {
            restart_timestamps: vec![req_ts(BUCKET, &[(2, 300, 0xB2)])],
        })
        .await
        .unwrap();

    assert_eq!(active_for(&resp, BUCKET).vbuckets(), vec![0, 1, 2]);
    let sim = h.sim.lock().unwrap();
    // the existing data path was refreshed rather than replaced
    assert!(sim
        .update_ts_calls
        .iter()
        .any(|(bucket, vbs)| bucket == BUCKET && vbs == &vec![2]));
    assert_eq!(sim.kvdata_closed.len(), 0);
}

#[tokio::test]
async fn restart_unknown_bucket_is_invalid() {
    let h = harness_with(|sim| {
        sim.local.insert("unknown".to_string(), vec![0]);
    });
    let err = h
        .feed
        .restart_vbuckets(RestartVbucketsRequest {
            restart_timestamps: vec![req_ts("unknown", &[(0, 10, 0xC0)])],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBucket(_)), "got {err:?}");
}

#[tokio::test]
async fn cluster_info_failure_cleans_bucket_and_continues() {
    let h = harness();
    let mut subs = subscribers(&[(0x10, BUCKET)], &[EP_ADDR]);
    let other = subscribers(&[(0x11, "missing")], &[EP_ADDR]);
    subs.evaluators.extend(other.evaluators);
    subs.routers.extend(other.routers);

    // "missing" has no vbmap; "beer" must still start
    let err = h
        .feed
        .mutation_topic(MutationTopicRequest {
            endpoint_type: "dataport".to_string(),
            req_timestamps: vec![
                req_ts("missing", &[(0, 10, 0xC0)]),
                req_ts(BUCKET, &[(0, 100, 0xB0)]),
            ],
            subscribers: subs,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClusterInfo(_)), "got {err:?}");

    let (_, act, _) = bucket_vbnos(&h.feed, BUCKET).await;
    assert_eq!(act, vec![0]);
}

#[tokio::test]
async fn shutdown_closes_everything_exactly_once() {
    let h = harness();
    let mut req = start_request();
    // advertise the same endpoint under two spellings; the table is
    // double-keyed but backed by one transport
    req.subscribers = subscribers(&[(0x10, BUCKET)], &[EP_ADDR, "127.0.0.1:9104"]);
    h.feed.mutation_topic(req).await.unwrap();

    h.feed.shutdown().await.unwrap();

    {
        let sim = h.sim.lock().unwrap();
        assert_eq!(sim.feeders_closed, vec![BUCKET.to_string()]);
        assert_eq!(sim.kvdata_closed, vec![BUCKET.to_string()]);
        assert_eq!(sim.endpoints_closed.len(), 1, "transport closed once");
    }

    // the feed is gone; synchronous calls observe the closed channel
    let err = h.feed.topic_response().await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)), "got {err:?}");
    let err = h.feed.mutation_topic(start_request()).await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)), "got {err:?}");
}

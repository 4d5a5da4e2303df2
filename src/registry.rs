//! Processing Registry: process-wide state tracking every active council
//! job — accumulated results, subscriber set, grace-period lifecycle, a
//! stale sweeper, and capacity control.
//!
//! Grounded on squall's `Registry` (`dispatch/registry.rs`) for the
//! "process-wide map behind a lock, looked up by key" shape, generalized
//! from a static model-config lookup into a live-job registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::model::{AggregateRankingEntry, Event, Stage, Stage1Answer, Stage2Review};

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

type Key = (String, String);

/// A subscriber is anything that can accept broadcast events and report
/// whether it's still open. The real implementation lives in
/// [`crate::transport`]; tests use a channel-backed stand-in.
pub trait Subscriber: Send + Sync {
    fn send(&self, event: Event) -> bool;
}

/// Wraps a bounded mpsc sender as a [`Subscriber`]: closes (returns false)
/// once the receiver is dropped or the buffer is full, so one slow
/// subscriber can never stall the broadcast loop for others.
pub struct ChannelSubscriber(pub mpsc::Sender<Event>);

impl Subscriber for ChannelSubscriber {
    fn send(&self, event: Event) -> bool {
        self.0.try_send(event).is_ok()
    }
}

struct SubscriberEntry {
    id: u64,
    subscriber: Arc<dyn Subscriber>,
}

/// Live state for one `(user_id, session_id)` job.
pub struct ActiveProcessing {
    pub user_id: String,
    pub session_id: String,
    pub user_message: String,
    pub mode: crate::model::Mode,
    pub started_at: u64,
    pub last_event_at: u64,
    pub current_stage: Option<Stage>,
    pub cancel: CancellationToken,
    /// Fence value distinguishing this record's lifetime from any record
    /// that previously or subsequently occupies the same key.
    pub generation: u64,

    pub stage1_results: Vec<Stage1Answer>,
    pub stage2_results: Vec<Stage2Review>,
    pub stage3_content: String,
    pub stage3_reasoning: String,
    pub stage3_done: bool,
    pub label_to_model: BTreeMap<String, String>,
    pub aggregate: Vec<AggregateRankingEntry>,
    pub stage1_streaming: HashMap<String, String>,
    pub stage2_streaming: HashMap<String, String>,

    subscribers: Vec<SubscriberEntry>,
    next_subscriber_id: u64,
    grace_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ActiveProcessing {
    fn new(user_id: String, session_id: String, user_message: String, mode: crate::model::Mode, cancel: CancellationToken, generation: u64) -> Self {
        let now = now_millis();
        Self {
            user_id,
            session_id,
            user_message,
            mode,
            started_at: now,
            last_event_at: now,
            current_stage: None,
            cancel,
            generation,
            stage1_results: Vec::new(),
            stage2_results: Vec::new(),
            stage3_content: String::new(),
            stage3_reasoning: String::new(),
            stage3_done: false,
            label_to_model: BTreeMap::new(),
            aggregate: Vec::new(),
            stage1_streaming: HashMap::new(),
            stage2_streaming: HashMap::new(),
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            grace_handle: None,
        }
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }
}

struct Inner {
    records: HashMap<Key, ActiveProcessing>,
    next_generation: u64,
}

pub struct ProcessingRegistry {
    inner: Mutex<Inner>,
    max_concurrent: usize,
    grace_period: Duration,
    stale_threshold: Duration,
    connections_gauge: AtomicU64,
}

/// Handle returned to a subscriber so it can later call `remove_client`
/// without re-deriving its id.
pub struct SubscriptionHandle {
    pub key: Key,
    pub subscriber_id: u64,
}

impl ProcessingRegistry {
    pub fn new(max_concurrent: usize, grace_period: Duration, stale_threshold: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { records: HashMap::new(), next_generation: 0 }),
            max_concurrent,
            grace_period,
            stale_threshold,
            connections_gauge: AtomicU64::new(0),
        })
    }

    pub async fn is_processing(&self, user_id: &str, session_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.records.contains_key(&(user_id.to_string(), session_id.to_string()))
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_at_capacity(&self) -> bool {
        self.active_count().await >= self.max_concurrent
    }

    /// Registers a new job for `(user_id, session_id)`. If one already
    /// exists it is aborted and removed first so a stale completion of the
    /// old job cannot clobber the new one; the new record's `generation` is
    /// the fence used by [`Self::complete`].
    pub async fn register(
        &self,
        user_id: &str,
        session_id: &str,
        user_message: String,
        mode: crate::model::Mode,
        cancel: CancellationToken,
    ) -> u64 {
        let key = (user_id.to_string(), session_id.to_string());
        let mut inner = self.inner.lock().await;
        if let Some(mut old) = inner.records.remove(&key) {
            old.cancel.cancel();
            if let Some(handle) = old.grace_handle.take() {
                handle.abort();
            }
        }
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let record = ActiveProcessing::new(user_id.to_string(), session_id.to_string(), user_message, mode, cancel, generation);
        inner.records.insert(key, record);
        generation
    }

    /// Adds a subscriber to the record, cancelling any pending grace-period
    /// timer. Returns `None` if no record exists for this key.
    pub async fn add_client(
        self: Arc<Self>,
        user_id: &str,
        session_id: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> Option<SubscriptionHandle> {
        let key = (user_id.to_string(), session_id.to_string());
        let mut inner = self.inner.lock().await;
        let record = inner.records.get_mut(&key)?;
        if let Some(handle) = record.grace_handle.take() {
            handle.abort();
        }
        let id = record.next_subscriber_id;
        record.next_subscriber_id += 1;
        record.subscribers.push(SubscriberEntry { id, subscriber });
        self.connections_gauge.fetch_add(1, Ordering::Relaxed);
        Some(SubscriptionHandle { key, subscriber_id: id })
    }

    /// Removes a subscriber; if the record has no subscribers left, starts
    /// the grace-period timer that will abort the job if nobody reconnects.
    pub async fn remove_client(self: Arc<Self>, handle: &SubscriptionHandle) {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(&handle.key) else { return };
        record.subscribers.retain(|s| s.id != handle.subscriber_id);
        self.connections_gauge.fetch_sub(1, Ordering::Relaxed);

        if record.has_subscribers() {
            return;
        }

        let registry = Arc::clone(&self);
        let key = handle.key.clone();
        let generation = record.generation;
        let grace_period = self.grace_period;
        let join = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            registry.expire_if_empty(&key, generation).await;
        });
        record.grace_handle = Some(join);
    }

    async fn expire_if_empty(&self, key: &Key, generation: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.records.get(key)
            && record.generation == generation
            && !record.has_subscribers()
        {
            let mut record = inner.records.remove(key).unwrap();
            record.cancel.cancel();
            for entry in record.subscribers.drain(..) {
                entry.subscriber.send(Event::Error { message: "job expired".to_string() });
            }
        }
    }

    /// Updates accumulated state for one event. Does not broadcast — callers
    /// should `record_event` then `broadcast` so the lock is never held
    /// across subscriber writes.
    pub async fn record_event(&self, user_id: &str, session_id: &str, event: &Event) {
        let key = (user_id.to_string(), session_id.to_string());
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get_mut(&key) else { return };
        record.last_event_at = now_millis();

        match event {
            Event::Stage1Start => record.current_stage = Some(Stage::Stage1),
            Event::Stage1Chunk { model, delta } => {
                record.stage1_streaming.entry(model.clone()).or_default().push_str(delta);
            }
            Event::Stage1Response { answer } => {
                record.stage1_streaming.remove(&answer.model);
                record.stage1_results.push(answer.clone());
            }
            Event::Stage2Start => record.current_stage = Some(Stage::Stage2),
            Event::Stage2Chunk { model, delta } => {
                record.stage2_streaming.entry(model.clone()).or_default().push_str(delta);
            }
            Event::Stage2Response { review } => {
                record.stage2_streaming.remove(&review.model);
                record.stage2_results.push(review.clone());
            }
            Event::Stage2Complete { label_to_model, aggregate } => {
                record.label_to_model = label_to_model.clone();
                record.aggregate = aggregate.clone();
            }
            Event::Stage3Start => record.current_stage = Some(Stage::Stage3),
            Event::Stage3ReasoningChunk { delta } => record.stage3_reasoning.push_str(delta),
            Event::Stage3Chunk { delta } => record.stage3_content.push_str(delta),
            Event::Stage3Response { .. } => record.stage3_done = true,
            // title_complete intentionally does not transition current_stage
            // (spec open question c): it's a detached background job.
            Event::TitleComplete { .. } => {}
            Event::Heartbeat { .. } => {}
            Event::Stage1Complete
            | Event::Stage1ModelComplete { .. }
            | Event::Stage2ModelComplete { .. }
            | Event::Complete
            | Event::Error { .. }
            | Event::Reconnected { .. } => {}
        }
    }

    /// Snapshots the current subscriber set and writes to each outside any
    /// lock, so a slow or dead subscriber never blocks others or the
    /// producer.
    pub async fn broadcast(&self, user_id: &str, session_id: &str, event: Event) {
        let key = (user_id.to_string(), session_id.to_string());
        let subscribers: Vec<Arc<dyn Subscriber>> = {
            let inner = self.inner.lock().await;
            match inner.records.get(&key) {
                Some(record) => record.subscribers.iter().map(|s| Arc::clone(&s.subscriber)).collect(),
                None => return,
            }
        };
        for subscriber in subscribers {
            subscriber.send(event.clone());
        }
    }

    /// Completes and removes the record. If `fence` is provided and does
    /// not match the record's generation, this is a no-op — it means a
    /// newer job has since superseded this one.
    ///
    /// This only tears down bookkeeping: the real terminal event (`Complete`
    /// on success, or nothing at all on cancellation per §4.4) already
    /// reached subscribers through the normal `record_event`/`broadcast`
    /// path. Dropping the subscriber entries here closes each one's channel
    /// without synthesizing an event of our own, so an aborted job can never
    /// produce a fabricated success-looking `Complete`.
    pub async fn complete(&self, user_id: &str, session_id: &str, fence: Option<u64>) {
        let key = (user_id.to_string(), session_id.to_string());
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.records.get(&key) else { return };
        if let Some(fence) = fence
            && record.generation != fence
        {
            return;
        }
        let mut record = inner.records.remove(&key).unwrap();
        if let Some(handle) = record.grace_handle.take() {
            handle.abort();
        }
        record.subscribers.clear();
    }

    pub async fn abort(&self, user_id: &str, session_id: &str) {
        let fence = {
            let inner = self.inner.lock().await;
            inner.records.get(&(user_id.to_string(), session_id.to_string())).map(|r| {
                r.cancel.cancel();
                r.generation
            })
        };
        if fence.is_some() {
            self.complete(user_id, session_id, fence).await;
        }
    }

    /// Full accumulated state needed to replay a reconnecting subscriber
    /// per §4.6. Returns `None` if no record exists for this key.
    pub async fn get_replay_state(&self, user_id: &str, session_id: &str) -> Option<ReplayState> {
        let inner = self.inner.lock().await;
        let record = inner.records.get(&(user_id.to_string(), session_id.to_string()))?;
        Some(ReplayState {
            user_message: record.user_message.clone(),
            current_stage: record.current_stage,
            stage1_results: record.stage1_results.clone(),
            stage1_streaming: record.stage1_streaming.clone(),
            stage2_results: record.stage2_results.clone(),
            stage2_streaming: record.stage2_streaming.clone(),
            label_to_model: record.label_to_model.clone(),
            aggregate: record.aggregate.clone(),
            stage3_content: record.stage3_content.clone(),
            stage3_reasoning: record.stage3_reasoning.clone(),
        })
    }

    pub async fn get_snapshot(&self, user_id: &str, session_id: &str) -> Option<RegistrySnapshot> {
        let inner = self.inner.lock().await;
        let record = inner.records.get(&(user_id.to_string(), session_id.to_string()))?;
        Some(RegistrySnapshot {
            current_stage: record.current_stage,
            started_at: record.started_at,
            stage1_count: record.stage1_results.len(),
            stage2_count: record.stage2_results.len(),
            has_stage3: record.stage3_done,
        })
    }

    /// Periodically sweeps records whose `last_event_at` exceeds the stale
    /// threshold, aborting and removing them. Intended to be spawned once
    /// at process start and run for the registry's lifetime.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = now_millis();
            let stale_keys: Vec<Key> = {
                let inner = self.inner.lock().await;
                inner
                    .records
                    .iter()
                    .filter(|(_, r)| now.saturating_sub(r.last_event_at) > self.stale_threshold.as_millis() as u64)
                    .map(|(k, _)| k.clone())
                    .collect()
            };
            for key in stale_keys {
                tracing::warn!(user_id = %key.0, session_id = %key.1, "sweeping stale processing record");
                self.abort(&key.0, &key.1).await;
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (_, mut record) in inner.records.drain() {
            record.cancel.cancel();
            if let Some(handle) = record.grace_handle.take() {
                handle.abort();
            }
            for entry in record.subscribers.drain(..) {
                entry.subscriber.send(Event::Error { message: "server shutting down".to_string() });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub current_stage: Option<Stage>,
    pub started_at: u64,
    pub stage1_count: usize,
    pub stage2_count: usize,
    pub has_stage3: bool,
}

#[derive(Debug, Clone)]
pub struct ReplayState {
    pub user_message: String,
    pub current_stage: Option<Stage>,
    pub stage1_results: Vec<Stage1Answer>,
    pub stage1_streaming: HashMap<String, String>,
    pub stage2_results: Vec<Stage2Review>,
    pub stage2_streaming: HashMap<String, String>,
    pub label_to_model: BTreeMap<String, String>,
    pub aggregate: Vec<AggregateRankingEntry>,
    pub stage3_content: String,
    pub stage3_reasoning: String,
}

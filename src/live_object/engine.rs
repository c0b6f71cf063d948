//! Live object engine: ordered, partitioned dispatch of incoming events.
//!
//! Every resolved event becomes a job under an ordering key made of the
//! entity name and the handler's [`ordering_key`](super::traits::LiveObjectHandler::ordering_key).
//! Jobs of one key run one at a time in chain order; jobs of different keys
//! run in parallel, bounded by `handler_concurrency`. Events of one key that
//! arrive in separate batches may run out of chain order; the upsert then
//! skips a write older than the stored row and the job counts as stale.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{watch, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};

use crate::db::UpsertOutcome;

use super::event::{Event, EventOrder};
use super::lifecycle::{LifecycleManager, LifecycleOutcome};
use super::registry::Binding;

/// A batch of decoded events, possibly spanning several chains.
#[derive(Debug, Default)]
pub struct EventsMessage {
    pub events: Vec<Event>,
}

impl EventsMessage {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }
}

/// What to do with outstanding work when shutdown is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Finish in-flight jobs, drop queued ones.
    #[default]
    Drain,
    /// Abort in-flight jobs too.
    Abort,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub handler_concurrency: usize,
    pub shutdown_mode: ShutdownMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handler_concurrency: 16,
            shutdown_mode: ShutdownMode::Drain,
        }
    }
}

#[derive(Debug, Default)]
pub struct EngineStats {
    events_received: AtomicU64,
    dispatch_misses: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    stale: AtomicU64,
    discarded: AtomicU64,
    gated: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStatsSnapshot {
    pub events_received: u64,
    pub dispatch_misses: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Writes skipped because the stored row came from a later block.
    pub stale: u64,
    pub discarded: u64,
    pub gated: u64,
    pub failed: u64,
    /// Jobs abandoned at shutdown or cancelled; recoverable by redelivery.
    pub dropped: u64,
}

impl EngineStatsSnapshot {
    pub fn persisted(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            dispatch_misses: self.dispatch_misses.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            gated: self.gated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &LifecycleOutcome) {
        let counter = match outcome {
            LifecycleOutcome::Persisted(UpsertOutcome::Inserted) => &self.inserted,
            LifecycleOutcome::Persisted(UpsertOutcome::Updated) => &self.updated,
            LifecycleOutcome::Persisted(UpsertOutcome::Stale) => &self.stale,
            LifecycleOutcome::Discarded { .. } => &self.discarded,
            LifecycleOutcome::Gated => &self.gated,
            LifecycleOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Job {
    event: Arc<Event>,
    binding: Arc<Binding>,
}

pub struct LiveObjectEngine {
    lifecycle: Arc<LifecycleManager>,
    config: EngineConfig,
    stats: Arc<EngineStats>,
}

impl LiveObjectEngine {
    pub fn new(lifecycle: Arc<LifecycleManager>, config: EngineConfig) -> Self {
        Self {
            lifecycle,
            config,
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    /// Consume batches until the channel closes (everything queued is then
    /// handled) or `shutdown` flips to `true`.
    pub async fn run(
        &self,
        mut events_rx: Receiver<EventsMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> EngineStatsSnapshot {
        tracing::info!(
            "Live object engine started (concurrency {}, shutdown mode {:?})",
            self.config.handler_concurrency,
            self.config.shutdown_mode
        );

        let mut dispatcher = Dispatcher::new(
            self.lifecycle.clone(),
            self.stats.clone(),
            self.config.handler_concurrency.max(1),
        );
        let mut input_open = true;
        let mut shutdown_open = true;

        let stop = *shutdown.borrow_and_update();
        if stop {
            dispatcher.shutdown(self.config.shutdown_mode).await;
            return self.finish();
        }

        loop {
            if !input_open && dispatcher.is_idle() {
                tracing::info!("Event channel closed, live object engine drained");
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed(), if shutdown_open => {
                    if changed.is_err() {
                        shutdown_open = false;
                        continue;
                    }
                    let stop = *shutdown.borrow_and_update();
                    if stop {
                        tracing::info!("Shutdown requested, stopping live object engine");
                        dispatcher.shutdown(self.config.shutdown_mode).await;
                        break;
                    }
                }

                Some(joined) = dispatcher.tasks.join_next_with_id(), if !dispatcher.tasks.is_empty() => {
                    dispatcher.complete(joined);
                }

                msg = events_rx.recv(), if input_open => {
                    match msg {
                        Some(msg) => dispatcher.dispatch_batch(msg),
                        None => input_open = false,
                    }
                }

                else => break,
            }
        }

        self.finish()
    }

    fn finish(&self) -> EngineStatsSnapshot {
        let stats = self.stats.snapshot();
        tracing::info!(
            "Live object engine stopped: {} events, {} misses, {} inserted, {} updated, \
             {} stale, {} discarded, {} gated, {} failed, {} dropped",
            stats.events_received,
            stats.dispatch_misses,
            stats.inserted,
            stats.updated,
            stats.stale,
            stats.discarded,
            stats.gated,
            stats.failed,
            stats.dropped
        );
        stats
    }
}

/// Owns the per-key queues. Lives on the engine task only, so no locking.
struct Dispatcher {
    lifecycle: Arc<LifecycleManager>,
    stats: Arc<EngineStats>,
    semaphore: Arc<Semaphore>,
    /// Pending jobs per key with a job in flight. A key is present exactly
    /// while one of its jobs is running.
    queues: HashMap<String, BTreeMap<(EventOrder, u64), Job>>,
    /// Key of each running task, so a task lost to a `JoinError` still
    /// releases its key.
    running: HashMap<Id, String>,
    tasks: JoinSet<LifecycleOutcome>,
    seq: u64,
}

impl Dispatcher {
    fn new(lifecycle: Arc<LifecycleManager>, stats: Arc<EngineStats>, concurrency: usize) -> Self {
        Self {
            lifecycle,
            stats,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            queues: HashMap::new(),
            running: HashMap::new(),
            tasks: JoinSet::new(),
            seq: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    fn dispatch_batch(&mut self, msg: EventsMessage) {
        let mut events = msg.events;
        events.sort_by_key(Event::order);
        tracing::debug!("Dispatching batch of {} events", events.len());

        for event in events {
            self.stats.events_received.fetch_add(1, Ordering::Relaxed);
            let Some(binding) = self.lifecycle.registry().resolve(&event) else {
                self.stats.dispatch_misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("No handler for {} ({})", event.name, event.id);
                continue;
            };

            let key = match binding.handler().ordering_key(&event) {
                Some(key) => format!("{}/{}", binding.entity().name(), key),
                None => binding.entity().name().to_string(),
            };
            self.enqueue(
                key,
                Job {
                    event: Arc::new(event),
                    binding,
                },
            );
        }
    }

    fn enqueue(&mut self, key: String, job: Job) {
        if let Some(queue) = self.queues.get_mut(&key) {
            self.seq += 1;
            queue.insert((job.event.order(), self.seq), job);
            return;
        }
        self.queues.insert(key.clone(), BTreeMap::new());
        self.spawn(key, job);
    }

    fn spawn(&mut self, key: String, job: Job) {
        let lifecycle = self.lifecycle.clone();
        let semaphore = self.semaphore.clone();
        let handle = self.tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let outcome = AssertUnwindSafe(lifecycle.run_binding(&job.event, &job.binding))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!(
                        "Handler {} panicked on event {}",
                        job.binding.identity(),
                        job.event.id
                    );
                    LifecycleOutcome::Failed
                });
            outcome
        });
        self.running.insert(handle.id(), key);
    }

    fn record_joined(&self, joined: Result<(Id, LifecycleOutcome), JoinError>) -> Id {
        match joined {
            Ok((id, outcome)) => {
                self.stats.record(&outcome);
                id
            }
            Err(e) if e.is_cancelled() => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                e.id()
            }
            Err(e) => {
                tracing::error!("Live object task failed: {}", e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                e.id()
            }
        }
    }

    /// A job finished: record it and start the next one for its key.
    fn complete(&mut self, joined: Result<(Id, LifecycleOutcome), JoinError>) {
        let id = self.record_joined(joined);
        let Some(key) = self.running.remove(&id) else {
            return;
        };

        let next = self.queues.get_mut(&key).and_then(|queue| queue.pop_first());
        match next {
            Some((_, job)) => self.spawn(key, job),
            None => {
                self.queues.remove(&key);
            }
        }
    }

    async fn shutdown(&mut self, mode: ShutdownMode) {
        let queued: usize = self.queues.values().map(BTreeMap::len).sum();
        self.queues.clear();
        self.stats.dropped.fetch_add(queued as u64, Ordering::Relaxed);

        if mode == ShutdownMode::Abort {
            self.tasks.abort_all();
        }
        tracing::info!(
            "Dropped {} queued jobs, waiting for {} in-flight",
            queued,
            self.tasks.len()
        );

        while let Some(joined) = self.tasks.join_next_with_id().await {
            let id = self.record_joined(joined);
            self.running.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::db::{DbValue, MemoryStore};
    use crate::live_object::context::Capabilities;
    use crate::live_object::contract_groups::ContractGroupRegistry;
    use crate::live_object::registry::{ChainRegistry, RegistryBuilder};
    use crate::live_object::report::TracingReporter;
    use crate::live_object::schema::{EntityDefinition, PropertyDef, PropertyType};
    use crate::live_object::testing::{sample_event, FnHandler};
    use crate::live_object::upsert::UpsertEngine;

    fn engine(handler: FnHandler, concurrency: usize, store: Arc<MemoryStore>) -> LiveObjectEngine {
        let mut builder = RegistryBuilder::new(ChainRegistry::new().with_chain("eth", "1"));
        builder
            .entity(
                EntityDefinition::builder("Project", "allo.projects")
                    .property(PropertyDef::new("projectId", PropertyType::Number))
                    .property(PropertyDef::new("name", PropertyType::String))
                    .unique_by(["projectId", "chainId"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        builder
            .on_event("Project", "allo.Registry.ProjectCreated", Arc::new(handler))
            .unwrap();

        let lifecycle = LifecycleManager::new(
            Arc::new(builder.build().unwrap()),
            UpsertEngine::new(store),
            Arc::new(ContractGroupRegistry::new()),
            Capabilities::default(),
            Arc::new(TracingReporter),
        );
        LiveObjectEngine::new(
            Arc::new(lifecycle),
            EngineConfig {
                handler_concurrency: concurrency,
                shutdown_mode: ShutdownMode::Drain,
            },
        )
    }

    fn event(project_id: u64, block: u64) -> Event {
        let mut event = sample_event("allo.Registry.ProjectCreated", "1", block);
        event.data.insert("projectID".into(), project_id.into());
        event.data.insert("name".into(), format!("v{}", block).into());
        event
    }

    fn by_project_id(event: &Event) -> Option<String> {
        event.get_string("projectID").ok()
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_events_apply_in_chain_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let handler = FnHandler::new("created", move |event, record, _ctx| {
            seen_in_handler.lock().unwrap().push(event.origin.block_number);
            record.set("projectId", event.get("projectID")?.clone())?;
            record.set("name", event.get("name")?.clone())?;
            Ok(())
        })
        .with_ordering_key(by_project_id)
        // Earlier blocks take longer, so unordered execution would finish last-first.
        .with_delay(|event| Duration::from_millis(100 - event.origin.block_number));

        let store = Arc::new(MemoryStore::new());
        let engine = engine(handler, 8, store.clone());
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(EventsMessage::new(vec![event(1007, 3), event(1007, 1), event(1007, 2)]))
            .await
            .unwrap();
        tx.send(EventsMessage::new(vec![event(1007, 4)])).await.unwrap();
        drop(tx);

        let stats = engine.run(rx, shutdown_rx).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        let row = store.get("allo.projects", &["1007", "1"]).unwrap();
        assert_eq!(row["name"], DbValue::Text("v4".into()));
        assert_eq!(row["block_number"], DbValue::Int64(4));
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.updated, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_keys_run_in_parallel() {
        let handler = FnHandler::new("created", |event, record, _ctx| {
            record.set("projectId", event.get("projectID")?.clone())?;
            Ok(())
        })
        .with_ordering_key(by_project_id)
        .with_delay(|_| Duration::from_millis(100));

        let store = Arc::new(MemoryStore::new());
        let engine = engine(handler, 4, store.clone());
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(EventsMessage::new((1..=4).map(|id| event(id, 10)).collect()))
            .await
            .unwrap();
        drop(tx);

        let started = tokio::time::Instant::now();
        let stats = engine.run(rx, shutdown_rx).await;

        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(stats.inserted, 4);
        assert_eq!(store.row_count("allo.projects"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ordering_key_serializes_entity() {
        let handler = FnHandler::new("created", |event, record, _ctx| {
            record.set("projectId", event.get("projectID")?.clone())?;
            Ok(())
        })
        .with_delay(|_| Duration::from_millis(100));

        let engine = engine(handler, 4, Arc::new(MemoryStore::new()));
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(EventsMessage::new(vec![event(1, 1), event(2, 2)]))
            .await
            .unwrap();
        drop(tx);

        let started = tokio::time::Instant::now();
        engine.run(rx, shutdown_rx).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_shutdown_finishes_in_flight_and_drops_queued() {
        let handler = FnHandler::new("created", |event, record, _ctx| {
            record.set("projectId", event.get("projectID")?.clone())?;
            Ok(())
        })
        .with_ordering_key(by_project_id)
        .with_delay(|_| Duration::from_millis(50));

        let store = Arc::new(MemoryStore::new());
        let engine = engine(handler, 4, store.clone());
        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(EventsMessage::new(vec![event(1007, 1), event(1007, 2), event(1007, 3)]))
            .await
            .unwrap();

        let run = tokio::spawn(async move { engine.run(rx, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();
        let stats = run.await.unwrap();

        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(store.row_count("allo.projects"), 1);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_event_in_later_batch_does_not_regress_row() {
        let handler = FnHandler::new("created", |event, record, _ctx| {
            record.set("projectId", event.get("projectID")?.clone())?;
            record.set("name", event.get("name")?.clone())?;
            Ok(())
        })
        .with_ordering_key(by_project_id);

        let store = Arc::new(MemoryStore::new());
        let engine = engine(handler, 4, store.clone());
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(EventsMessage::new(vec![event(1007, 11)])).await.unwrap();
        tx.send(EventsMessage::new(vec![event(1007, 10)])).await.unwrap();
        drop(tx);

        let stats = engine.run(rx, shutdown_rx).await;

        let row = store.get("allo.projects", &["1007", "1"]).unwrap();
        assert_eq!(row["block_number"], DbValue::Int64(11));
        assert_eq!(row["name"], DbValue::Text("v11".into()));
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.persisted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_task_releases_its_key() {
        let handler = FnHandler::new("created", |event, record, _ctx| {
            record.set("projectId", event.get("projectID")?.clone())?;
            Ok(())
        })
        .with_ordering_key(by_project_id)
        .with_delay(|_| Duration::from_millis(10));

        let store = Arc::new(MemoryStore::new());
        let engine = engine(handler, 4, store.clone());
        let mut dispatcher = Dispatcher::new(engine.lifecycle.clone(), engine.stats(), 4);

        dispatcher.dispatch_batch(EventsMessage::new(vec![
            event(1007, 1),
            event(1007, 2),
            event(1007, 3),
        ]));
        // Only the first job of the key is running; losing it must not strand the rest.
        dispatcher.tasks.abort_all();
        while let Some(joined) = dispatcher.tasks.join_next_with_id().await {
            dispatcher.complete(joined);
        }

        let stats = engine.stats().snapshot();
        assert!(dispatcher.is_idle());
        assert!(dispatcher.queues.is_empty());
        assert!(dispatcher.running.is_empty());
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(
            store.get("allo.projects", &["1007", "1"]).unwrap()["block_number"],
            DbValue::Int64(3)
        );
    }

    #[tokio::test]
    async fn test_dispatch_misses_are_counted() {
        let handler = FnHandler::new("created", |_event, _record, _ctx| Ok(()));
        let engine = engine(handler, 1, Arc::new(MemoryStore::new()));
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(EventsMessage::new(vec![
            sample_event("allo.Registry.RoleGranted", "1", 1),
            sample_event("allo.Registry.ProjectCreated", "1", 2),
        ]))
        .await
        .unwrap();
        drop(tx);

        let stats = engine.run(rx, shutdown_rx).await;
        assert_eq!(stats.events_received, 2);
        assert_eq!(stats.dispatch_misses, 1);
        assert_eq!(stats.discarded, 1);
    }
}

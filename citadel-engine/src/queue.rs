//! Prioritized event queue with a supervised elastic worker pool
//!
//! Producers append events; worker tasks dequeue in `(priority, seq)`
//! order and fan each event out to the handlers registered along its kind
//! path. Consequences returned by handlers are routed back through the
//! owning engine, never directly into the queue, so admission control
//! stays in one place.
//!
//! A supervisor task resizes the pool between `min_workers` and
//! `max_workers`: it wakes idle workers when events pend, spawns a worker
//! when none are idle, and retires surplus idle workers by injecting a
//! `worker-shutdown` signal ahead of all pending events.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::engine::EngineRef;
use crate::error::{EngineError, EngineResult};
use crate::events::{kinds, Event, Payload, PRI_URGENT};
use crate::registry::HandlerRegistry;

/// Sizing and pacing knobs for the queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Pool floor; the supervisor replenishes to this
    pub min_workers: usize,
    /// Pool ceiling; the supervisor never spawns beyond this
    pub max_workers: usize,
    /// Pause between supervisor passes
    pub supervisor_threshold: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            min_workers: 2,
            max_workers: num_cpus::get().max(2),
            supervisor_threshold: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Stopped,
    Running,
    ShuttingDown,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueueState::Stopped => "stopped",
            QueueState::Running => "running",
            QueueState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

type WorkerId = u64;

// Heap entry; the key is explicit so a priority enqueue can jump the band
// without touching the (immutable) event.
struct PendingEvent {
    key: (u8, u64),
    event: Arc<Event>,
}

impl PartialEq for PendingEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PendingEvent {}

impl PartialOrd for PendingEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Prioritized FIFO with elastic dispatch workers.
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    registry: Arc<HandlerRegistry>,
    state: Mutex<QueueState>,
    pending: Mutex<BinaryHeap<Reverse<PendingEvent>>>,
    /// Queue condition; workers park here while idle
    available: Notify,
    workers: Mutex<HashMap<WorkerId, JoinHandle<()>>>,
    /// Worker id → instant it went idle
    idle: Mutex<HashMap<WorkerId, Instant>>,
    engine: Mutex<EngineRef>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    next_worker_id: AtomicU64,
    clean_drain: AtomicBool,
}

impl EventQueue {
    /// Build a stopped queue over the given handler registry.
    pub fn new(config: QueueConfig, registry: Arc<HandlerRegistry>) -> Self {
        EventQueue {
            inner: Arc::new(QueueInner {
                config,
                registry,
                state: Mutex::new(QueueState::Stopped),
                pending: Mutex::new(BinaryHeap::new()),
                available: Notify::new(),
                workers: Mutex::new(HashMap::new()),
                idle: Mutex::new(HashMap::new()),
                engine: Mutex::new(EngineRef::detached()),
                supervisor: Mutex::new(None),
                next_worker_id: AtomicU64::new(1),
                clean_drain: AtomicBool::new(true),
            }),
        }
    }

    /// Spawn the supervisor and `min_workers` workers, then wait until the
    /// initial workers are parked and the queue accepts events.
    ///
    /// Fails with `AlreadyRunning` while running; a stopped queue can be
    /// started again.
    pub async fn start(&self, engine: EngineRef) -> EngineResult<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                QueueState::Running => return Err(EngineError::AlreadyRunning),
                QueueState::ShuttingDown => {
                    return Err(EngineError::refused(QueueState::ShuttingDown))
                }
                QueueState::Stopped => *state = QueueState::Running,
            }
        }
        *self.inner.engine.lock() = engine;
        self.inner.clean_drain.store(true, Ordering::Relaxed);

        let (ready_tx, mut ready_rx) = mpsc::channel(self.inner.config.min_workers.max(1));
        for _ in 0..self.inner.config.min_workers {
            spawn_worker(&self.inner, Some(ready_tx.clone()));
        }
        drop(ready_tx);
        for _ in 0..self.inner.config.min_workers {
            if ready_rx.recv().await.is_none() {
                return Err(EngineError::ChannelClosed);
            }
        }

        let supervisor = tokio::spawn(run_supervisor(Arc::clone(&self.inner)));
        *self.inner.supervisor.lock() = Some(supervisor);
        tracing::info!(
            min_workers = self.inner.config.min_workers,
            max_workers = self.inner.config.max_workers,
            "event queue started"
        );
        Ok(())
    }

    /// Append events in arrival order. `Refused` unless running. Never
    /// blocks beyond a brief mutex acquire.
    pub fn enqueue(&self, events: Vec<Arc<Event>>) -> EngineResult<()> {
        {
            let state = self.inner.state.lock();
            if *state != QueueState::Running {
                return Err(EngineError::refused(*state));
            }
        }
        let woken = events.len();
        {
            let mut pending = self.inner.pending.lock();
            for event in events {
                pending.push(Reverse(PendingEvent {
                    key: event.order_key(),
                    event,
                }));
            }
        }
        for _ in 0..woken {
            self.inner.available.notify_one();
        }
        Ok(())
    }

    /// Insert events ahead of the whole priority band. Supervisor use
    /// only: this is how worker retirement and drain signals jump the
    /// line. Accepted while running or draining.
    pub fn priority_enqueue(&self, events: Vec<Arc<Event>>) -> EngineResult<()> {
        {
            let state = self.inner.state.lock();
            if *state == QueueState::Stopped {
                return Err(EngineError::refused(*state));
            }
        }
        let woken = events.len();
        {
            let mut pending = self.inner.pending.lock();
            for event in events {
                pending.push(Reverse(PendingEvent {
                    key: (PRI_URGENT, event.seq()),
                    event,
                }));
            }
        }
        for _ in 0..woken {
            self.inner.available.notify_one();
        }
        Ok(())
    }

    /// Stop accepting events, give workers `timeout` to finish in-flight
    /// dispatch, then abort stragglers. Pending events are discarded.
    ///
    /// Returns whether the drain completed cleanly. Idempotent: calling
    /// again returns the recorded result.
    pub async fn shutdown(&self, timeout: Duration) -> EngineResult<bool> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                QueueState::Stopped => {
                    return Ok(self.inner.clean_drain.load(Ordering::Relaxed))
                }
                QueueState::ShuttingDown => {
                    return Ok(self.inner.clean_drain.load(Ordering::Relaxed))
                }
                QueueState::Running => *state = QueueState::ShuttingDown,
            }
        }

        // Stop the supervisor first so it cannot spawn a worker that
        // would miss its retirement signal.
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.abort();
        }

        let live = self.inner.workers.lock().len();
        let signals: Vec<_> = (0..live)
            .map(|_| Event::urgent(&kinds::WORKER_SHUTDOWN, Payload::None))
            .collect();
        self.priority_enqueue(signals)?;
        self.inner.available.notify_waiters();

        let deadline = Instant::now() + timeout;
        let clean = loop {
            if self.inner.workers.lock().is_empty() {
                break true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break false;
            }
            tokio::time::sleep(remaining.min(Duration::from_millis(10))).await;
        };

        if !clean {
            let mut workers = self.inner.workers.lock();
            tracing::warn!(stragglers = workers.len(), "queue drain timed out; terminating workers");
            for (_, handle) in workers.drain() {
                handle.abort();
            }
        }

        self.inner.pending.lock().clear();
        self.inner.idle.lock().clear();
        self.inner.clean_drain.store(clean, Ordering::Relaxed);
        *self.inner.state.lock() = QueueState::Stopped;
        tracing::info!(clean, "event queue stopped");
        Ok(clean)
    }

    /// Number of events waiting for dispatch
    pub fn depth(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of live workers
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Number of workers currently parked idle
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Whether the queue currently accepts `enqueue`
    pub fn is_running(&self) -> bool {
        *self.inner.state.lock() == QueueState::Running
    }
}

fn spawn_worker(inner: &Arc<QueueInner>, ready: Option<mpsc::Sender<()>>) {
    let id = inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        run_worker(task_inner, id, ready).await;
    });
    inner.workers.lock().insert(id, handle);
    tracing::debug!(worker = id, "worker spawned");
}

async fn run_worker(inner: Arc<QueueInner>, id: WorkerId, ready: Option<mpsc::Sender<()>>) {
    if let Some(tx) = ready {
        let _ = tx.send(()).await;
    }
    loop {
        let event = dequeue(&inner, id).await;
        if event.is_a(&kinds::WORKER_SHUTDOWN) {
            tracing::debug!(worker = id, "worker retiring");
            break;
        }
        dispatch_event(&inner, event).await;
    }
    inner.idle.lock().remove(&id);
    inner.workers.lock().remove(&id);
}

// Blocking dequeue. The worker is parked on the idle roster while it
// waits and moved back to busy on wake.
async fn dequeue(inner: &Arc<QueueInner>, id: WorkerId) -> Arc<Event> {
    loop {
        let notified = inner.available.notified();
        {
            let mut pending = inner.pending.lock();
            if let Some(Reverse(entry)) = pending.pop() {
                inner.idle.lock().remove(&id);
                return entry.event;
            }
        }
        inner.idle.lock().entry(id).or_insert_with(Instant::now);
        notified.await;
    }
}

async fn dispatch_event(inner: &Arc<QueueInner>, event: Arc<Event>) {
    let handlers = inner.registry.handlers_for(event.kind());
    if handlers.is_empty() {
        tracing::warn!(kind = event.kind().name(), "no handler along kind path");
        // Error-family events stay log-only here, otherwise an unhandled
        // error kind would echo forever.
        if !event.is_a(&kinds::ERROR) {
            route_consequences(
                inner,
                vec![Event::new(
                    &kinds::NO_HANDLER,
                    Payload::Failure(format!("no handler for kind {}", event.kind().name())),
                )],
            );
        }
        return;
    }

    for handler in handlers {
        let outcome = std::panic::AssertUnwindSafe(handler.handle(Arc::clone(&event)))
            .catch_unwind()
            .await;
        let consequences = match outcome {
            Ok(Ok(consequences)) => consequences,
            Ok(Err(err)) => {
                tracing::warn!(kind = event.kind().name(), %err, "handler failed");
                vec![Event::new(
                    &kinds::UNTRAPPED_EXCEPTION,
                    Payload::Failure(format!(
                        "handler for {} failed: {err}",
                        event.kind().name()
                    )),
                )]
            }
            Err(panic) => {
                let detail = panic_message(panic);
                tracing::error!(kind = event.kind().name(), %detail, "handler panicked");
                vec![Event::new(
                    &kinds::UNTRAPPED_EXCEPTION,
                    Payload::Failure(format!(
                        "handler for {} panicked: {detail}",
                        event.kind().name()
                    )),
                )]
            }
        };

        let mut routed = Vec::with_capacity(consequences.len());
        for consequence in consequences {
            if consequence.id() == event.id() {
                tracing::warn!(kind = event.kind().name(), "handler returned its own event");
                routed.push(Event::new(
                    &kinds::RECURSION_ERROR,
                    Payload::Failure(format!(
                        "handler returned its own {} event",
                        event.kind().name()
                    )),
                ));
            } else {
                routed.push(consequence);
            }
        }
        route_consequences(inner, routed);
    }
}

// All consequence routing passes through the engine so admission control
// stays with it; a detached or stopped engine drops the batch.
fn route_consequences(inner: &Arc<QueueInner>, consequences: Vec<Arc<Event>>) {
    if consequences.is_empty() {
        return;
    }
    let engine = inner.engine.lock().clone();
    if let Err(err) = engine.dispatch_events(consequences) {
        tracing::debug!(%err, "consequences dropped");
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_supervisor(inner: Arc<QueueInner>) {
    let mut pass = tokio::time::interval(inner.config.supervisor_threshold);
    pass.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        pass.tick().await;
        if *inner.state.lock() != QueueState::Running {
            break;
        }

        // Reap handles of workers that exited since the last pass.
        inner.workers.lock().retain(|_, handle| !handle.is_finished());

        let pending = inner.pending.lock().len();
        let idle = inner.idle.lock().len();
        let total = inner.workers.lock().len();

        if pending > 0 {
            if idle > 0 {
                inner.available.notify_waiters();
            } else if total < inner.config.max_workers {
                tracing::debug!(pending, total, "supervisor growing pool");
                spawn_worker(&inner, None);
            }
        } else if idle > 0 && total > inner.config.min_workers {
            tracing::debug!(idle, total, "supervisor retiring an idle worker");
            let signal = Event::urgent(&kinds::WORKER_SHUTDOWN, Payload::None);
            {
                let mut pending = inner.pending.lock();
                pending.push(Reverse(PendingEvent {
                    key: (PRI_URGENT, signal.seq()),
                    event: signal,
                }));
            }
            inner.available.notify_one();
        }

        let total = inner.workers.lock().len();
        for _ in total..inner.config.min_workers {
            spawn_worker(&inner, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Handler;
    use async_trait::async_trait;

    struct OrderRecorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for OrderRecorder {
        async fn handle(&self, event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>> {
            if let Some(text) = event.text() {
                self.seen.lock().push(text.to_string());
            }
            Ok(Vec::new())
        }
    }

    fn single_worker_config() -> QueueConfig {
        QueueConfig {
            min_workers: 1,
            max_workers: 1,
            supervisor_threshold: Duration::from_millis(50),
        }
    }

    async fn drain(queue: &EventQueue) {
        while queue.depth() > 0 || queue.idle_count() < queue.worker_count() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn events_dispatch_in_priority_then_fifo_order() {
        let registry = Arc::new(HandlerRegistry::new());
        let recorder = Arc::new(OrderRecorder {
            seen: Mutex::new(Vec::new()),
        });
        registry.register(&kinds::INPUT, recorder.clone() as Arc<dyn Handler>);

        let queue = EventQueue::new(single_worker_config(), registry);
        queue.start(EngineRef::detached()).await.unwrap();

        // One batch, one push under the lock: the heap decides the order.
        let e1 = Event::with_priority(&kinds::INPUT, 32, Payload::Text("E1".into()));
        let e2 = Event::with_priority(&kinds::INPUT, 16, Payload::Text("E2".into()));
        let e3 = Event::with_priority(&kinds::INPUT, 32, Payload::Text("E3".into()));
        queue.enqueue(vec![e1, e2, e3]).unwrap();

        drain(&queue).await;
        assert_eq!(recorder.seen.lock().as_slice(), &["E2", "E1", "E3"]);
        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_is_refused_after_shutdown() {
        let registry = Arc::new(HandlerRegistry::new());
        let queue = EventQueue::new(single_worker_config(), registry);
        queue.start(EngineRef::detached()).await.unwrap();
        assert!(queue.shutdown(Duration::from_secs(1)).await.unwrap());

        let event = Event::new(&kinds::INPUT, Payload::None);
        assert!(matches!(
            queue.enqueue(vec![event]),
            Err(EngineError::Refused { .. })
        ));
    }

    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let registry = Arc::new(HandlerRegistry::new());
        let queue = EventQueue::new(single_worker_config(), registry);
        queue.start(EngineRef::detached()).await.unwrap();
        assert!(matches!(
            queue.start(EngineRef::detached()).await,
            Err(EngineError::AlreadyRunning)
        ));
        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn start_stop_start_preserves_delivery() {
        let registry = Arc::new(HandlerRegistry::new());
        let recorder = Arc::new(OrderRecorder {
            seen: Mutex::new(Vec::new()),
        });
        registry.register(&kinds::INPUT, recorder.clone() as Arc<dyn Handler>);

        let queue = EventQueue::new(single_worker_config(), registry);
        queue.start(EngineRef::detached()).await.unwrap();
        queue.shutdown(Duration::from_secs(1)).await.unwrap();
        queue.start(EngineRef::detached()).await.unwrap();

        queue
            .enqueue(vec![Event::new(&kinds::INPUT, Payload::Text("again".into()))])
            .unwrap();
        drain(&queue).await;
        assert_eq!(recorder.seen.lock().as_slice(), &["again"]);
        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_with_zero_timeout_invokes_no_further_handlers() {
        let registry = Arc::new(HandlerRegistry::new());
        let recorder = Arc::new(OrderRecorder {
            seen: Mutex::new(Vec::new()),
        });
        registry.register(&kinds::INPUT, recorder.clone() as Arc<dyn Handler>);

        let queue = EventQueue::new(single_worker_config(), registry);
        queue.start(EngineRef::detached()).await.unwrap();
        queue.shutdown(Duration::ZERO).await.unwrap();

        let before = recorder.seen.lock().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.seen.lock().len(), before);
    }

    #[tokio::test]
    async fn worker_pool_stays_within_bounds() {
        let registry = Arc::new(HandlerRegistry::new());
        let config = QueueConfig {
            min_workers: 1,
            max_workers: 3,
            supervisor_threshold: Duration::from_millis(20),
        };
        let queue = EventQueue::new(config, registry);
        queue.start(EngineRef::detached()).await.unwrap();

        for _ in 0..20 {
            queue
                .enqueue(vec![Event::new(&kinds::INPUT, Payload::None)])
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let count = queue.worker_count();
            assert!((1..=3).contains(&count), "worker count {count} out of bounds");
        }
        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        struct Panicker;

        #[async_trait]
        impl Handler for Panicker {
            async fn handle(&self, _event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>> {
                panic!("boom");
            }
        }

        let registry = Arc::new(HandlerRegistry::new());
        registry.register(&kinds::INPUT, Arc::new(Panicker) as Arc<dyn Handler>);
        let recorder = Arc::new(OrderRecorder {
            seen: Mutex::new(Vec::new()),
        });
        registry.register(&kinds::TICK, recorder.clone() as Arc<dyn Handler>);

        let queue = EventQueue::new(single_worker_config(), registry);
        queue.start(EngineRef::detached()).await.unwrap();

        queue
            .enqueue(vec![Event::new(&kinds::INPUT, Payload::None)])
            .unwrap();
        // The worker survives the panic and keeps dispatching.
        queue
            .enqueue(vec![Event::new(&kinds::TICK, Payload::Text("alive".into()))])
            .unwrap();
        drain(&queue).await;
        assert_eq!(recorder.seen.lock().as_slice(), &["alive"]);
        queue.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}

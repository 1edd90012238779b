//! Per-session bidirectional filter pipelines
//!
//! An [`IoEventStream`] owns an ordered chain of filters and a single
//! cooperative worker task. Producers (connection drivers, the engine,
//! the filters themselves) buffer events and notify the stream; the
//! worker wakes, runs one input cycle and one output cycle, and parks
//! again. Filter-list mutations are serialized by a write lock; the
//! worker iterates over a snapshot so no lock is held across filter
//! invocations.

mod filter;
mod line;
mod login;

pub use filter::{
    DefaultInputFilter, DefaultOutputFilter, DeferredQueues, Direction, Filter, FilterId,
    SORT_KEY_INPUT_SENTINEL, SORT_KEY_OUTPUT_SENTINEL,
};
pub use line::LineBufferFilter;
pub use login::{LoginConfig, LoginFilter};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::engine::{EngineRef, SessionId};
use crate::error::{EngineError, EngineResult};
use crate::events::{kinds, Event, Payload};
use crate::sinks::OutputSink;

const SHUTDOWN_JOIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Running,
    Shutdown,
}

#[derive(Clone)]
struct FilterSlot {
    filter: Arc<dyn Filter>,
    insert_seq: u64,
}

struct StreamInner {
    session: SessionId,
    engine: EngineRef,
    filters: RwLock<Vec<FilterSlot>>,
    next_insert_seq: AtomicU64,
    state: Mutex<StreamState>,
    paused: AtomicBool,
    pending_in: Mutex<HashSet<FilterId>>,
    pending_out: Mutex<HashSet<FilterId>>,
    input_buffer: Mutex<Vec<Arc<Event>>>,
    output_buffer: Mutex<Vec<Arc<Event>>>,
    wakeup: Notify,
    input_sentinel: FilterId,
    output_sentinel: Arc<DefaultOutputFilter>,
}

/// Shared handle to a stream; what filters and external producers hold.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

/// A session's filter pipeline plus its worker task.
pub struct IoEventStream {
    handle: StreamHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IoEventStream {
    /// Build a running stream holding only the two sentinels and spawn
    /// its worker.
    pub fn new(session: SessionId, engine: EngineRef, sink: Arc<dyn OutputSink>) -> Self {
        let output_sentinel = Arc::new(DefaultOutputFilter::new(sink));
        let input_sentinel = DefaultInputFilter::new(session, engine.clone());
        let input_sentinel_id = input_sentinel.id();

        let inner = Arc::new(StreamInner {
            session,
            engine,
            filters: RwLock::new(Vec::new()),
            next_insert_seq: AtomicU64::new(0),
            state: Mutex::new(StreamState::Running),
            paused: AtomicBool::new(false),
            pending_in: Mutex::new(HashSet::new()),
            pending_out: Mutex::new(HashSet::new()),
            input_buffer: Mutex::new(Vec::new()),
            output_buffer: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            input_sentinel: input_sentinel_id,
            output_sentinel: Arc::clone(&output_sentinel),
        });
        let handle = StreamHandle { inner };

        handle.insert_slot(output_sentinel as Arc<dyn Filter>);
        handle.insert_slot(Arc::new(input_sentinel) as Arc<dyn Filter>);

        let worker_handle = handle.clone();
        let worker = tokio::spawn(async move {
            run_stream_worker(worker_handle).await;
        });

        IoEventStream {
            handle,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Shared handle for producers and filters.
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Stop the stream: drop every non-sentinel filter, wake the worker,
    /// and join it within two seconds or terminate it. Returns whether
    /// the worker exited on its own. Idempotent.
    pub async fn shutdown(&self) -> EngineResult<bool> {
        self.handle.begin_shutdown().await;
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => {
                let abort = worker.abort_handle();
                match tokio::time::timeout(SHUTDOWN_JOIN, worker).await {
                    Ok(_) => Ok(true),
                    Err(_) => {
                        abort.abort();
                        tracing::warn!(
                            session = %self.handle.session(),
                            "stream worker join timed out; terminated"
                        );
                        Ok(false)
                    }
                }
            }
            None => Ok(true),
        }
    }
}

impl StreamHandle {
    /// Session this stream belongs to
    pub fn session(&self) -> SessionId {
        self.inner.session
    }

    /// Engine reference for filters that dispatch events
    pub fn engine(&self) -> &EngineRef {
        &self.inner.engine
    }

    /// Whether the stream still accepts work
    pub fn is_running(&self) -> bool {
        *self.inner.state.lock() == StreamState::Running
    }

    /// Whether cycle processing is suspended
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Number of filters, sentinels included
    pub fn filter_count(&self) -> usize {
        self.inner.filters.read().len()
    }

    /// Whether a filter with this identity is installed
    pub fn has_filter(&self, id: FilterId) -> bool {
        self.inner
            .filters
            .read()
            .iter()
            .any(|slot| slot.filter.id() == id)
    }

    /// Recently delivered output, oldest first
    pub fn output_history(&self) -> Vec<String> {
        self.inner.output_sentinel.history()
    }

    /// Mark pending work in `direction` on behalf of `from` and wake the
    /// worker unless paused.
    pub fn notify_from(&self, from: FilterId, direction: Direction) {
        match direction {
            Direction::Input => self.inner.pending_in.lock().insert(from),
            Direction::Output => self.inner.pending_out.lock().insert(from),
        };
        if !self.is_paused() {
            self.inner.wakeup.notify_one();
        }
    }

    /// Notify from outside the filter chain.
    pub fn notify(&self, direction: Direction) {
        self.notify_from(FilterId::EXTERNAL, direction);
    }

    /// Buffer input events (client side) and notify.
    pub fn inject_input(&self, events: Vec<Arc<Event>>) -> EngineResult<()> {
        if !self.is_running() {
            return Err(EngineError::refused("shutdown stream"));
        }
        self.inner.input_buffer.lock().extend(events);
        self.notify(Direction::Input);
        Ok(())
    }

    /// Buffer output events (engine side) and notify.
    pub fn inject_output(&self, events: Vec<Arc<Event>>) -> EngineResult<()> {
        if !self.is_running() {
            return Err(EngineError::refused("shutdown stream"));
        }
        self.inner.output_buffer.lock().extend(events);
        self.notify(Direction::Output);
        Ok(())
    }

    /// Suspend cycle processing; notifications accumulate.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Resume cycle processing and wake the worker.
    pub fn unpause(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.wakeup.notify_one();
    }

    /// Install filters, de-duplicated by identity. Each genuinely new
    /// filter gets its `start` hook, then the stream wakes so anything
    /// the hook queued is processed.
    pub async fn add_filters(&self, filters: Vec<Arc<dyn Filter>>) -> EngineResult<()> {
        if !self.is_running() {
            return Err(EngineError::refused("shutdown stream"));
        }
        let mut started = Vec::new();
        for filter in filters {
            if self.has_filter(filter.id()) {
                continue;
            }
            self.insert_slot(Arc::clone(&filter));
            started.push(filter);
        }
        for filter in &started {
            filter.start(self).await;
        }
        if !started.is_empty() {
            for filter in &started {
                self.notify_from(filter.id(), Direction::Input);
                self.notify_from(filter.id(), Direction::Output);
            }
        }
        Ok(())
    }

    /// Remove filters by identity. Sentinels are excluded. Returns the
    /// removed filters' deferred events, input before output.
    pub async fn remove_filters(&self, ids: &[FilterId]) -> Vec<Arc<Event>> {
        let removable: Vec<FilterId> = ids
            .iter()
            .copied()
            .filter(|id| !self.is_sentinel(*id))
            .collect();

        let removed: Vec<Arc<dyn Filter>> = {
            let mut filters = self.inner.filters.write();
            let mut removed = Vec::new();
            filters.retain(|slot| {
                if removable.contains(&slot.filter.id()) {
                    removed.push(Arc::clone(&slot.filter));
                    false
                } else {
                    true
                }
            });
            removed
        };

        let mut consequences = Vec::new();
        for filter in removed {
            filter.stop(self).await;
            consequences.extend(filter.queued_input());
            consequences.extend(filter.queued_output());
        }
        consequences
    }

    fn is_sentinel(&self, id: FilterId) -> bool {
        id == self.inner.input_sentinel || id == self.inner.output_sentinel.id()
    }

    fn insert_slot(&self, filter: Arc<dyn Filter>) {
        let insert_seq = self.inner.next_insert_seq.fetch_add(1, Ordering::Relaxed);
        let mut filters = self.inner.filters.write();
        filters.push(FilterSlot { filter, insert_seq });
        filters.sort_by_key(|slot| (slot.filter.sort_key(), slot.insert_seq));
    }

    async fn begin_shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == StreamState::Shutdown {
                return;
            }
            *state = StreamState::Shutdown;
        }
        let non_sentinels: Vec<FilterId> = {
            self.inner
                .filters
                .read()
                .iter()
                .map(|slot| slot.filter.id())
                .filter(|id| !self.is_sentinel(*id))
                .collect()
        };
        let leftovers = self.remove_filters(&non_sentinels).await;
        if !leftovers.is_empty() {
            // Deferred output still gets the worker's final drain;
            // deferred input has no consumer left.
            let (output, dropped): (Vec<_>, Vec<_>) = leftovers
                .into_iter()
                .partition(|event| event.is_a(&kinds::OUTPUT));
            if !output.is_empty() {
                self.inner.output_buffer.lock().extend(output);
                self.inner.pending_out.lock().insert(FilterId::EXTERNAL);
            }
            if !dropped.is_empty() {
                tracing::debug!(
                    session = %self.session(),
                    dropped = dropped.len(),
                    "deferred input dropped at stream shutdown"
                );
            }
        }
        self.inner.paused.store(false, Ordering::Release);
        self.inner.wakeup.notify_one();
    }

    fn snapshot(&self) -> Vec<FilterSlot> {
        self.inner.filters.read().clone()
    }

    fn has_pending(&self) -> bool {
        !self.inner.pending_in.lock().is_empty() || !self.inner.pending_out.lock().is_empty()
    }

    // One full iteration: input cycle first, then output cycle.
    async fn run_cycles(&self) {
        let sentinels_present = {
            let filters = self.inner.filters.read();
            filters
                .iter()
                .any(|slot| slot.filter.id() == self.inner.input_sentinel)
                && filters
                    .iter()
                    .any(|slot| slot.filter.id() == self.inner.output_sentinel.id())
        };
        if !sentinels_present {
            tracing::error!(session = %self.session(), "sentinel missing; terminating stream");
            self.begin_shutdown().await;
            return;
        }

        let input_pending = {
            let mut pending = self.inner.pending_in.lock();
            let was = !pending.is_empty();
            pending.clear();
            was
        };
        if input_pending {
            self.input_cycle().await;
        }

        let output_pending = {
            let mut pending = self.inner.pending_out.lock();
            let was = !pending.is_empty();
            pending.clear();
            was
        };
        if output_pending {
            self.output_cycle().await;
        }
    }

    async fn input_cycle(&self) {
        let mut events = std::mem::take(&mut *self.inner.input_buffer.lock());
        let slots = self.snapshot();
        let mut removals = Vec::new();

        for slot in &slots {
            let filter = &slot.filter;
            let result = filter.handle_input(self, events).await;
            if (result.is_none() || filter.finished()) && !self.is_sentinel(filter.id()) {
                removals.push(filter.id());
                events = filter.queued_input();
                let deferred_out = filter.queued_output();
                if !deferred_out.is_empty() {
                    self.inner.output_buffer.lock().extend(deferred_out);
                    self.inner.pending_out.lock().insert(filter.id());
                }
            } else {
                events = result.unwrap_or_default();
                events.extend(filter.queued_input());
            }
        }

        if !events.is_empty() {
            // Nothing should survive past the input sentinel.
            tracing::error!(
                session = %self.session(),
                count = events.len(),
                "events escaped the input chain"
            );
            let notice = Event::new(
                &kinds::UNHANDLED_INPUT,
                Payload::Session {
                    session: self.session(),
                    detail: format!("{} events escaped the input chain", events.len()),
                },
            );
            if let Err(err) = self.engine().dispatch_events(vec![notice]) {
                tracing::debug!(%err, "unhandled-input notice dropped");
            }
        }

        self.apply_removals(removals).await;
    }

    async fn output_cycle(&self) {
        let mut events = std::mem::take(&mut *self.inner.output_buffer.lock());
        let slots = self.snapshot();
        let mut removals = Vec::new();

        for slot in slots.iter().rev() {
            let filter = &slot.filter;
            let result = filter.handle_output(self, events).await;
            if (result.is_none() || filter.finished()) && !self.is_sentinel(filter.id()) {
                removals.push(filter.id());
                events = filter.queued_output();
                let deferred_in = filter.queued_input();
                if !deferred_in.is_empty() {
                    self.inner.input_buffer.lock().extend(deferred_in);
                    self.inner.pending_in.lock().insert(filter.id());
                }
            } else {
                events = result.unwrap_or_default();
                events.extend(filter.queued_output());
            }
        }

        if !events.is_empty() {
            tracing::warn!(
                session = %self.session(),
                count = events.len(),
                "events escaped the output chain"
            );
            let notice = Event::new(
                &kinds::UNHANDLED_OUTPUT,
                Payload::Session {
                    session: self.session(),
                    detail: format!("{} events escaped the output chain", events.len()),
                },
            );
            if let Err(err) = self.engine().dispatch_events(vec![notice]) {
                tracing::debug!(%err, "unhandled-output notice dropped");
            }
        }

        self.apply_removals(removals).await;
    }

    async fn apply_removals(&self, removals: Vec<FilterId>) {
        if removals.is_empty() {
            return;
        }
        let removed: Vec<Arc<dyn Filter>> = {
            let mut filters = self.inner.filters.write();
            let mut removed = Vec::new();
            filters.retain(|slot| {
                if removals.contains(&slot.filter.id()) {
                    removed.push(Arc::clone(&slot.filter));
                    false
                } else {
                    true
                }
            });
            removed
        };
        for filter in removed {
            tracing::debug!(session = %self.session(), "filter removed mid-cycle");
            filter.stop(self).await;
        }
    }
}

async fn run_stream_worker(handle: StreamHandle) {
    loop {
        let notified = handle.inner.wakeup.notified();
        if !handle.is_running() {
            // Best-effort final drain so teardown notices reach the sink.
            if handle.has_pending() {
                handle.run_cycles().await;
            }
            break;
        }
        if !handle.is_paused() && handle.has_pending() {
            handle.run_cycles().await;
        } else {
            notified.await;
        }
    }
    tracing::debug!(session = %handle.session(), "stream worker exited");
}

#[cfg(test)]
mod tests;

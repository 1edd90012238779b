//! Filter contract and the sentinel filters
//!
//! A filter is one stage of a session's bidirectional pipeline. Input
//! events flow through filters in ascending sort-key order toward the
//! engine; output events flow in descending order toward the client. A
//! filter may transform the batch it is handed, swallow it, defer events
//! for the next cycle through its queues, or declare itself done.
//!
//! Every stream carries two irremovable sentinels: the input sentinel at
//! the top of the chain turns anything that reaches it into an
//! `unhandled-input` notice, and the output sentinel at the bottom
//! delivers rendered text to the session's output sink while keeping a
//! bounded history.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::{EngineRef, SessionId};
use crate::events::{kinds, Event, Payload};
use crate::sinks::{OutputHistory, OutputSink};

use super::StreamHandle;

/// Sort key of the output sentinel: last in the output direction.
pub const SORT_KEY_OUTPUT_SENTINEL: u16 = 0;
/// Sort key of the input sentinel: last in the input direction.
pub const SORT_KEY_INPUT_SENTINEL: u16 = 1000;

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a filter, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

impl FilterId {
    /// External producers (connection drivers, the engine) notifying a
    /// stream without being a filter in it.
    pub const EXTERNAL: FilterId = FilterId(0);

    /// Allocate a fresh identity.
    pub fn next() -> Self {
        FilterId(NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Pipeline direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client toward engine
    Input,
    /// Engine toward client
    Output,
}

/// One stage of a session pipeline.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Process-unique identity; streams de-duplicate and remove by it.
    fn id(&self) -> FilterId;

    /// Placement: smaller keys sit earlier in the input direction and
    /// later in the output direction. Equal keys keep insertion order.
    fn sort_key(&self) -> u16;

    /// Transform events flowing toward the engine. `None` means "this
    /// filter is done; remove it" — its deferred input takes the batch's
    /// place.
    async fn handle_input(
        &self,
        stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>>;

    /// Transform events flowing toward the client. `None` requests
    /// removal, as on the input side.
    async fn handle_output(
        &self,
        stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>>;

    /// Lifecycle hook on insertion.
    async fn start(&self, _stream: &StreamHandle) {}

    /// Lifecycle hook on removal.
    async fn stop(&self, _stream: &StreamHandle) {}

    /// Inspected after each invocation; `true` means "remove me".
    fn finished(&self) -> bool {
        false
    }

    /// Drain the events this filter deferred for the input direction.
    fn queued_input(&self) -> Vec<Arc<Event>> {
        Vec::new()
    }

    /// Drain the events this filter deferred for the output direction.
    fn queued_output(&self) -> Vec<Arc<Event>> {
        Vec::new()
    }
}

/// Deferred-event storage for filters that queue work between cycles.
///
/// Embed one and forward `queued_input` / `queued_output` to its drains;
/// call [`StreamHandle::notify`] after queueing so the stream wakes.
#[derive(Default)]
pub struct DeferredQueues {
    input: Mutex<Vec<Arc<Event>>>,
    output: Mutex<Vec<Arc<Event>>>,
}

impl DeferredQueues {
    /// Empty queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer an event toward the engine.
    pub fn queue_input(&self, event: Arc<Event>) {
        self.input.lock().push(event);
    }

    /// Defer an event toward the client.
    pub fn queue_output(&self, event: Arc<Event>) {
        self.output.lock().push(event);
    }

    /// Take everything deferred toward the engine.
    pub fn drain_input(&self) -> Vec<Arc<Event>> {
        std::mem::take(&mut self.input.lock())
    }

    /// Take everything deferred toward the client.
    pub fn drain_output(&self) -> Vec<Arc<Event>> {
        std::mem::take(&mut self.output.lock())
    }
}

/// Input-end sentinel: anything that reaches it was consumed by no
/// filter, which is a bug in the chain, not in the peer.
pub struct DefaultInputFilter {
    id: FilterId,
    session: SessionId,
    engine: EngineRef,
}

impl DefaultInputFilter {
    pub(super) fn new(session: SessionId, engine: EngineRef) -> Self {
        DefaultInputFilter {
            id: FilterId::next(),
            session,
            engine,
        }
    }
}

#[async_trait]
impl Filter for DefaultInputFilter {
    fn id(&self) -> FilterId {
        self.id
    }

    fn sort_key(&self) -> u16 {
        SORT_KEY_INPUT_SENTINEL
    }

    async fn handle_input(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        for event in events {
            tracing::warn!(
                session = %self.session,
                kind = event.kind().name(),
                "input reached the sentinel unconsumed"
            );
            let notice = Event::new(
                &kinds::UNHANDLED_INPUT,
                Payload::Session {
                    session: self.session,
                    detail: format!("unconsumed {} event", event.kind().name()),
                },
            );
            if let Err(err) = self.engine.dispatch_events(vec![notice]) {
                tracing::debug!(%err, "unhandled-input notice dropped");
            }
        }
        Some(Vec::new())
    }

    async fn handle_output(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        Some(events)
    }
}

/// Output-end sentinel: renders text payloads into the session's sink
/// and keeps a bounded history of what was delivered.
pub struct DefaultOutputFilter {
    id: FilterId,
    sink: Arc<dyn OutputSink>,
    history: OutputHistory,
}

impl DefaultOutputFilter {
    const HISTORY_CAPACITY: usize = 100;

    pub(super) fn new(sink: Arc<dyn OutputSink>) -> Self {
        DefaultOutputFilter {
            id: FilterId::next(),
            sink,
            history: OutputHistory::new(Self::HISTORY_CAPACITY),
        }
    }

    /// Recently delivered chunks, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.history.snapshot()
    }
}

#[async_trait]
impl Filter for DefaultOutputFilter {
    fn id(&self) -> FilterId {
        self.id
    }

    fn sort_key(&self) -> u16 {
        SORT_KEY_OUTPUT_SENTINEL
    }

    async fn handle_input(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        Some(events)
    }

    async fn handle_output(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        for event in events {
            match event.text() {
                Some(text) => {
                    self.history.record(text);
                    self.sink.send(text).await;
                }
                None => {
                    tracing::debug!(kind = event.kind().name(), "discarding textless output");
                }
            }
        }
        Some(Vec::new())
    }
}

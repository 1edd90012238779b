//! Handler subscriptions with kind-path lookup
//!
//! Subscribers register against a kind; dispatch looks up the union of
//! subscriber lists along the event's kind path, most-specific first.
//! Read-heavy: lookups take the read lock, subscription changes the write
//! lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::EngineResult;
use crate::events::{Event, EventKind};

/// A subscriber invoked for every event of a matching kind.
///
/// Returned events are consequences: the dispatcher routes them back
/// through the engine. An `Err` is converted to a single
/// `untrapped-exception` event; the handler is not retried.
#[async_trait]
pub trait Handler: Send + Sync {
    /// React to one event, producing zero or more consequences.
    async fn handle(&self, event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>>;
}

/// Per-kind subscriber lists, inherited along the kind tree.
#[derive(Default)]
pub struct HandlerRegistry {
    subscribers: RwLock<HashMap<&'static str, Vec<Arc<dyn Handler>>>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the (empty) subscriber list for a kind without registering a
    /// handler. Also warms the kind's path cache.
    pub fn register_kind(&self, kind: &'static EventKind) {
        kind.path();
        self.subscribers.write().entry(kind.name()).or_default();
    }

    /// Subscribe `handler` to `kind` and its descendants.
    ///
    /// Registering the same handler twice on one kind is a no-op.
    pub fn register(&self, kind: &'static EventKind, handler: Arc<dyn Handler>) {
        kind.path();
        let mut subscribers = self.subscribers.write();
        let list = subscribers.entry(kind.name()).or_default();
        if !list.iter().any(|known| Arc::ptr_eq(known, &handler)) {
            list.push(handler);
        }
    }

    /// Drop a subscription; returns whether it was present.
    pub fn unregister(&self, kind: &'static EventKind, handler: &Arc<dyn Handler>) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.get_mut(kind.name()) {
            Some(list) => {
                let before = list.len();
                list.retain(|known| !Arc::ptr_eq(known, handler));
                before != list.len()
            }
            None => false,
        }
    }

    /// Handlers matching `kind`, walking its path most-specific first,
    /// de-duplicated by identity preserving first occurrence.
    pub fn handlers_for(&self, kind: &'static EventKind) -> Vec<Arc<dyn Handler>> {
        let subscribers = self.subscribers.read();
        let mut seen: Vec<*const ()> = Vec::new();
        let mut matched = Vec::new();
        for name in kind.path() {
            if let Some(list) = subscribers.get(name) {
                for handler in list {
                    let identity = Arc::as_ptr(handler) as *const ();
                    if !seen.contains(&identity) {
                        seen.push(identity);
                        matched.push(Arc::clone(handler));
                    }
                }
            }
        }
        matched
    }

    /// Number of kinds with a (possibly empty) subscriber list
    pub fn kind_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{kinds, Payload};
    use parking_lot::Mutex;

    struct Recorder {
        label: &'static str,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Recorder {
                label,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>> {
            self.calls.lock().push(event.kind().name());
            Ok(Vec::new())
        }
    }

    fn as_handler(recorder: &Arc<Recorder>) -> Arc<dyn Handler> {
        Arc::clone(recorder) as Arc<dyn Handler>
    }

    #[test]
    fn lookup_walks_path_most_specific_first() {
        let registry = HandlerRegistry::new();
        let on_input = Recorder::new("input");
        let on_io = Recorder::new("io");
        let on_root = Recorder::new("event");
        registry.register(&kinds::EVENT, as_handler(&on_root));
        registry.register(&kinds::INPUT, as_handler(&on_input));
        registry.register(&kinds::IO, as_handler(&on_io));

        let matched = registry.handlers_for(&kinds::INPUT);
        let labels: Vec<_> = matched
            .iter()
            .map(|h| Arc::as_ptr(h) as *const ())
            .collect();
        assert_eq!(matched.len(), 3);
        assert_eq!(labels[0], Arc::as_ptr(&as_handler(&on_input)) as *const ());
        assert_eq!(labels[1], Arc::as_ptr(&as_handler(&on_io)) as *const ());
        assert_eq!(labels[2], Arc::as_ptr(&as_handler(&on_root)) as *const ());
    }

    #[test]
    fn handler_on_two_path_kinds_appears_once() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::new("both");
        registry.register(&kinds::INPUT, as_handler(&recorder));
        registry.register(&kinds::IO, as_handler(&recorder));

        assert_eq!(registry.handlers_for(&kinds::INPUT).len(), 1);
    }

    #[test]
    fn double_registration_on_one_kind_is_a_noop() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::new("dup");
        registry.register(&kinds::TICK, as_handler(&recorder));
        registry.register(&kinds::TICK, as_handler(&recorder));

        assert_eq!(registry.handlers_for(&kinds::TICK).len(), 1);
    }

    #[test]
    fn unregister_removes_the_subscription() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::new("gone");
        let handler = as_handler(&recorder);
        registry.register(&kinds::TICK, Arc::clone(&handler));

        assert!(registry.unregister(&kinds::TICK, &handler));
        assert!(!registry.unregister(&kinds::TICK, &handler));
        assert!(registry.handlers_for(&kinds::TICK).is_empty());
    }

    #[tokio::test]
    async fn handlers_observe_events() {
        let registry = HandlerRegistry::new();
        let recorder = Recorder::new("obs");
        registry.register(&kinds::SYSTEM, as_handler(&recorder));

        let event = Event::new(&kinds::TICK, Payload::None);
        for handler in registry.handlers_for(event.kind()) {
            handler.handle(Arc::clone(&event)).await.unwrap();
        }
        assert_eq!(recorder.calls.lock().as_slice(), &["tick"]);
    }
}

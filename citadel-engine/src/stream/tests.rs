use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::{EngineRef, SessionId};
use crate::events::{kinds, Event, Payload};
use crate::sinks::BufferSink;

use super::*;

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn text_event(kind: &'static crate::events::EventKind, text: &str) -> Arc<Event> {
    Event::new(kind, Payload::Text(text.into()))
}

fn test_stream() -> (IoEventStream, StreamHandle, Arc<BufferSink>) {
    let sink = BufferSink::new();
    let stream = IoEventStream::new(SessionId::new(), EngineRef::detached(), sink.clone());
    let handle = stream.handle();
    (stream, handle, sink)
}

/// Appends its tag to every text payload it sees, both directions.
struct TagFilter {
    id: FilterId,
    key: u16,
    tag: &'static str,
}

impl TagFilter {
    fn new(key: u16, tag: &'static str) -> Arc<Self> {
        Arc::new(TagFilter {
            id: FilterId::next(),
            key,
            tag,
        })
    }

    fn retag(&self, events: Vec<Arc<Event>>) -> Vec<Arc<Event>> {
        events
            .into_iter()
            .map(|event| match event.text() {
                Some(text) => Event::new(event.kind(), Payload::Text(format!("{text}>{}", self.tag))),
                None => event,
            })
            .collect()
    }
}

#[async_trait]
impl Filter for TagFilter {
    fn id(&self) -> FilterId {
        self.id
    }

    fn sort_key(&self) -> u16 {
        self.key
    }

    async fn handle_input(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        Some(self.retag(events))
    }

    async fn handle_output(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        Some(self.retag(events))
    }
}

/// Consumes every input event, recording its text.
struct CollectFilter {
    id: FilterId,
    key: u16,
    seen: Mutex<Vec<String>>,
}

impl CollectFilter {
    fn new(key: u16) -> Arc<Self> {
        Arc::new(CollectFilter {
            id: FilterId::next(),
            key,
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Filter for CollectFilter {
    fn id(&self) -> FilterId {
        self.id
    }

    fn sort_key(&self) -> u16 {
        self.key
    }

    async fn handle_input(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        let mut seen = self.seen.lock();
        for event in &events {
            if let Some(text) = event.text() {
                seen.push(text.to_string());
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

/// Removes itself on first input, substituting a preloaded deferred batch.
struct OneShotFilter {
    id: FilterId,
    key: u16,
    queues: DeferredQueues,
}

impl OneShotFilter {
    fn new(key: u16, deferred_input: &str) -> Arc<Self> {
        let filter = OneShotFilter {
            id: FilterId::next(),
            key,
            queues: DeferredQueues::new(),
        };
        filter
            .queues
            .queue_input(text_event(&kinds::INPUT, deferred_input));
        Arc::new(filter)
    }
}

#[async_trait]
impl Filter for OneShotFilter {
    fn id(&self) -> FilterId {
        self.id
    }

    fn sort_key(&self) -> u16 {
        self.key
    }

    async fn handle_input(
        &self,
        _stream: &StreamHandle,
        _events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        None
    }

    async fn handle_output(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        Some(events)
    }

    fn queued_input(&self) -> Vec<Arc<Event>> {
        self.queues.drain_input()
    }

    fn queued_output(&self) -> Vec<Arc<Event>> {
        self.queues.drain_output()
    }
}

#[tokio::test]
async fn new_stream_has_exactly_the_sentinels() {
    let (stream, handle, _sink) = test_stream();
    assert_eq!(handle.filter_count(), 2);
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn add_then_remove_restores_the_filter_list() {
    let (stream, handle, _sink) = test_stream();
    let filter = TagFilter::new(300, "a");
    let id = filter.id();

    handle
        .add_filters(vec![filter as Arc<dyn Filter>])
        .await
        .unwrap();
    assert_eq!(handle.filter_count(), 3);

    handle.remove_filters(&[id]).await;
    assert_eq!(handle.filter_count(), 2);
    assert!(!handle.has_filter(id));
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn sentinels_cannot_be_removed() {
    let (stream, handle, _sink) = test_stream();
    let sentinel_ids: Vec<FilterId> = {
        handle
            .inner
            .filters
            .read()
            .iter()
            .map(|slot| slot.filter.id())
            .collect()
    };
    handle.remove_filters(&sentinel_ids).await;
    assert_eq!(handle.filter_count(), 2);
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_add_is_ignored() {
    let (stream, handle, _sink) = test_stream();
    let filter = TagFilter::new(300, "a");
    handle
        .add_filters(vec![filter.clone() as Arc<dyn Filter>, filter as Arc<dyn Filter>])
        .await
        .unwrap();
    assert_eq!(handle.filter_count(), 3);
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn input_traverses_filters_in_ascending_sort_order() {
    let (stream, handle, _sink) = test_stream();
    let collector = CollectFilter::new(900);
    let second = TagFilter::new(400, "second");
    let first = TagFilter::new(200, "first");
    handle
        .add_filters(vec![
            collector.clone() as Arc<dyn Filter>,
            second as Arc<dyn Filter>,
            first as Arc<dyn Filter>,
        ])
        .await
        .unwrap();

    handle
        .inject_input(vec![text_event(&kinds::INPUT, "x")])
        .unwrap();

    eventually("input to traverse the chain", || {
        !collector.seen.lock().is_empty()
    })
    .await;
    assert_eq!(collector.seen.lock().as_slice(), &["x>first>second"]);
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn output_traverses_filters_in_descending_sort_order() {
    let (stream, handle, sink) = test_stream();
    let low = TagFilter::new(200, "low");
    let high = TagFilter::new(400, "high");
    handle
        .add_filters(vec![low as Arc<dyn Filter>, high as Arc<dyn Filter>])
        .await
        .unwrap();

    handle
        .inject_output(vec![text_event(&kinds::OUTPUT, "y")])
        .unwrap();

    eventually("output to reach the sink", || !sink.contents().is_empty()).await;
    assert_eq!(sink.contents(), ["y>high>low"]);
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn removed_filter_substitutes_its_deferred_input() {
    let (stream, handle, _sink) = test_stream();
    let collector = CollectFilter::new(900);
    let oneshot = OneShotFilter::new(500, "deferred");
    let oneshot_id = oneshot.id();
    handle
        .add_filters(vec![
            collector.clone() as Arc<dyn Filter>,
            oneshot as Arc<dyn Filter>,
        ])
        .await
        .unwrap();

    handle
        .inject_input(vec![text_event(&kinds::INPUT, "swallowed")])
        .unwrap();

    eventually("one-shot filter removal", || !handle.has_filter(oneshot_id)).await;
    eventually("deferred input to flow onward", || {
        !collector.seen.lock().is_empty()
    })
    .await;
    assert_eq!(collector.seen.lock().as_slice(), &["deferred"]);
    assert_eq!(handle.filter_count(), 3);
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn paused_stream_defers_processing_until_unpause() {
    let (stream, handle, _sink) = test_stream();
    let collector = CollectFilter::new(900);
    handle
        .add_filters(vec![collector.clone() as Arc<dyn Filter>])
        .await
        .unwrap();

    handle.pause();
    handle
        .inject_input(vec![text_event(&kinds::INPUT, "held")])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(collector.seen.lock().is_empty());

    handle.unpause();
    eventually("held input to be processed", || {
        !collector.seen.lock().is_empty()
    })
    .await;
    assert_eq!(collector.seen.lock().as_slice(), &["held"]);
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_strips_non_sentinel_filters_and_joins_the_worker() {
    let (stream, handle, _sink) = test_stream();
    handle
        .add_filters(vec![TagFilter::new(300, "a") as Arc<dyn Filter>])
        .await
        .unwrap();

    let clean = stream.shutdown().await.unwrap();
    assert!(clean);
    assert_eq!(handle.filter_count(), 2);
    assert!(!handle.is_running());
    assert!(matches!(
        handle.inject_input(vec![text_event(&kinds::INPUT, "late")]),
        Err(crate::error::EngineError::Refused { .. })
    ));
}

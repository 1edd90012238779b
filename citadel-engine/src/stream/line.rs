//! Line assembly for raw connection input

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::events::{kinds, Event, Payload};

use super::{Filter, FilterId, StreamHandle};

/// Assembles raw input chunks into line events.
///
/// Connection drivers hand the stream whatever the socket produced;
/// everything downstream (the login filter in particular) wants whole
/// lines. Sits near the client end of the chain. Carriage returns are
/// stripped; a partial trailing line waits for its newline.
pub struct LineBufferFilter {
    id: FilterId,
    partial: Mutex<String>,
}

impl LineBufferFilter {
    /// Placement near the client end of the chain.
    pub const SORT_KEY: u16 = 100;

    /// Empty assembly buffer
    pub fn new() -> Arc<Self> {
        Arc::new(LineBufferFilter {
            id: FilterId::next(),
            partial: Mutex::new(String::new()),
        })
    }
}

#[async_trait]
impl Filter for LineBufferFilter {
    fn id(&self) -> FilterId {
        self.id
    }

    fn sort_key(&self) -> u16 {
        Self::SORT_KEY
    }

    async fn handle_input(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        let mut lines = Vec::new();
        for event in events {
            let Some(chunk) = event.text() else {
                // Not raw text; let it flow onward untouched.
                lines.push(event);
                continue;
            };
            let mut partial = self.partial.lock();
            partial.push_str(chunk);
            while let Some(newline) = partial.find('\n') {
                let mut line: String = partial.drain(..=newline).collect();
                line.truncate(line.trim_end_matches(['\n', '\r']).len());
                lines.push(Event::new(&kinds::INPUT, Payload::Text(line)));
            }
        }
        Some(lines)
    }

    async fn handle_output(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        Some(events)
    }
}

#[cfg(test)]
mod line_tests {
    use super::*;
    use crate::engine::{EngineRef, SessionId};
    use crate::sinks::BufferSink;
    use crate::stream::IoEventStream;

    fn raw(text: &str) -> Arc<Event> {
        Event::new(&kinds::INPUT, Payload::Text(text.into()))
    }

    async fn collect_lines(chunks: &[&str]) -> Vec<String> {
        let stream = IoEventStream::new(
            SessionId::new(),
            EngineRef::detached(),
            BufferSink::new(),
        );
        let handle = stream.handle();
        let filter = LineBufferFilter::new();
        let mut out = Vec::new();
        for chunk in chunks {
            let result = filter
                .handle_input(&handle, vec![raw(chunk)])
                .await
                .unwrap();
            out.extend(
                result
                    .iter()
                    .filter_map(|event| event.text().map(str::to_string)),
            );
        }
        stream.shutdown().await.unwrap();
        out
    }

    #[tokio::test]
    async fn whole_lines_pass_through() {
        assert_eq!(collect_lines(&["ged\n"]).await, ["ged"]);
    }

    #[tokio::test]
    async fn split_chunks_are_reassembled() {
        assert_eq!(collect_lines(&["ge", "d\ntest", "ing\n"]).await, ["ged", "testing"]);
    }

    #[tokio::test]
    async fn carriage_returns_are_stripped() {
        assert_eq!(collect_lines(&["ged\r\n"]).await, ["ged"]);
    }

    #[tokio::test]
    async fn partial_line_waits() {
        assert!(collect_lines(&["no newline"]).await.is_empty());
    }
}

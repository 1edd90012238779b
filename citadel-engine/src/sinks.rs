//! Output, listener, and log seams
//!
//! Terminal collaborators the core hands data to. Concrete socket writers
//! and accept loops live outside the crate; tests use [`BufferSink`].

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::EngineRef;

/// Accepts rendered text bound for a client. Returns no events.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Deliver one chunk of rendered text.
    async fn send(&self, text: &str);
}

/// Sink that keeps everything it is sent. Test double and default history
/// backing.
#[derive(Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    /// Empty sink
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything sent so far, in order.
    pub fn contents(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

#[async_trait]
impl OutputSink for BufferSink {
    async fn send(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }
}

/// Produces `connection-opened` events into the engine.
///
/// The accept loop itself is external; implementations are handed an
/// [`EngineRef`] at startup and run on their own task.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Start producing connections into the engine.
    async fn run(&self, engine: EngineRef);
}

/// Log severities accepted by a [`LogSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warn,
    Error,
    Crit,
    Fatal,
}

/// Accepts structured log records. Must be thread-safe; may be swapped at
/// engine construction.
pub trait LogSink: Send + Sync {
    /// Record one message at the given severity.
    fn log(&self, severity: Severity, message: &str);
}

/// Default sink: forwards onto the `tracing` subscriber.
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => tracing::debug!("{message}"),
            Severity::Info | Severity::Notice => tracing::info!("{message}"),
            Severity::Warn => tracing::warn!("{message}"),
            Severity::Error | Severity::Crit | Severity::Fatal => tracing::error!("{message}"),
        }
    }
}

/// Bounded ring of recently delivered output, kept by the default output
/// sentinel.
pub struct OutputHistory {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputHistory {
    /// History bounded to `capacity` entries; older entries fall off.
    pub fn new(capacity: usize) -> Self {
        OutputHistory {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record one delivered chunk.
    pub fn record(&self, text: &str) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(text.to_string());
    }

    /// Oldest-first snapshot.
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let history = OutputHistory::new(3);
        for i in 0..5 {
            history.record(&format!("line {i}"));
        }
        assert_eq!(history.snapshot(), ["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn buffer_sink_keeps_order() {
        let sink = BufferSink::new();
        sink.send("one").await;
        sink.send("two").await;
        assert_eq!(sink.contents(), ["one", "two"]);
    }
}

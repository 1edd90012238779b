//! Time-based event scheduling
//!
//! Three entry variants: fire once at a wall-clock time, fire once at a
//! tick count, or fire every `interval` ticks. The engine calls
//! [`Scheduler::drain_due`] once per tick; everything due comes back in a
//! deterministic order and repeating entries reschedule themselves.
//!
//! The scheduler holds no engine reference: operations that are due
//! immediately return the events to the caller, and the engine handle
//! wrappers dispatch them. One mutex covers all three collections.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::events::{Event, EventId};

struct TimedEntry {
    at: DateTime<Utc>,
    events: Vec<Arc<Event>>,
}

struct TickEntry {
    at_tick: u64,
    events: Vec<Arc<Event>>,
}

struct RepeatingEntry {
    next_tick: u64,
    interval: u64,
    events: Vec<Arc<Event>>,
}

#[derive(Default)]
struct SchedulerInner {
    timed: Vec<TimedEntry>,
    ticked: Vec<TickEntry>,
    repeating: Vec<RepeatingEntry>,
}

/// Absolute-time, tick-offset, and repeating event scheduling.
#[derive(Default)]
pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    /// Empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `events` to fire once at wall time `at`.
    ///
    /// If `at` is not in the future the events are returned for immediate
    /// dispatch instead of being queued.
    pub fn schedule_at(&self, at: DateTime<Utc>, events: Vec<Arc<Event>>) -> Vec<Arc<Event>> {
        if at <= Utc::now() {
            return events;
        }
        self.inner.lock().timed.push(TimedEntry { at, events });
        Vec::new()
    }

    /// Schedule `events` by tick offset from `current_tick`.
    ///
    /// `n == 0` returns the events for immediate dispatch; `n > 0` fires
    /// once at `current_tick + n`; `n < 0` fires every `|n|` ticks.
    pub fn schedule_in_ticks(
        &self,
        current_tick: u64,
        n: i64,
        events: Vec<Arc<Event>>,
    ) -> Vec<Arc<Event>> {
        match n {
            0 => events,
            n if n > 0 => {
                self.inner.lock().ticked.push(TickEntry {
                    at_tick: current_tick + n as u64,
                    events,
                });
                Vec::new()
            }
            n => {
                let interval = n.unsigned_abs();
                self.inner.lock().repeating.push(RepeatingEntry {
                    next_tick: current_tick + interval,
                    interval,
                    events,
                });
                Vec::new()
            }
        }
    }

    /// Remove every pending entry whose event list contains any of the
    /// given events, matched by identity. An empty argument cancels all
    /// entries. Returns the events of the removed entries; events already
    /// drained are beyond recall.
    pub fn cancel(&self, events: &[Arc<Event>]) -> Vec<Arc<Event>> {
        let ids: Vec<EventId> = events.iter().map(|event| event.id()).collect();
        let matches = |entry_events: &[Arc<Event>]| {
            ids.is_empty()
                || entry_events
                    .iter()
                    .any(|event| ids.contains(&event.id()))
        };

        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        inner.timed.retain_mut(|entry| {
            if matches(&entry.events) {
                removed.append(&mut entry.events);
                false
            } else {
                true
            }
        });
        inner.ticked.retain_mut(|entry| {
            if matches(&entry.events) {
                removed.append(&mut entry.events);
                false
            } else {
                true
            }
        });
        inner.repeating.retain_mut(|entry| {
            if matches(&entry.events) {
                removed.append(&mut entry.events);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Extract everything due at (`current_tick`, `now`).
    ///
    /// Order: timed entries ascending by time, then one-shot tick entries
    /// ascending by tick, then repeating entries ascending by next fire
    /// tick; events within one entry keep their relative order. Repeating
    /// entries advance by their interval.
    pub fn drain_due(&self, current_tick: u64, now: DateTime<Utc>) -> Vec<Arc<Event>> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();

        let mut due_timed: Vec<TimedEntry> = Vec::new();
        inner.timed.retain_mut(|entry| {
            if entry.at <= now {
                due_timed.push(TimedEntry {
                    at: entry.at,
                    events: std::mem::take(&mut entry.events),
                });
                false
            } else {
                true
            }
        });
        due_timed.sort_by_key(|entry| entry.at);
        for entry in due_timed {
            due.extend(entry.events);
        }

        let mut due_ticked: Vec<TickEntry> = Vec::new();
        inner.ticked.retain_mut(|entry| {
            if entry.at_tick <= current_tick {
                due_ticked.push(TickEntry {
                    at_tick: entry.at_tick,
                    events: std::mem::take(&mut entry.events),
                });
                false
            } else {
                true
            }
        });
        due_ticked.sort_by_key(|entry| entry.at_tick);
        for entry in due_ticked {
            due.extend(entry.events);
        }

        inner
            .repeating
            .sort_by_key(|entry| entry.next_tick);
        for entry in inner.repeating.iter_mut() {
            if entry.next_tick <= current_tick {
                due.extend(entry.events.iter().cloned());
                entry.next_tick += entry.interval;
            }
        }

        due
    }

    /// Number of pending entries across all three variants
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.timed.len() + inner.ticked.len() + inner.repeating.len()
    }
}

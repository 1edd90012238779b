//! Immutable events and the event-kind hierarchy
//!
//! An [`Event`] is a unit of work: a kind tag, a dispatch priority, a
//! creation stamp, and a kind-specific payload. Events are never mutated
//! after construction; they move between components as `Arc<Event>`.
//!
//! Kinds form a static tree. Handler lookup walks an event's kind path
//! (most-specific ancestor first), so a subscriber registered on a parent
//! kind sees every descendant. The path is computed once per kind and
//! cached.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::AuthRequest;
use crate::engine::SessionId;
use crate::users::User;

/// Highest-precedence priority (dispatched first)
pub const PRI_MIN: u8 = 1;
/// Lowest-precedence priority (dispatched last)
pub const PRI_MAX: u8 = 64;
/// Priority assigned when the producer does not care
pub const PRI_DEFAULT: u8 = 32;

/// Reserved priority used by the queue supervisor to jump the line.
/// Never assigned through the public constructors.
pub(crate) const PRI_URGENT: u8 = 0;

// Dispatch-order tie-break within a priority class. Strictly monotonic, so
// equal-priority events dequeue in construction order.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Generate a fresh event ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in the static event-kind tree.
///
/// Declare kinds as statics so identity comparison is pointer comparison:
///
/// ```
/// use citadel_engine::events::{kinds, EventKind};
///
/// static CHAT: EventKind = EventKind::new("chat", Some(&kinds::EVENT));
/// assert!(CHAT.is_a(&kinds::EVENT));
/// ```
pub struct EventKind {
    name: &'static str,
    parent: Option<&'static EventKind>,
    path_cache: OnceLock<Vec<&'static str>>,
}

impl EventKind {
    /// Declare a kind under an optional parent.
    pub const fn new(name: &'static str, parent: Option<&'static EventKind>) -> Self {
        EventKind {
            name,
            parent,
            path_cache: OnceLock::new(),
        }
    }

    /// Tag identifying this kind
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ancestor tags, most-specific first. Computed on first use, cached.
    pub fn path(&'static self) -> &'static [&'static str] {
        self.path_cache.get_or_init(|| {
            let mut path = vec![self.name];
            let mut cursor = self.parent;
            while let Some(kind) = cursor {
                path.push(kind.name);
                cursor = kind.parent;
            }
            path
        })
    }

    /// Whether `self` is `other` or a descendant of it
    pub fn is_a(&'static self, other: &'static EventKind) -> bool {
        let mut cursor = Some(self);
        while let Some(kind) = cursor {
            if std::ptr::eq(kind, other) {
                return true;
            }
            cursor = kind.parent;
        }
        false
    }
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventKind").field("name", &self.name).finish()
    }
}

/// Built-in event kinds.
pub mod kinds {
    use super::EventKind;

    /// Root of the kind tree
    pub static EVENT: EventKind = EventKind::new("event", None);

    /// Engine housekeeping
    pub static SYSTEM: EventKind = EventKind::new("system", Some(&EVENT));
    /// One simulation tick
    pub static TICK: EventKind = EventKind::new("tick", Some(&SYSTEM));
    /// Engine is leaving the Running state
    pub static ENGINE_SHUTDOWN: EventKind = EventKind::new("engine-shutdown", Some(&SYSTEM));
    /// Queue-internal worker retirement signal
    pub static WORKER_SHUTDOWN: EventKind = EventKind::new("worker-shutdown", Some(&SYSTEM));

    /// Session IO
    pub static IO: EventKind = EventKind::new("io", Some(&EVENT));
    /// Data flowing from a client toward the engine
    pub static INPUT: EventKind = EventKind::new("input", Some(&IO));
    /// Data flowing from the engine toward a client
    pub static OUTPUT: EventKind = EventKind::new("output", Some(&IO));
    /// A listener accepted a connection
    pub static CONNECTION_OPENED: EventKind = EventKind::new("connection-opened", Some(&IO));

    /// Authentication traffic
    pub static AUTH: EventKind = EventKind::new("auth", Some(&EVENT));
    /// Credentials submitted for verification
    pub static AUTH_REQUEST: EventKind = EventKind::new("auth-request", Some(&AUTH));
    /// A session authenticated successfully
    pub static USER_LOGIN: EventKind = EventKind::new("user-login", Some(&AUTH));
    /// A login session ended without authenticating
    pub static LOGIN_FAILURE: EventKind = EventKind::new("login-failure", Some(&AUTH));

    /// Failures surfaced as events
    pub static ERROR: EventKind = EventKind::new("error", Some(&EVENT));
    /// A handler raised while dispatching
    pub static UNTRAPPED_EXCEPTION: EventKind =
        EventKind::new("untrapped-exception", Some(&ERROR));
    /// A handler returned its own event as a consequence
    pub static RECURSION_ERROR: EventKind = EventKind::new("recursion-error", Some(&ERROR));
    /// Input reached the sentinel without being consumed
    pub static UNHANDLED_INPUT: EventKind = EventKind::new("unhandled-input", Some(&ERROR));
    /// Output reached the sentinel without being rendered
    pub static UNHANDLED_OUTPUT: EventKind = EventKind::new("unhandled-output", Some(&ERROR));
    /// No handler registered anywhere along a kind path
    pub static NO_HANDLER: EventKind = EventKind::new("no-handler", Some(&ERROR));
}

/// Kind-specific event payload
pub enum Payload {
    /// Nothing beyond the kind itself
    None,
    /// A chunk or line of text
    Text(String),
    /// A new connection (carried by `connection-opened`)
    Connection {
        /// Session the connection was assigned
        session: SessionId,
        /// Peer address, best effort
        remote_host: String,
    },
    /// Credentials plus the responder the provider must invoke
    Auth(AuthRequest),
    /// A resolved login (carried by `user-login`)
    Login {
        /// The authenticated user record
        user: User,
        /// Session that authenticated
        session: SessionId,
    },
    /// A session-scoped notice (carried by `login-failure` and the
    /// unhandled-IO kinds)
    Session {
        /// Session concerned
        session: SessionId,
        /// Human-readable detail
        detail: String,
    },
    /// A failure description (carried by the error kinds)
    Failure(String),
    /// Open extension point for handler-defined kinds
    Json(serde_json::Value),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::None => write!(f, "None"),
            Payload::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Payload::Connection {
                session,
                remote_host,
            } => f
                .debug_struct("Connection")
                .field("session", session)
                .field("remote_host", remote_host)
                .finish(),
            Payload::Auth(req) => f.debug_tuple("Auth").field(req).finish(),
            Payload::Login { user, session } => f
                .debug_struct("Login")
                .field("user", &user.username)
                .field("session", session)
                .finish(),
            Payload::Session { session, detail } => f
                .debug_struct("Session")
                .field("session", session)
                .field("detail", detail)
                .finish(),
            Payload::Failure(detail) => f.debug_tuple("Failure").field(detail).finish(),
            Payload::Json(value) => f.debug_tuple("Json").field(value).finish(),
        }
    }
}

/// An immutable unit of work.
///
/// Ordering for dispatch is `(priority, seq)`: lower priority value first,
/// construction order within a priority class.
pub struct Event {
    id: EventId,
    kind: &'static EventKind,
    priority: u8,
    seq: u64,
    created_at: DateTime<Utc>,
    payload: Payload,
}

impl Event {
    /// Build an event at the default priority.
    pub fn new(kind: &'static EventKind, payload: Payload) -> Arc<Self> {
        Self::with_priority(kind, PRI_DEFAULT, payload)
    }

    /// Build an event at an explicit priority, clamped to `[PRI_MIN, PRI_MAX]`.
    pub fn with_priority(kind: &'static EventKind, priority: u8, payload: Payload) -> Arc<Self> {
        Arc::new(Event {
            id: EventId::new(),
            kind,
            priority: priority.clamp(PRI_MIN, PRI_MAX),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            created_at: Utc::now(),
            payload,
        })
    }

    // Queue-internal constructor for supervisor signals; the only producer
    // of PRI_URGENT.
    pub(crate) fn urgent(kind: &'static EventKind, payload: Payload) -> Arc<Self> {
        Arc::new(Event {
            id: EventId::new(),
            kind,
            priority: PRI_URGENT,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            created_at: Utc::now(),
            payload,
        })
    }

    /// Identity of this event
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Kind tag
    pub fn kind(&self) -> &'static EventKind {
        self.kind
    }

    /// Dispatch priority; lower value means higher precedence
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Construction-order sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wall-clock creation stamp
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Kind-specific payload
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Whether this event's kind is `kind` or a descendant of it
    pub fn is_a(&self, kind: &'static EventKind) -> bool {
        self.kind.is_a(kind)
    }

    /// Text payload, if the payload carries one
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Dispatch-order key
    pub fn order_key(&self) -> (u8, u64) {
        (self.priority, self.seq)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind.name())
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static CUSTOM: EventKind = EventKind::new("custom", Some(&kinds::INPUT));

    #[test]
    fn kind_path_walks_ancestors_most_specific_first() {
        assert_eq!(CUSTOM.path(), &["custom", "input", "io", "event"]);
        assert_eq!(kinds::EVENT.path(), &["event"]);
    }

    #[test]
    fn kind_is_a_covers_self_and_ancestors() {
        assert!(CUSTOM.is_a(&CUSTOM));
        assert!(CUSTOM.is_a(&kinds::IO));
        assert!(CUSTOM.is_a(&kinds::EVENT));
        assert!(!CUSTOM.is_a(&kinds::OUTPUT));
    }

    #[test]
    fn priority_is_clamped_at_construction() {
        let low = Event::with_priority(&kinds::TICK, 0, Payload::None);
        let high = Event::with_priority(&kinds::TICK, 200, Payload::None);
        assert_eq!(low.priority(), PRI_MIN);
        assert_eq!(high.priority(), PRI_MAX);
    }

    #[test]
    fn seq_orders_equal_priority_events_by_construction() {
        let a = Event::new(&kinds::TICK, Payload::None);
        let b = Event::new(&kinds::TICK, Payload::None);
        assert!(a.order_key() < b.order_key());
    }

    #[test]
    fn lower_priority_value_sorts_first() {
        let earlier = Event::with_priority(&kinds::TICK, 32, Payload::None);
        let later_but_urgent = Event::with_priority(&kinds::TICK, 16, Payload::None);
        assert!(later_but_urgent.order_key() < earlier.order_key());
    }
}

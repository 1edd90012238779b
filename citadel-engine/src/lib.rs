//! Citadel engine core
//!
//! The tiered event-processing machinery of a multi-user server:
//!
//! - [`events`] — immutable prioritized events with a kind hierarchy
//! - [`registry`] — per-kind handler subscriptions with kind-path lookup
//! - [`queue`] — prioritized event queue with a supervised elastic worker pool
//! - [`scheduler`] — absolute-time, tick-offset, and repeating scheduling
//! - [`stream`] — per-session bidirectional filter pipelines and the login
//!   state machine
//! - [`engine`] — the composition root that wires the above together and
//!   advances simulation time
//!
//! External collaborators (authentication, user records, output delivery,
//! logging) are consumed through the traits in [`auth`], [`users`], and
//! [`sinks`]; concrete network listeners and persistent stores live outside
//! this crate.

pub mod auth;
pub mod engine;
pub mod error;
pub mod events;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sinks;
pub mod stream;
pub mod users;

pub use engine::{Engine, EngineConfig, EngineHandle, EngineState, EngineStatus, SessionId};
pub use error::{EngineError, EngineResult};
pub use events::{Event, EventId, EventKind, Payload, PRI_DEFAULT, PRI_MAX, PRI_MIN};
pub use queue::{EventQueue, QueueConfig};
pub use registry::{Handler, HandlerRegistry};
pub use scheduler::Scheduler;
pub use stream::{
    Direction, Filter, FilterId, IoEventStream, LineBufferFilter, LoginConfig, LoginFilter,
    StreamHandle,
};

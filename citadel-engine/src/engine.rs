//! Engine composition root
//!
//! Owns the handler registry, the event queue, the scheduler, and the
//! session table; advances simulation time at a fixed tick; and wires a
//! filter chain onto every new connection. All consequence routing and
//! admission control funnels through here: events are refused whenever
//! the engine is not `Running`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::error::{EngineError, EngineResult};
use crate::events::{kinds, Event, Payload};
use crate::queue::{EventQueue, QueueConfig};
use crate::registry::{Handler, HandlerRegistry};
use crate::scheduler::Scheduler;
use crate::sinks::{LogSink, OutputSink, Severity, TracingLogSink};
use crate::stream::{
    Filter, IoEventStream, LineBufferFilter, LoginConfig, LoginFilter, StreamHandle,
};

/// Unique identifier for a connected session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Created or fully stopped
    Stopped,
    /// Start in progress; events still refused
    Starting,
    /// Accepting and dispatching events
    Running,
    /// Stop in progress; draining
    ShuttingDown,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

/// Engine-level knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between simulation ticks
    pub tick_length: Duration,
    /// Queue sizing and pacing
    pub queue: QueueConfig,
    /// Login conversation knobs
    pub login: LoginConfig,
    /// Bound on the queue drain when stopping
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tick_length: Duration::from_millis(250),
            queue: QueueConfig::default(),
            login: LoginConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time snapshot for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    /// Lifecycle state
    pub state: EngineState,
    /// Current tick count
    pub tick: u64,
    /// Seconds since the engine entered Running, zero when stopped
    pub uptime_secs: u64,
    /// Connected sessions
    pub sessions: usize,
    /// Events waiting in the queue
    pub queue_depth: usize,
    /// Live queue workers
    pub workers: usize,
}

struct SessionEntry {
    stream: IoEventStream,
    handle: StreamHandle,
    username: Option<String>,
}

struct EngineShared {
    config: EngineConfig,
    registry: Arc<HandlerRegistry>,
    queue: EventQueue,
    scheduler: Scheduler,
    sessions: DashMap<SessionId, SessionEntry>,
    state: Mutex<EngineState>,
    tick: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    auth: Arc<dyn AuthProvider>,
    log: Arc<dyn LogSink>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

/// Owning handle to an engine; clone freely.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

/// Non-owning engine reference held by components the engine owns
/// (queue workers, streams, filters). Keeps the ownership graph
/// acyclic; operations on a dropped engine come back `Refused`.
#[derive(Clone)]
pub struct EngineRef {
    shared: Weak<EngineShared>,
}

/// The composition root. Construct with [`Engine::new`], then `start`.
pub struct Engine {
    handle: EngineHandle,
}

impl Engine {
    /// Build a stopped engine with the default tracing-backed log sink.
    pub fn new(config: EngineConfig, auth: Arc<dyn AuthProvider>) -> Self {
        Self::with_log_sink(config, auth, Arc::new(TracingLogSink))
    }

    /// Build a stopped engine with an explicit log sink.
    pub fn with_log_sink(
        config: EngineConfig,
        auth: Arc<dyn AuthProvider>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let queue = EventQueue::new(config.queue.clone(), Arc::clone(&registry));
        let shared = Arc::new(EngineShared {
            config,
            registry,
            queue,
            scheduler: Scheduler::new(),
            sessions: DashMap::new(),
            state: Mutex::new(EngineState::Stopped),
            tick: AtomicU64::new(0),
            started_at: Mutex::new(None),
            auth,
            log,
            tick_task: Mutex::new(None),
        });
        let handle = EngineHandle { shared };
        handle.register_builtin_handlers();
        Engine { handle }
    }

    /// Owning handle for callers.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// See [`EngineHandle::start`].
    pub async fn start(&self) -> EngineResult<()> {
        self.handle.start().await
    }

    /// See [`EngineHandle::stop`].
    pub async fn stop(&self) -> EngineResult<bool> {
        self.handle.stop().await
    }
}

impl EngineHandle {
    /// Weak reference for components the engine owns.
    pub fn downgrade(&self) -> EngineRef {
        EngineRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Handler registry, for subscribing application handlers.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    /// Current tick count
    pub fn tick(&self) -> u64 {
        self.shared.tick.load(Ordering::Relaxed)
    }

    /// Transition Stopped → Starting → Running: start the queue, then
    /// the tick loop.
    pub async fn start(&self) -> EngineResult<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                EngineState::Stopped => *state = EngineState::Starting,
                EngineState::Running | EngineState::Starting => {
                    return Err(EngineError::AlreadyRunning)
                }
                EngineState::ShuttingDown => {
                    return Err(EngineError::refused(EngineState::ShuttingDown))
                }
            }
        }

        self.shared.queue.start(self.downgrade()).await?;
        *self.shared.started_at.lock() = Some(Utc::now());
        *self.shared.state.lock() = EngineState::Running;

        let tick_ref = self.downgrade();
        let tick_length = self.shared.config.tick_length;
        let task = tokio::spawn(async move {
            run_tick_loop(tick_ref, tick_length).await;
        });
        *self.shared.tick_task.lock() = Some(task);

        self.shared.log.log(Severity::Notice, "engine started");
        Ok(())
    }

    /// Transition Running → ShuttingDown → Stopped: announce, shut every
    /// session down, drain the queue. Returns whether the drain was
    /// clean. Stopping a stopped engine is a no-op.
    pub async fn stop(&self) -> EngineResult<bool> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                EngineState::Stopped => return Ok(true),
                EngineState::Starting => {
                    return Err(EngineError::refused(EngineState::Starting))
                }
                EngineState::ShuttingDown => {
                    return Err(EngineError::refused(EngineState::ShuttingDown))
                }
                EngineState::Running => {
                    // Announce while events are still accepted.
                }
            }
        }
        if let Err(err) =
            self.dispatch_events(vec![Event::new(&kinds::ENGINE_SHUTDOWN, Payload::None)])
        {
            tracing::debug!(%err, "shutdown announcement dropped");
        }
        *self.shared.state.lock() = EngineState::ShuttingDown;

        if let Some(task) = self.shared.tick_task.lock().take() {
            task.abort();
        }

        let session_ids: Vec<SessionId> = self
            .shared
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .collect();
        for session in session_ids {
            if let Err(err) = self.detach_session(session).await {
                tracing::warn!(%session, %err, "session teardown failed during stop");
            }
        }

        let clean = self
            .shared
            .queue
            .shutdown(self.shared.config.shutdown_timeout)
            .await?;

        *self.shared.started_at.lock() = None;
        *self.shared.state.lock() = EngineState::Stopped;
        self.shared.log.log(
            Severity::Notice,
            if clean {
                "engine stopped"
            } else {
                "engine stopped; queue drain timed out"
            },
        );
        Ok(clean)
    }

    /// Enqueue events for dispatch. `Refused` unless Running.
    pub fn dispatch_events(&self, events: Vec<Arc<Event>>) -> EngineResult<()> {
        let state = *self.shared.state.lock();
        if state != EngineState::Running {
            return Err(EngineError::refused(state));
        }
        self.shared.queue.enqueue(events)
    }

    /// Schedule events at a wall-clock time; past times dispatch
    /// immediately.
    pub fn schedule_at(&self, at: DateTime<Utc>, events: Vec<Arc<Event>>) -> EngineResult<()> {
        let immediate = self.shared.scheduler.schedule_at(at, events);
        if immediate.is_empty() {
            Ok(())
        } else {
            self.dispatch_events(immediate)
        }
    }

    /// Schedule events by tick offset: zero is immediate, positive is
    /// one-shot, negative repeats every `|n|` ticks.
    pub fn schedule_in_ticks(&self, n: i64, events: Vec<Arc<Event>>) -> EngineResult<()> {
        let immediate = self
            .shared
            .scheduler
            .schedule_in_ticks(self.tick(), n, events);
        if immediate.is_empty() {
            Ok(())
        } else {
            self.dispatch_events(immediate)
        }
    }

    /// Cancel pending scheduled entries by event identity; empty cancels
    /// all. Returns the removed events.
    pub fn cancel(&self, events: &[Arc<Event>]) -> Vec<Arc<Event>> {
        self.shared.scheduler.cancel(events)
    }

    /// Wire a new connection: create its stream, install line assembly
    /// and a login filter, and announce a `connection-opened` event.
    pub async fn attach_session(
        &self,
        sink: Arc<dyn OutputSink>,
        remote_host: &str,
    ) -> EngineResult<(SessionId, StreamHandle)> {
        let state = *self.shared.state.lock();
        if state != EngineState::Running {
            return Err(EngineError::refused(state));
        }

        let session = SessionId::new();
        let stream = IoEventStream::new(session, self.downgrade(), sink);
        let handle = stream.handle();
        handle
            .add_filters(vec![
                LineBufferFilter::new() as Arc<dyn Filter>,
                LoginFilter::new(
                    self.shared.config.login.clone(),
                    Arc::clone(&self.shared.auth),
                    remote_host,
                ) as Arc<dyn Filter>,
            ])
            .await?;

        self.shared.sessions.insert(
            session,
            SessionEntry {
                stream,
                handle: handle.clone(),
                username: None,
            },
        );
        tracing::info!(%session, remote_host, "session attached");

        let opened = Event::new(
            &kinds::CONNECTION_OPENED,
            Payload::Connection {
                session,
                remote_host: remote_host.to_string(),
            },
        );
        if let Err(err) = self.dispatch_events(vec![opened]) {
            tracing::debug!(%err, "connection-opened announcement dropped");
        }
        Ok((session, handle))
    }

    /// Tear a session down and forget it. Returns whether the stream
    /// worker exited cleanly.
    pub async fn detach_session(&self, session: SessionId) -> EngineResult<bool> {
        let Some((_, entry)) = self.shared.sessions.remove(&session) else {
            return Err(EngineError::refused("unknown session"));
        };
        let clean = entry.stream.shutdown().await?;
        tracing::info!(%session, username = entry.username.as_deref(), "session detached");
        Ok(clean)
    }

    /// Stream handle of a connected session
    pub fn session_stream(&self, session: SessionId) -> Option<StreamHandle> {
        self.shared
            .sessions
            .get(&session)
            .map(|entry| entry.handle.clone())
    }

    /// Username a session authenticated as, if it has
    pub fn session_username(&self, session: SessionId) -> Option<String> {
        self.shared
            .sessions
            .get(&session)
            .and_then(|entry| entry.username.clone())
    }

    /// Queue text for delivery to a session's client.
    pub fn send_to_session(&self, session: SessionId, text: &str) -> EngineResult<()> {
        let Some(handle) = self.session_stream(session) else {
            return Err(EngineError::refused("unknown session"));
        };
        handle.inject_output(vec![Event::new(
            &kinds::OUTPUT,
            Payload::Text(text.to_string()),
        )])
    }

    /// Operator snapshot
    pub fn status(&self) -> EngineStatus {
        let uptime_secs = self
            .shared
            .started_at
            .lock()
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(0);
        EngineStatus {
            state: self.state(),
            tick: self.tick(),
            uptime_secs,
            sessions: self.shared.sessions.len(),
            queue_depth: self.shared.queue.depth(),
            workers: self.shared.queue.worker_count(),
        }
    }

    // The handlers the engine itself contributes: error-family logging,
    // quiet system events, auth fan-out, login promotion and teardown.
    fn register_builtin_handlers(&self) {
        let registry = &self.shared.registry;
        registry.register(
            &kinds::ERROR,
            Arc::new(ErrorLogHandler {
                log: Arc::clone(&self.shared.log),
            }) as Arc<dyn Handler>,
        );
        registry.register(&kinds::SYSTEM, Arc::new(SystemEventHandler) as Arc<dyn Handler>);
        registry.register(
            &kinds::CONNECTION_OPENED,
            Arc::new(SystemEventHandler) as Arc<dyn Handler>,
        );
        registry.register(
            &kinds::AUTH_REQUEST,
            Arc::new(AuthRequestHandler {
                auth: Arc::clone(&self.shared.auth),
            }) as Arc<dyn Handler>,
        );
        registry.register(
            &kinds::USER_LOGIN,
            Arc::new(UserLoginHandler {
                engine: self.downgrade(),
            }) as Arc<dyn Handler>,
        );
        registry.register(
            &kinds::LOGIN_FAILURE,
            Arc::new(LoginFailureHandler {
                engine: self.downgrade(),
            }) as Arc<dyn Handler>,
        );
    }

    fn promote_session(&self, session: SessionId, username: &str) {
        if let Some(mut entry) = self.shared.sessions.get_mut(&session) {
            entry.username = Some(username.to_string());
        }
    }
}

impl EngineRef {
    /// A reference bound to no engine; every operation is refused. For
    /// driving queues and streams standalone in tests.
    pub fn detached() -> Self {
        EngineRef { shared: Weak::new() }
    }

    /// Upgrade to an owning handle, if the engine is still alive.
    pub fn upgrade(&self) -> Option<EngineHandle> {
        self.shared
            .upgrade()
            .map(|shared| EngineHandle { shared })
    }

    /// See [`EngineHandle::dispatch_events`].
    pub fn dispatch_events(&self, events: Vec<Arc<Event>>) -> EngineResult<()> {
        match self.upgrade() {
            Some(handle) => handle.dispatch_events(events),
            None => Err(EngineError::refused("detached engine")),
        }
    }

    /// See [`EngineHandle::schedule_at`].
    pub fn schedule_at(&self, at: DateTime<Utc>, events: Vec<Arc<Event>>) -> EngineResult<()> {
        match self.upgrade() {
            Some(handle) => handle.schedule_at(at, events),
            None => Err(EngineError::refused("detached engine")),
        }
    }

    /// See [`EngineHandle::cancel`]. Detached references have nothing to
    /// cancel.
    pub fn cancel(&self, events: &[Arc<Event>]) -> Vec<Arc<Event>> {
        match self.upgrade() {
            Some(handle) => handle.cancel(events),
            None => Vec::new(),
        }
    }

    /// See [`EngineHandle::session_stream`].
    pub fn session_stream(&self, session: SessionId) -> Option<StreamHandle> {
        self.upgrade()
            .and_then(|handle| handle.session_stream(session))
    }
}

async fn run_tick_loop(engine: EngineRef, tick_length: Duration) {
    let mut interval = tokio::time::interval(tick_length);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; skip it so tick 1 lands
    // one tick_length after start.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(handle) = engine.upgrade() else {
            break;
        };
        if handle.state() != EngineState::Running {
            break;
        }

        let tick = handle.shared.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let due = handle.shared.scheduler.drain_due(tick, Utc::now());
        if !due.is_empty() {
            if let Err(err) = handle.dispatch_events(due) {
                tracing::debug!(%err, "scheduled events dropped");
            }
        }
        if let Err(err) = handle.dispatch_events(vec![Event::new(&kinds::TICK, Payload::None)]) {
            tracing::debug!(%err, "tick event dropped");
            break;
        }
    }
}

struct ErrorLogHandler {
    log: Arc<dyn LogSink>,
}

#[async_trait]
impl Handler for ErrorLogHandler {
    async fn handle(&self, event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>> {
        let severity = if event.is_a(&kinds::UNTRAPPED_EXCEPTION) {
            Severity::Error
        } else if event.is_a(&kinds::RECURSION_ERROR) {
            Severity::Warn
        } else {
            Severity::Notice
        };
        let detail = match event.payload() {
            Payload::Failure(detail) => detail.clone(),
            Payload::Session { session, detail } => format!("session {session}: {detail}"),
            other => format!("{other:?}"),
        };
        self.log
            .log(severity, &format!("{}: {detail}", event.kind().name()));
        Ok(Vec::new())
    }
}

struct SystemEventHandler;

#[async_trait]
impl Handler for SystemEventHandler {
    async fn handle(&self, event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>> {
        tracing::trace!(kind = event.kind().name(), "system event");
        Ok(Vec::new())
    }
}

struct AuthRequestHandler {
    auth: Arc<dyn AuthProvider>,
}

#[async_trait]
impl Handler for AuthRequestHandler {
    async fn handle(&self, event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>> {
        if let Payload::Auth(request) = event.payload() {
            self.auth.authenticate(request).await;
        }
        Ok(Vec::new())
    }
}

struct UserLoginHandler {
    engine: EngineRef,
}

#[async_trait]
impl Handler for UserLoginHandler {
    async fn handle(&self, event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>> {
        let Payload::Login { user, session } = event.payload() else {
            return Ok(Vec::new());
        };
        let Some(handle) = self.engine.upgrade() else {
            return Ok(Vec::new());
        };
        handle.promote_session(*session, &user.username);
        if let Some(stream) = handle.session_stream(*session) {
            if let Err(err) = stream.inject_output(vec![Event::new(
                &kinds::OUTPUT,
                Payload::Text(format!("Welcome, {}.\n", user.username)),
            )]) {
                tracing::debug!(%err, "welcome message dropped");
            }
            // The login filter paused the stream before removing itself.
            stream.unpause();
        }
        tracing::info!(session = %session, username = %user.username, "user logged in");
        Ok(Vec::new())
    }
}

struct LoginFailureHandler {
    engine: EngineRef,
}

#[async_trait]
impl Handler for LoginFailureHandler {
    async fn handle(&self, event: Arc<Event>) -> EngineResult<Vec<Arc<Event>>> {
        let Payload::Session { session, detail } = event.payload() else {
            return Ok(Vec::new());
        };
        let Some(handle) = self.engine.upgrade() else {
            return Ok(Vec::new());
        };
        if handle.session_stream(*session).is_none() {
            // Already detached; the timeout raced a success or teardown.
            return Ok(Vec::new());
        }
        tracing::info!(session = %session, %detail, "login session failed");
        if let Err(err) = handle.send_to_session(*session, "Login failed.\n") {
            tracing::debug!(%err, "login failure notice dropped");
        }
        // The stream worker drains pending output once more on its way
        // out, so the notice still reaches the sink.
        if let Err(err) = handle.detach_session(*session).await {
            tracing::debug!(%err, "session already gone");
        }
        Ok(Vec::new())
    }
}

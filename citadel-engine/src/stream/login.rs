//! Login state machine
//!
//! A filter that intercepts all input and suppresses all output until the
//! session authenticates or runs out of attempts. Collects a username and
//! password, synthesizes an `auth-request` event, and waits for the
//! provider's answer; further input is held until then. On success the
//! filter pauses the stream, removes itself, reinjects the held input,
//! and announces a `user-login`. A scheduler-backed timeout bounds the
//! whole conversation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::auth::{AuthOutcome, AuthProvider, AuthRequest, AuthResponder};
use crate::events::{kinds, Event, Payload};
use crate::users::User;

use super::{DeferredQueues, Direction, Filter, FilterId, StreamHandle};

/// Knobs for the login conversation
#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// Failed attempts allowed before the session is terminated
    pub max_tries: u32,
    /// Wall-clock bound on the whole conversation
    pub timeout: Duration,
    /// Greeting sent when the filter attaches
    pub banner: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        LoginConfig {
            max_tries: 3,
            timeout: Duration::from_secs(60),
            banner: "Connected to Citadel.\n".to_string(),
        }
    }
}

enum Phase {
    AwaitingUsername,
    AwaitingPassword {
        username: String,
    },
    AwaitingAuthResponse {
        /// Input arriving while the provider decides
        held: Vec<Arc<Event>>,
    },
    Done,
}

struct LoginState {
    phase: Phase,
    attempts: u32,
    /// The scheduled timeout event, kept for cancel-on-success
    timeout_event: Option<Arc<Event>>,
}

/// Authentication filter; see the module docs.
pub struct LoginFilter {
    id: FilterId,
    weak: Weak<LoginFilter>,
    config: LoginConfig,
    auth: Arc<dyn AuthProvider>,
    remote_host: String,
    queues: DeferredQueues,
    state: Mutex<LoginState>,
    finished: AtomicBool,
}

impl LoginFilter {
    /// Placement between line assembly and whatever the session becomes
    /// after login.
    pub const SORT_KEY: u16 = 600;

    /// Build the filter; it arms itself when attached to a stream.
    pub fn new(
        config: LoginConfig,
        auth: Arc<dyn AuthProvider>,
        remote_host: impl Into<String>,
    ) -> Arc<Self> {
        let remote_host = remote_host.into();
        Arc::new_cyclic(|weak| LoginFilter {
            id: FilterId::next(),
            weak: weak.clone(),
            config,
            auth,
            remote_host,
            queues: DeferredQueues::new(),
            state: Mutex::new(LoginState {
                phase: Phase::AwaitingUsername,
                attempts: 0,
                timeout_event: None,
            }),
            finished: AtomicBool::new(false),
        })
    }

    fn prompt(&self, stream: &StreamHandle, text: &str) {
        self.queues
            .queue_output(Event::new(&kinds::OUTPUT, Payload::Text(text.to_string())));
        stream.notify_from(self.id, Direction::Output);
    }

    // One line through the state machine.
    async fn take_line(&self, stream: &StreamHandle, event: Arc<Event>) {
        let Some(line) = event.text().map(str::trim).map(str::to_string) else {
            tracing::debug!(session = %stream.session(), "textless input during login discarded");
            return;
        };

        let next = {
            let mut state = self.state.lock();
            let (phase, step) = match std::mem::replace(&mut state.phase, Phase::Done) {
                Phase::AwaitingUsername => {
                    if is_valid_username(&line) {
                        (
                            Phase::AwaitingPassword { username: line },
                            Step::PromptPassword,
                        )
                    } else {
                        (Phase::AwaitingUsername, Step::Failed("illegal username"))
                    }
                }
                Phase::AwaitingPassword { username } => {
                    if is_printable(&line) {
                        (
                            Phase::AwaitingAuthResponse { held: Vec::new() },
                            Step::Authenticate {
                                username,
                                password: line,
                            },
                        )
                    } else {
                        (Phase::AwaitingUsername, Step::Failed("unprintable password"))
                    }
                }
                Phase::AwaitingAuthResponse { mut held } => {
                    held.push(event);
                    (Phase::AwaitingAuthResponse { held }, Step::Hold)
                }
                Phase::Done => (Phase::Done, Step::Hold),
            };
            state.phase = phase;
            step
        };

        match next {
            Step::PromptPassword => self.prompt(stream, "Password: "),
            Step::Failed(why) => self.failed_attempt(stream, why).await,
            Step::Authenticate { username, password } => {
                self.request_auth(stream, username, password).await;
            }
            Step::Hold => {}
        }
    }

    async fn request_auth(&self, stream: &StreamHandle, username: String, password: String) {
        let (responder, outcome_rx) = AuthResponder::channel();
        let request = Event::new(
            &kinds::AUTH_REQUEST,
            Payload::Auth(AuthRequest {
                username,
                password,
                remote_host: self.remote_host.clone(),
                responder,
            }),
        );

        if let Err(err) = stream.engine().dispatch_events(vec![Arc::clone(&request)]) {
            tracing::warn!(session = %stream.session(), %err, "auth request refused");
            self.failed_attempt(stream, "engine refused the request").await;
            return;
        }

        let this = self.weak.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            let Some(filter) = this.upgrade() else {
                return;
            };
            match outcome_rx.await {
                Ok(AuthOutcome::Success(user)) => filter.on_success(&stream, user).await,
                Ok(AuthOutcome::Failure(reason)) => {
                    filter.on_failure(&stream, &reason).await;
                }
                Err(_) => {
                    filter.on_failure(&stream, "auth provider went away").await;
                }
            }
        });
    }

    async fn on_success(&self, stream: &StreamHandle, user: User) {
        let (held, timeout_event) = {
            let mut state = self.state.lock();
            let held = match &mut state.phase {
                Phase::AwaitingAuthResponse { held } => std::mem::take(held),
                _ => Vec::new(),
            };
            state.phase = Phase::Done;
            (held, state.timeout_event.take())
        };

        if let Some(event) = timeout_event {
            stream.engine().cancel(&[event]);
        }

        tracing::info!(
            session = %stream.session(),
            username = %user.username,
            "authentication succeeded"
        );

        stream.pause();
        let leftovers = stream.remove_filters(&[self.id]).await;
        if !leftovers.is_empty() {
            tracing::debug!(count = leftovers.len(), "deferred login events dropped");
        }
        if !held.is_empty() {
            if let Err(err) = stream.inject_input(held) {
                tracing::debug!(%err, "held input dropped");
            }
        }

        let login = Event::new(
            &kinds::USER_LOGIN,
            Payload::Login {
                user,
                session: stream.session(),
            },
        );
        if let Err(err) = stream.engine().dispatch_events(vec![login]) {
            tracing::warn!(%err, "user-login event refused");
        }
    }

    async fn on_failure(&self, stream: &StreamHandle, reason: &str) {
        {
            let mut state = self.state.lock();
            if let Phase::AwaitingAuthResponse { held } = &mut state.phase {
                // Anything typed while the provider decided becomes the
                // next conversation's input.
                for event in std::mem::take(held) {
                    self.queues.queue_input(event);
                }
            }
            state.phase = Phase::AwaitingUsername;
        }
        self.failed_attempt(stream, reason).await;
    }

    async fn failed_attempt(&self, stream: &StreamHandle, reason: &str) {
        let attempts = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.attempts
        };
        tracing::info!(
            session = %stream.session(),
            attempts,
            reason,
            "authentication failure"
        );

        if self.config.max_tries > 0 && attempts >= self.config.max_tries {
            self.prompt(stream, "Too many login attempts.\n");
            self.finished.store(true, Ordering::Release);
            let failure = Event::new(
                &kinds::LOGIN_FAILURE,
                Payload::Session {
                    session: stream.session(),
                    detail: "too many login attempts".to_string(),
                },
            );
            if let Err(err) = stream.engine().dispatch_events(vec![failure]) {
                tracing::debug!(%err, "login-failure event dropped");
            }
            stream.notify_from(self.id, Direction::Input);
        } else {
            self.prompt(stream, "Authentication failure.\nlogin: ");
            stream.notify_from(self.id, Direction::Input);
        }
    }
}

enum Step {
    PromptPassword,
    Failed(&'static str),
    Authenticate { username: String, password: String },
    Hold,
}

#[async_trait]
impl Filter for LoginFilter {
    fn id(&self) -> FilterId {
        self.id
    }

    fn sort_key(&self) -> u16 {
        Self::SORT_KEY
    }

    async fn start(&self, stream: &StreamHandle) {
        self.queues.queue_output(Event::new(
            &kinds::OUTPUT,
            Payload::Text(self.config.banner.clone()),
        ));
        self.prompt(stream, "login: ");

        // Bound the whole conversation; cancelled on success.
        let timeout_event = Event::new(
            &kinds::LOGIN_FAILURE,
            Payload::Session {
                session: stream.session(),
                detail: "login timed out".to_string(),
            },
        );
        self.state.lock().timeout_event = Some(Arc::clone(&timeout_event));
        let due = Utc::now()
            + chrono::Duration::from_std(self.config.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        stream.engine().schedule_at(due, vec![timeout_event]);
    }

    async fn stop(&self, stream: &StreamHandle) {
        self.finished.store(true, Ordering::Release);
        let timeout_event = self.state.lock().timeout_event.take();
        if let Some(event) = timeout_event {
            stream.engine().cancel(&[event]);
        }
    }

    fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    async fn handle_input(
        &self,
        stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        if matches!(self.state.lock().phase, Phase::Done) {
            return Some(events);
        }
        for event in events {
            self.take_line(stream, event).await;
        }
        Some(Vec::new())
    }

    async fn handle_output(
        &self,
        _stream: &StreamHandle,
        events: Vec<Arc<Event>>,
    ) -> Option<Vec<Arc<Event>>> {
        if matches!(self.state.lock().phase, Phase::Done) {
            return Some(events);
        }
        // Nothing from above reaches the client before authentication;
        // this filter's own prompts enter the chain below it.
        if !events.is_empty() {
            tracing::debug!(count = events.len(), "output suppressed during login");
        }
        Some(Vec::new())
    }

    fn queued_input(&self) -> Vec<Arc<Event>> {
        self.queues.drain_input()
    }

    fn queued_output(&self) -> Vec<Arc<Event>> {
        self.queues.drain_output()
    }
}

fn is_valid_username(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && candidate.len() >= 2
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_printable(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.chars().all(|c| !c.is_control())
}

//! Authentication seam
//!
//! The login filter synthesizes an `auth-request` event whose payload
//! carries credentials and an [`AuthResponder`]. The provider behind
//! [`AuthProvider`] must resolve the responder exactly once, with either a
//! user record or a failure reason; the responder enforces the
//! exactly-once contract, and a dropped responder counts as a failure on
//! the waiting side.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::users::{User, UserStore};

/// Resolution of an authentication request
#[derive(Debug)]
pub enum AuthOutcome {
    /// Credentials verified; the resolved record
    Success(User),
    /// Credentials rejected; operator-facing reason
    Failure(String),
}

/// Write-once reply slot for an authentication request.
pub struct AuthResponder {
    slot: Mutex<Option<oneshot::Sender<AuthOutcome>>>,
}

impl AuthResponder {
    /// Build a responder and the receiver the requester waits on.
    pub fn channel() -> (Self, oneshot::Receiver<AuthOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            AuthResponder {
                slot: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Resolve with a verified user. Later resolutions are ignored with a
    /// warning.
    pub fn succeed(&self, user: User) {
        self.resolve(AuthOutcome::Success(user));
    }

    /// Resolve with a failure reason. Later resolutions are ignored with a
    /// warning.
    pub fn fail(&self, reason: impl Into<String>) {
        self.resolve(AuthOutcome::Failure(reason.into()));
    }

    fn resolve(&self, outcome: AuthOutcome) {
        match self.slot.lock().take() {
            Some(tx) => {
                // Receiver gone means the login session died first; nothing
                // left to notify.
                let _ = tx.send(outcome);
            }
            None => {
                tracing::warn!("auth responder resolved more than once; ignoring");
            }
        }
    }
}

/// Credentials plus the responder the provider must invoke
pub struct AuthRequest {
    /// Candidate login name (already sanitized)
    pub username: String,
    /// Candidate password (already sanitized)
    pub password: String,
    /// Peer address of the session asking
    pub remote_host: String,
    /// Reply slot; resolve exactly once
    pub responder: AuthResponder,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("username", &self.username)
            .field("remote_host", &self.remote_host)
            .finish_non_exhaustive()
    }
}

/// Verifies credentials. May resolve the responder from any task.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Verify the request and resolve its responder exactly once.
    async fn authenticate(&self, request: &AuthRequest);
}

/// Provider that checks credentials against a [`UserStore`].
pub struct StoreAuthProvider {
    users: Arc<dyn UserStore>,
}

impl StoreAuthProvider {
    /// Provider backed by the given store.
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        StoreAuthProvider { users }
    }
}

#[async_trait]
impl AuthProvider for StoreAuthProvider {
    async fn authenticate(&self, request: &AuthRequest) {
        match self.users.fetch_user(&request.username).await {
            Ok(mut user) if user.secret == request.password => {
                user.last_login = Some(Utc::now());
                if let Err(err) = self.users.store_user(user.clone()).await {
                    tracing::warn!(username = %user.username, %err, "failed to stamp last_login");
                }
                request.responder.succeed(user);
            }
            Ok(_) => {
                tracing::info!(
                    username = %request.username,
                    remote_host = %request.remote_host,
                    "password mismatch"
                );
                request.responder.fail("bad password");
            }
            Err(err) => {
                tracing::info!(
                    username = %request.username,
                    remote_host = %request.remote_host,
                    %err,
                    "unknown user"
                );
                request.responder.fail("unknown user");
            }
        }
    }
}

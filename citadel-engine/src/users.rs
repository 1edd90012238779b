//! User records and the user store seam
//!
//! The persistent object store is an external collaborator; the engine only
//! consumes the [`UserStore`] trait. [`MemoryUserStore`] ships for tests and
//! the demo binary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// A user record.
///
/// The `secret` field holds whatever the backing store keeps for password
/// verification; hashing discipline belongs to the store, not the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Login name, unique within a store
    pub username: String,
    /// Verification secret as stored
    pub secret: String,
    /// Record creation stamp
    pub created_at: DateTime<Utc>,
    /// Most recent successful login, if any
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    /// Build a fresh record with no login history.
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        User {
            username: username.into(),
            secret: secret.into(),
            created_at: Utc::now(),
            last_login: None,
        }
    }
}

/// Store of user records, keyed by username.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fetch a record by name; `NoSuchUser` if absent.
    async fn fetch_user(&self, name: &str) -> EngineResult<User>;

    /// Persist a record, replacing any record under the same name.
    async fn store_user(&self, user: User) -> EngineResult<()>;

    /// Create an empty-secret record; `Conflict` if the name is taken.
    async fn create_user(&self, name: &str) -> EngineResult<User>;

    /// Delete a record by name; `NoSuchUser` if absent.
    async fn delete_user(&self, name: &str) -> EngineResult<()>;

    /// All known usernames, unordered.
    async fn list_usernames(&self) -> EngineResult<Vec<String>>;
}

/// In-memory user store.
#[derive(Default)]
pub struct MemoryUserStore {
    records: RwLock<HashMap<String, User>>,
}

impl MemoryUserStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with the given records.
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Arc<Self> {
        let store = MemoryUserStore::new();
        {
            let mut records = store.records.write();
            for user in users {
                records.insert(user.username.clone(), user);
            }
        }
        Arc::new(store)
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn fetch_user(&self, name: &str) -> EngineResult<User> {
        self.records
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchUser(name.to_string()))
    }

    async fn store_user(&self, user: User) -> EngineResult<()> {
        self.records.write().insert(user.username.clone(), user);
        Ok(())
    }

    async fn create_user(&self, name: &str) -> EngineResult<User> {
        let mut records = self.records.write();
        if records.contains_key(name) {
            return Err(EngineError::Conflict(name.to_string()));
        }
        let user = User::new(name, "");
        records.insert(name.to_string(), user.clone());
        Ok(user)
    }

    async fn delete_user(&self, name: &str) -> EngineResult<()> {
        self.records
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NoSuchUser(name.to_string()))
    }

    async fn list_usernames(&self) -> EngineResult<Vec<String>> {
        Ok(self.records.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_fetch_round_trips() {
        let store = MemoryUserStore::new();
        store.create_user("ged").await.unwrap();
        let user = store.fetch_user("ged").await.unwrap();
        assert_eq!(user.username, "ged");
        assert!(user.last_login.is_none());
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let store = MemoryUserStore::new();
        store.create_user("ged").await.unwrap();
        assert!(matches!(
            store.create_user("ged").await,
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn fetch_missing_is_no_such_user() {
        let store = MemoryUserStore::new();
        assert!(matches!(
            store.fetch_user("nobody").await,
            Err(EngineError::NoSuchUser(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let store = MemoryUserStore::new();
        store.create_user("ged").await.unwrap();
        store.delete_user("ged").await.unwrap();
        assert!(store.list_usernames().await.unwrap().is_empty());
    }
}

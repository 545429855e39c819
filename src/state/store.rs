//! State store trait definition.
//!
//! This module defines the common interface for snapshot storage backends.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::lock::LockInfo;
use super::types::StateSnapshot;
use crate::error::{Result, StateError};

/// Trait for snapshot storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the snapshot.
    ///
    /// Returns `None` if nothing has been recorded yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Saves the snapshot, replacing the previous one.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    /// Deletes the snapshot.
    async fn delete(&self) -> Result<()>;

    /// Checks if a snapshot exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the snapshot.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on the snapshot.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the snapshot is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        (**self).load().await
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        (**self).save(snapshot).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Parses a stored JSON document; `what` names it in the error.
pub(super) fn decode<T: DeserializeOwned>(content: &str, what: &str) -> Result<T> {
    serde_json::from_str(content)
        .map_err(|e| StateError::corrupted(format!("Failed to parse {what}: {e}")).into())
}

/// Renders a document for storage; `what` names it in the error.
pub(super) fn encode<T: Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StateError::serialization(format!("Failed to serialize {what}: {e}")).into())
}

//! State management.
//!
//! This module persists the snapshot of managed resources between runs,
//! guards it with a lock, and records changes incrementally while a run
//! is in progress.

mod journal;
mod local;
mod lock;
mod s3;
mod store;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

pub use journal::SnapshotJournal;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    PendingDelete, ResourceState, RunHistoryEntry, RunOperation, StateSnapshot, STATE_VERSION,
};

use crate::config::{StateBackend, StateConfig};
use crate::error::{ConfigError, Result};

/// Opens the store configured for a project environment.
///
/// # Errors
///
/// Returns an error if the S3 backend has no bucket or the local directory
/// cannot be determined.
pub async fn open_store(
    config: &StateConfig,
    project: &str,
    environment: &str,
) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackend::Local => {
            let base_dir = match &config.path {
                Some(path) => PathBuf::from(path),
                None => std::env::current_dir()?.join(STATE_DIR),
            };
            Ok(Arc::new(LocalStateStore::for_stack(base_dir, project, environment)))
        }
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 backend requires a bucket", "state.bucket")
            })?;
            let store =
                S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref())
                    .await?
                    .for_stack(project, environment);
            Ok(Arc::new(store))
        }
    }
}

//! Local file-based state storage backend.
//!
//! Snapshots are written to a temporary file and renamed into place, so a
//! crash mid-write leaves the previous snapshot intact.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{InfraError, Result, StateError};

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::{decode, encode, StateStore};
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".infragraph";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Create attempts before giving up on a lock that keeps reappearing.
const LOCK_ATTEMPTS: usize = 3;

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store under `.infragraph` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| InfraError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a store keeping one snapshot per project environment in
    /// `base_dir`.
    #[must_use]
    pub fn for_stack(base_dir: impl Into<PathBuf>, project: &str, environment: &str) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(format!("{project}.{environment}.json"));
        let lock_path = base_dir.join(format!("{project}.{environment}.lock"));

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = state_path.with_extension("lock");

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::write(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a temporary file.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let failed = |step: &str, e: std::io::Error| {
            StateError::write(format!("Failed to {step} {}: {e}", temp_path.display()))
        };

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| failed("create", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| failed("write", e))?;
        file.sync_all().await.map_err(|e| failed("sync", e))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| failed("rename", e))?;
        Ok(())
    }

    /// Creates the lock file with `content`, failing with `AlreadyExists`
    /// if another run created it first.
    async fn create_lock_file(&self, content: &str) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;
        let written = match file.write_all(content.as_bytes()).await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = fs::remove_file(&self.lock_path).await;
        }
        written
    }

    /// Reads the current lock. A lock file still being written by another
    /// run reads as a transient lock failure.
    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        Self::read_json(&self.lock_path).await.map_err(|e| {
            StateError::LockFailed {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Reads and parses `path`; `None` when it does not exist.
    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => decode(&content, &path.display().to_string()).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(StateError::corrupted(format!("Failed to read {}: {e}", path.display())).into())
            }
        }
    }

    /// Removes `path` if present.
    async fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(StateError::write(format!("Failed to delete {}: {e}", path.display())).into())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let snapshot: Option<StateSnapshot> = Self::read_json(&self.state_path).await?;
        match &snapshot {
            Some(s) => info!("Loaded state serial {} from {}", s.serial, self.state_path.display()),
            None => debug!("No state at {}", self.state_path.display()),
        }
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        debug!(
            "Saving state serial {} to: {}",
            snapshot.serial,
            self.state_path.display()
        );
        self.write_atomic(&self.state_path, &encode(snapshot, "state")?).await
    }

    async fn delete(&self) -> Result<()> {
        info!("Deleting state file: {}", self.state_path.display());
        Self::remove(&self.state_path).await?;
        Self::remove(&self.lock_path).await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await?)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;
        let lock = LockInfo::new(holder);
        let content = encode(&lock, "lock")?;

        for _ in 0..LOCK_ATTEMPTS {
            match self.create_lock_file(&content).await {
                Ok(()) => {
                    info!(
                        "Acquired state lock {} (expires in {}s)",
                        lock.lock_id, LOCK_EXPIRY_SECS
                    );
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(StateError::LockFailed {
                        message: format!("Failed to create {}: {e}", self.lock_path.display()),
                    }
                    .into());
                }
            }

            if let Some(stale) = self.read_lock().await? {
                stale.ensure_expired()?;
                // Only drop the lock we judged stale, not a newer one.
                if self
                    .read_lock()
                    .await?
                    .is_some_and(|current| current.lock_id == stale.lock_id)
                {
                    Self::remove(&self.lock_path).await?;
                }
            }
        }

        Err(StateError::LockFailed {
            message: format!("{} kept changing while acquiring", self.lock_path.display()),
        }
        .into())
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match Self::read_json::<LockInfo>(&self.lock_path).await? {
            Some(current) if current.lock_id == lock_id => {
                Self::remove(&self.lock_path).await?;
                info!("Released state lock {lock_id}");
            }
            Some(current) => debug!("Not releasing lock {}, we hold {lock_id}", current.lock_id),
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Self::read_json(&self.lock_path).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

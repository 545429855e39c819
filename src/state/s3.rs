//! S3-based state storage backend.
//!
//! Snapshots and locks are kept as JSON objects under a key prefix, so a
//! team can share one state across machines.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::lock::LockInfo;
use super::store::{decode, encode, StateStore};
use super::types::StateSnapshot;

/// Object holding the snapshot, relative to the prefix.
const STATE_KEY: &str = "state.json";

/// Object holding the lock, relative to the prefix.
const LOCK_KEY: &str = "state.lock";

/// Create attempts before giving up on a lock that keeps reappearing.
const LOCK_ATTEMPTS: usize = 3;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    /// Empty, or ends in `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a store from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let loader = aws_config::from_env();
        let loader = match region {
            Some(region) => loader.region(aws_config::Region::new(region.to_string())),
            None => loader,
        };
        let config = loader.load().await;

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a store over an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix.unwrap_or_default()),
        }
    }

    /// Narrows the prefix to one project environment.
    #[must_use]
    pub fn for_stack(mut self, project: &str, environment: &str) -> Self {
        self.prefix = normalize_prefix(&format!("{}{project}/{environment}", self.prefix));
        self
    }

    /// The key prefix, ending in `/` unless empty.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    fn location(&self, file: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.key(file))
    }

    /// Fetches an object's text and entity tag; `None` when the key does
    /// not exist.
    async fn read_object(&self, file: &str) -> Result<Option<(String, Option<String>)>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(file))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err = err.into_service_error();
                if err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(StateError::s3(format!("GET {}: {err}", self.location(file))).into());
            }
        };

        let e_tag = response.e_tag().map(ToString::to_string);
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StateError::s3(format!("Reading {}: {e}", self.location(file))))?
            .into_bytes();
        let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
            StateError::corrupted(format!("{} is not UTF-8: {e}", self.location(file)))
        })?;

        Ok(Some((content, e_tag)))
    }

    /// Fetches and parses an object; `None` when the key does not exist.
    async fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        match self.read_object(file).await? {
            Some((content, _)) => decode(&content, file).map(Some),
            None => Ok(None),
        }
    }

    /// Writes an object only if the key is absent. Returns false when
    /// another writer got there first.
    async fn create_json<T: Serialize>(&self, file: &str, value: &T) -> Result<bool> {
        let body = encode(value, file)?;
        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(file))
            .if_none_match("*")
            .content_type("application/json")
            .body(ByteStream::from(body.into_bytes()))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_conflict(err.raw_response().map(|r| r.status().as_u16())) => Ok(false),
            Err(err) => Err(StateError::s3(format!("PUT {}: {err}", self.location(file))).into()),
        }
    }

    /// Deletes an object if it still has entity tag `e_tag`.
    async fn remove_if_unchanged(&self, file: &str, e_tag: Option<&str>) -> Result<()> {
        let mut request = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(file));
        if let Some(e_tag) = e_tag {
            request = request.if_match(e_tag);
        }
        match request.send().await {
            Ok(_) => Ok(()),
            Err(err) if is_conflict(err.raw_response().map(|r| r.status().as_u16())) => {
                debug!("{} changed before removal", self.location(file));
                Ok(())
            }
            Err(err) => {
                Err(StateError::s3(format!("DELETE {}: {err}", self.location(file))).into())
            }
        }
    }

    async fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let body = encode(value, file)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(file))
            .content_type("application/json")
            .body(ByteStream::from(body.into_bytes()))
            .send()
            .await
            .map_err(|e| StateError::s3(format!("PUT {}: {e}", self.location(file))))?;
        Ok(())
    }

    async fn remove(&self, file: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(file))
            .send()
            .await
            .map_err(|e| StateError::s3(format!("DELETE {}: {e}", self.location(file))))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        debug!("Loading state from {}", self.location(STATE_KEY));
        let snapshot: Option<StateSnapshot> = self.read_json(STATE_KEY).await?;
        if let Some(snapshot) = &snapshot {
            info!(
                "Loaded state for {}/{} (serial {})",
                snapshot.project, snapshot.environment, snapshot.serial
            );
        }
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        debug!("Saving state serial {} to {}", snapshot.serial, self.location(STATE_KEY));
        self.write_json(STATE_KEY, snapshot).await
    }

    async fn delete(&self) -> Result<()> {
        info!("Deleting state at {}", self.location(STATE_KEY));
        self.remove(STATE_KEY).await?;
        self.remove(LOCK_KEY).await
    }

    async fn exists(&self) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("HEAD {}: {err}", self.location(STATE_KEY))).into())
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock = LockInfo::new(holder);

        for _ in 0..LOCK_ATTEMPTS {
            if self.create_json(LOCK_KEY, &lock).await? {
                info!("Acquired state lock {} for {}", lock.lock_id, lock.holder);
                return Ok(lock);
            }
            if let Some((content, e_tag)) = self.read_object(LOCK_KEY).await? {
                let stale: LockInfo = decode(&content, LOCK_KEY)?;
                stale.ensure_expired()?;
                self.remove_if_unchanged(LOCK_KEY, e_tag.as_deref()).await?;
            }
        }

        Err(StateError::LockFailed {
            message: format!("{} kept changing while acquiring", self.location(LOCK_KEY)),
        }
        .into())
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_json::<LockInfo>(LOCK_KEY).await? {
            Some(current) if current.lock_id == lock_id => {
                self.remove(LOCK_KEY).await?;
                info!("Released state lock {lock_id}");
            }
            Some(current) => debug!("Not releasing lock {}, we hold {lock_id}", current.lock_id),
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_json(LOCK_KEY).await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

/// Whether a failed conditional request lost to another writer.
fn is_conflict(status: Option<u16>) -> bool {
    matches!(status, Some(409 | 412))
}

/// Normalizes a key prefix to end in exactly one `/`.
fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}/")
    }
}

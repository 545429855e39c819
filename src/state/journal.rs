//! Incremental snapshot writes.
//!
//! During a run every completed provider operation is recorded through a
//! [`SnapshotJournal`]. The journal owns the in-memory snapshot and persists
//! it after each mutation, so an interrupted run leaves a snapshot that
//! reflects every operation that finished. Mutations are serialized by a
//! single lock; concurrent steps never write the store at the same time.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::store::StateStore;
use super::types::{PendingDelete, ResourceState, RunHistoryEntry, StateSnapshot};
use crate::error::Result;

/// Single writer of a snapshot during a run.
pub struct SnapshotJournal {
    /// Where snapshots are persisted.
    store: Arc<dyn StateStore>,
    /// The current snapshot.
    snapshot: Mutex<StateSnapshot>,
}

impl SnapshotJournal {
    /// Creates a journal over `snapshot`, persisting to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, snapshot: StateSnapshot) -> Self {
        Self {
            store,
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Returns a copy of the current snapshot.
    pub async fn snapshot(&self) -> StateSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Returns the recorded state of a resource.
    pub async fn get(&self, name: &str) -> Option<ResourceState> {
        self.snapshot.lock().await.get_resource(name).cloned()
    }

    /// Superseded instances of `name` still waiting for deletion.
    pub async fn pending(&self, name: &str) -> Vec<PendingDelete> {
        self.snapshot
            .lock()
            .await
            .pending_deletes
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect()
    }

    /// Current serial number.
    pub async fn serial(&self) -> u64 {
        self.snapshot.lock().await.serial
    }

    /// Records a created or updated resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn record(&self, resource: ResourceState) -> Result<()> {
        let name = resource.name.clone();
        self.write(&format!("record {name}"), move |snapshot| snapshot.set_resource(resource))
            .await
    }

    /// Records a replacement: the new instance becomes current and the old
    /// one is kept as a pending delete until [`Self::finish_delete`].
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn record_replacement(
        &self,
        resource: ResourceState,
        old: PendingDelete,
    ) -> Result<()> {
        let name = resource.name.clone();
        self.write(&format!("replace {name}"), move |snapshot| {
            snapshot.add_pending_delete(old);
            snapshot.set_resource(resource);
        })
        .await
    }

    /// Removes a deleted resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn forget(&self, name: &str) -> Result<Option<ResourceState>> {
        self.write(&format!("forget {name}"), |snapshot| snapshot.remove_resource(name))
            .await
    }

    /// Removes a pending delete once the old instance is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn finish_delete(&self, id: &str) -> Result<()> {
        self.write(&format!("drop pending {id}"), |snapshot| {
            snapshot.remove_pending_delete(id);
        })
        .await
    }

    /// Replaces the stack outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn set_outputs(&self, outputs: BTreeMap<String, Value>) -> Result<()> {
        self.write("outputs", move |snapshot| snapshot.outputs = outputs).await
    }

    /// Appends a run history entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be persisted.
    pub async fn add_history(&self, entry: RunHistoryEntry) -> Result<()> {
        self.write("history", move |snapshot| snapshot.add_history(entry)).await
    }

    /// Applies `mutate`, bumps the serial and persists the result.
    ///
    /// The in-memory snapshot keeps the mutation even if persisting fails,
    /// since it describes what happened at the provider.
    async fn write<R>(
        &self,
        what: &str,
        mutate: impl FnOnce(&mut StateSnapshot) -> R,
    ) -> Result<R> {
        let mut snapshot = self.snapshot.lock().await;
        let result = mutate(&mut *snapshot);
        snapshot.serial += 1;
        snapshot.last_updated = Utc::now();
        debug!("Snapshot serial {}: {what}", snapshot.serial);
        self.store.save(&*snapshot).await?;
        Ok(result)
    }
}

impl std::fmt::Debug for SnapshotJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotJournal")
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalStateStore;
    use serde_json::{json, Map};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn resource(name: &str, id: &str) -> ResourceState {
        ResourceState::new(
            name,
            "azure-native:storage:StorageAccount",
            id,
            Map::new(),
            Map::new(),
            BTreeSet::new(),
        )
    }

    fn journal() -> (SnapshotJournal, Arc<LocalStateStore>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let journal = SnapshotJournal::new(store.clone(), StateSnapshot::new("node-app", "dev"));
        (journal, store, temp)
    }

    #[tokio::test]
    async fn test_every_mutation_is_persisted() {
        let (journal, store, _temp) = journal();

        journal.record(resource("sa", "/sa/1")).await.unwrap();
        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.serial, 1);
        assert!(on_disk.get_resource("sa").is_some());

        journal.forget("sa").await.unwrap();
        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.serial, 2);
        assert!(on_disk.resources.is_empty());
    }

    #[tokio::test]
    async fn test_replacement_keeps_old_instance_pending() {
        let (journal, store, _temp) = journal();
        journal.record(resource("sa", "/sa/1")).await.unwrap();

        let old = journal.get("sa").await.unwrap().to_pending_delete();
        journal
            .record_replacement(resource("sa", "/sa/2"), old)
            .await
            .unwrap();

        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.get_resource("sa").unwrap().id, "/sa/2");
        assert_eq!(on_disk.pending_deletes[0].id, "/sa/1");
        assert_eq!(journal.pending("sa").await.len(), 1);
        assert!(journal.pending("other").await.is_empty());

        journal.finish_delete("/sa/1").await.unwrap();
        assert!(journal.snapshot().await.pending_deletes.is_empty());
        assert_eq!(journal.serial().await, 3);
    }

    #[tokio::test]
    async fn test_concurrent_writers_are_serialized() {
        let (journal, store, _temp) = journal();
        let journal = Arc::new(journal);

        let mut handles = Vec::new();
        for i in 0..16 {
            let journal = journal.clone();
            handles.push(tokio::spawn(async move {
                journal.record(resource(&format!("r{i}"), &format!("/r/{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.serial, 16);
        assert_eq!(on_disk.resources.len(), 16);

        journal
            .set_outputs(BTreeMap::from([(String::from("url"), json!("https://app"))]))
            .await
            .unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().outputs["url"], json!("https://app"));
    }
}

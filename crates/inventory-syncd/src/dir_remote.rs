//! Remote record store backed by a shared directory.
//!
//! All zones live in `remote.json` inside the directory, as a serialized
//! [`RemoteState`]. Devices pointing at the same directory (a network share,
//! a synced folder) see each other's changes through the zone change logs.
//! A missing directory reads as "no account" so cycles fail fast until the
//! share is mounted.

use async_trait::async_trait;
use inventory_sync::entity::now_millis;
use inventory_sync::record::{Checkpoint, Record, RecordId, ZoneId};
use inventory_sync::remote::{
    AccountStatus, RemoteError, RemoteState, RemoteStore, Result, UpsertOutcome, ZoneChanges,
};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

pub const REMOTE_FILE: &str = "remote.json";

pub struct DirectoryRemote {
    dir: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl DirectoryRemote {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(REMOTE_FILE)
    }

    async fn load(&self) -> Result<RemoteState> {
        match fs::read(self.path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| RemoteError::Other(format!("corrupt {}: {}", REMOTE_FILE, e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RemoteState::new()),
            Err(e) => Err(RemoteError::Transient(e.to_string())),
        }
    }

    async fn store(&self, state: &RemoteState) -> Result<()> {
        let contents =
            serde_json::to_vec_pretty(state).map_err(|e| RemoteError::Other(e.to_string()))?;
        let tmp_path = self.dir.join(format!("{REMOTE_FILE}.tmp"));
        fs::write(&tmp_path, contents)
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        fs::rename(&tmp_path, self.path())
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))
    }

    /// Read-modify-write the shared state under the process lock.
    async fn update<T>(&self, f: impl FnOnce(&mut RemoteState) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        let value = f(&mut state)?;
        self.store(&state).await?;
        Ok(value)
    }

    /// Current server copy of a record.
    pub async fn record(&self, id: &RecordId) -> Result<Option<Record>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.record(id).cloned())
    }
}

#[async_trait]
impl RemoteStore for DirectoryRemote {
    async fn account_status(&self) -> Result<AccountStatus> {
        match fs::metadata(&self.dir).await {
            Ok(metadata) if metadata.is_dir() => Ok(AccountStatus::Available),
            Ok(_) => Ok(AccountStatus::NoAccount),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(AccountStatus::NoAccount),
            Err(e) => Err(RemoteError::Transient(e.to_string())),
        }
    }

    async fn ensure_zones(&self, zones: &[ZoneId]) -> Result<()> {
        self.update(|state| {
            for zone in zones {
                if !state.has_zone(zone) {
                    debug!("Creating zone {}", zone);
                    state.ensure_zone(zone);
                }
            }
            Ok(())
        })
        .await
    }

    async fn fetch_changes(
        &self,
        zone: &ZoneId,
        since: Option<&Checkpoint>,
    ) -> Result<ZoneChanges> {
        let _guard = self.lock.lock().await;
        self.load().await?.changes_since(zone, since)
    }

    async fn upsert(&self, records: Vec<Record>) -> Result<UpsertOutcome> {
        let now_ms = now_millis();
        self.update(|state| {
            let mut outcome = UpsertOutcome::default();
            for record in records {
                let id = record.id.clone();
                match state.save_record(record, now_ms) {
                    Ok(saved) => outcome.saved.push(saved),
                    Err(e) => outcome.failed.push((id, e)),
                }
            }
            Ok(outcome)
        })
        .await
    }

    async fn delete(&self, ids: &[RecordId]) -> Result<()> {
        self.update(|state| {
            for id in ids {
                match state.delete_record(id) {
                    Ok(()) => {}
                    Err(e) if e.is_absent() => debug!("{} already absent", id),
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
        .await
    }
}

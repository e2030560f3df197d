//! Tombstone ledger for locally deleted entities.
//!
//! Stored as a JSON map of record identifier (`Zone/uuid`) to deletion time in
//! milliseconds since Unix epoch, under [`TOMBSTONES_KEY`] in the blob store.
//! Every mutation is written through immediately.
//!
//! A tombstone leaves the ledger only by expiry. Flushing issues remote
//! deletes but keeps the entry, so a record that reappears remotely before
//! the next fetch is still suppressed and deleted again.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blob::{BlobError, BlobStore};
use crate::record::{RecordId, ZoneId};
use crate::remote::{RemoteError, RemoteStore};
use crate::retry::{RetryPolicy, with_retry};

pub const TOMBSTONES_KEY: &str = "tombstones.json";

/// Default retention window for tombstones.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
struct PersistedTombstones(BTreeMap<String, u64>);

/// Outcome of pushing tombstones to the remote store.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Deletes the remote acknowledged (including already-absent records)
    pub acknowledged: Vec<RecordId>,
    /// Deletes that failed; retried on the next flush
    pub failed: Vec<(RecordId, RemoteError)>,
}

pub struct TombstoneLedger {
    blobs: Arc<dyn BlobStore>,
    retention: Duration,
    entries: PersistedTombstones,
}

impl TombstoneLedger {
    /// Load the ledger and purge expired entries.
    ///
    /// An unreadable ledger is logged and replaced by an empty one.
    pub async fn load(blobs: Arc<dyn BlobStore>, retention: Duration, now_ms: u64) -> Result<Self> {
        let entries = match blobs.read(TOMBSTONES_KEY).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Discarding unreadable tombstone ledger: {}", e);
                    PersistedTombstones::default()
                }
            },
            None => PersistedTombstones::default(),
        };

        let mut ledger = Self {
            blobs,
            retention,
            entries,
        };
        let purged = ledger.purge_expired(now_ms).await?;
        if purged > 0 {
            info!("Purged {} expired tombstone(s)", purged);
        }
        Ok(ledger)
    }

    /// Record a local deletion. Idempotent: an existing entry keeps its
    /// original timestamp. Returns true if a new entry was written.
    pub async fn record(&mut self, id: &RecordId, now_ms: u64) -> Result<bool> {
        let key = id.to_string();
        if self.entries.0.contains_key(&key) {
            return Ok(false);
        }
        self.entries.0.insert(key.clone(), now_ms);
        if let Err(e) = self.save().await {
            self.entries.0.remove(&key);
            return Err(e);
        }
        debug!("Tombstoned {}", id);
        Ok(true)
    }

    /// Whether `id` has a live (unexpired) tombstone.
    pub fn is_tombstoned(&self, id: &RecordId, now_ms: u64) -> bool {
        self.entries
            .0
            .get(&id.to_string())
            .is_some_and(|deleted_at| !self.is_expired(*deleted_at, now_ms))
    }

    /// Remove entries older than the retention window.
    pub async fn purge_expired(&mut self, now_ms: u64) -> Result<usize> {
        let before = self.entries.0.len();
        let retention_ms = self.retention.as_millis() as u64;
        self.entries
            .0
            .retain(|_, deleted_at| now_ms.saturating_sub(*deleted_at) < retention_ms);
        let purged = before - self.entries.0.len();
        if purged > 0 {
            self.save().await?;
        }
        Ok(purged)
    }

    /// Record ids of all live tombstones.
    pub fn live(&self, now_ms: u64) -> Vec<RecordId> {
        self.entries
            .0
            .iter()
            .filter(|(_, deleted_at)| !self.is_expired(**deleted_at, now_ms))
            .filter_map(|(key, _)| match parse_key(key) {
                Some(id) => Some(id),
                None => {
                    warn!("Skipping malformed tombstone key {}", key);
                    None
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.0.is_empty()
    }

    /// Issue remote deletes for every live tombstone, one batch per zone.
    ///
    /// A zone batch that trips over an already-absent record is replayed one
    /// record at a time so the absence does not mask the other deletes.
    pub async fn flush<R: RemoteStore + ?Sized>(
        &self,
        remote: &R,
        retry: &RetryPolicy,
        now_ms: u64,
    ) -> FlushReport {
        let mut by_zone: BTreeMap<ZoneId, Vec<RecordId>> = BTreeMap::new();
        for id in self.live(now_ms) {
            by_zone.entry(id.zone.clone()).or_default().push(id);
        }

        let mut report = FlushReport::default();
        for (zone, ids) in by_zone {
            let batch: &[RecordId] = &ids;
            let result = with_retry(retry, "delete", || remote.delete(batch)).await;
            match result {
                Ok(()) => report.acknowledged.extend(ids),
                Err(e) if e.is_absent() => {
                    debug!("Replaying {} delete(s) in {} one by one", ids.len(), zone);
                    for id in ids {
                        let single = std::slice::from_ref(&id);
                        let result = with_retry(retry, "delete", || remote.delete(single)).await;
                        match result {
                            Ok(()) => report.acknowledged.push(id),
                            Err(e) if e.is_absent() => report.acknowledged.push(id),
                            Err(e) => report.failed.push((id, e)),
                        }
                    }
                }
                Err(e) => {
                    warn!("Deleting {} record(s) in {} failed: {}", ids.len(), zone, e);
                    report
                        .failed
                        .extend(ids.into_iter().map(|id| (id, e.clone())));
                }
            }
        }
        report
    }

    fn is_expired(&self, deleted_at: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(deleted_at) >= self.retention.as_millis() as u64
    }

    async fn save(&self) -> Result<()> {
        let contents = serde_json::to_vec_pretty(&self.entries)?;
        self.blobs.write(TOMBSTONES_KEY, &contents).await?;
        Ok(())
    }
}

fn parse_key(key: &str) -> Option<RecordId> {
    let (zone, name) = key.split_once('/')?;
    if zone.is_empty() || name.is_empty() {
        return None;
    }
    Some(RecordId::new(name, ZoneId::new(zone)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::record::Record;
    use crate::remote::InMemoryRemoteStore;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn drill() -> RecordId {
        RecordId::new("0b7e6f1c-7d8e-4c1c-9d6b-3f4f1f9a2b10", ZoneId::new("Items"))
    }

    async fn open_ledger(blobs: &Arc<InMemoryBlobStore>, now_ms: u64) -> TombstoneLedger {
        TombstoneLedger::load(blobs.clone(), DEFAULT_RETENTION, now_ms)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_is_idempotent_and_persisted() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let mut ledger = open_ledger(&blobs, 0).await;

        assert!(ledger.record(&drill(), 1_000).await.unwrap());
        assert!(!ledger.record(&drill(), 5_000).await.unwrap());

        let raw = blobs.get(TOMBSTONES_KEY).unwrap();
        let persisted: BTreeMap<String, u64> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(persisted.get(&drill().to_string()), Some(&1_000));
    }

    #[tokio::test]
    async fn test_survives_reload() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        {
            let mut ledger = open_ledger(&blobs, 0).await;
            ledger.record(&drill(), 1_000).await.unwrap();
        }

        let ledger = open_ledger(&blobs, 2_000).await;
        assert!(ledger.is_tombstoned(&drill(), 2_000));
    }

    #[tokio::test]
    async fn test_expired_entries_are_purged_on_load() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        {
            let mut ledger = open_ledger(&blobs, 0).await;
            ledger.record(&drill(), 1_000).await.unwrap();
        }

        let later = 1_000 + 31 * DAY_MS;
        let ledger = open_ledger(&blobs, later).await;
        assert!(ledger.is_empty());
        assert!(!ledger.is_tombstoned(&drill(), later));
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_live_before_purge() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let mut ledger = open_ledger(&blobs, 0).await;
        ledger.record(&drill(), 0).await.unwrap();

        assert!(ledger.is_tombstoned(&drill(), 29 * DAY_MS));
        assert!(!ledger.is_tombstoned(&drill(), 30 * DAY_MS));
        assert!(ledger.live(30 * DAY_MS).is_empty());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_record() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let mut ledger = open_ledger(&blobs, 0).await;
        blobs.set_fail_writes(true);

        assert!(ledger.record(&drill(), 1_000).await.is_err());
        assert!(!ledger.is_tombstoned(&drill(), 1_000));
    }

    #[tokio::test]
    async fn test_unreadable_ledger_starts_empty() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        blobs.write(TOMBSTONES_KEY, b"not json").await.unwrap();
        assert!(open_ledger(&blobs, 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_is_idempotent_against_absent_records() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let mut ledger = open_ledger(&blobs, 0).await;
        ledger.record(&drill(), 1_000).await.unwrap();

        let remote = InMemoryRemoteStore::new();
        remote.set_report_absent_deletes(true);
        remote.put_record(Record::new("Item", drill()));

        let first = ledger.flush(&remote, &RetryPolicy::none(), 2_000).await;
        assert_eq!(first.acknowledged, vec![drill()]);
        assert!(first.failed.is_empty());
        assert!(remote.record(&drill()).is_none());

        let second = ledger.flush(&remote, &RetryPolicy::none(), 3_000).await;
        assert_eq!(second.acknowledged, vec![drill()]);
        assert!(second.failed.is_empty());

        // Flushing never removes the tombstone
        assert!(ledger.is_tombstoned(&drill(), 3_000));
    }

    #[tokio::test]
    async fn test_flush_failure_keeps_tombstone_for_next_cycle() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let mut ledger = open_ledger(&blobs, 0).await;
        ledger.record(&drill(), 1_000).await.unwrap();

        let remote = InMemoryRemoteStore::new();
        remote.put_record(Record::new("Item", drill()));
        remote.fail_next_delete(RemoteError::Transient("offline".into()));

        let report = ledger.flush(&remote, &RetryPolicy::none(), 2_000).await;
        assert_eq!(report.failed.len(), 1);
        assert!(remote.record(&drill()).is_some());

        let retry = ledger.flush(&remote, &RetryPolicy::none(), 3_000).await;
        assert_eq!(retry.acknowledged, vec![drill()]);
        assert!(remote.record(&drill()).is_none());
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key(&drill().to_string()), Some(drill()));
        assert_eq!(parse_key("no-zone"), None);
        assert_eq!(parse_key("/name"), None);
    }
}

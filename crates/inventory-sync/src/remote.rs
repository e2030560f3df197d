//! RemoteStore trait for the zoned remote record service.
//!
//! Implementations:
//! - `InMemoryRemoteStore` - For testing, with failure injection
//! - `DirectoryRemote` (in inventory-syncd) - Zones as JSON files in a shared folder
//!
//! Both are backed by [`RemoteState`], which models per-zone records plus a
//! change log whose sequence numbers serve as checkpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

use crate::entity::now_millis;
use crate::record::{Checkpoint, Record, RecordId, ZoneId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote account unavailable: {0}")]
    Unavailable(String),

    #[error("Transient remote error: {0}")]
    Transient(String),

    #[error("Zone not found: {0}")]
    ZoneNotFound(ZoneId),

    #[error("Unknown record: {0}")]
    UnknownItem(RecordId),

    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("Remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Worth retrying within the same cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// The target is already gone; benign for creates and deletes.
    pub fn is_absent(&self) -> bool {
        matches!(self, RemoteError::ZoneNotFound(_) | RemoteError::UnknownItem(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Available,
    NoAccount,
    Restricted,
    TemporarilyUnavailable,
}

/// Changes in one zone since a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct ZoneChanges {
    pub modified: Vec<Record>,
    pub deleted: Vec<RecordId>,
    pub checkpoint: Option<Checkpoint>,
}

/// Result of a batched upsert. Records succeed or fail individually.
#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    pub saved: Vec<RecordId>,
    pub failed: Vec<(RecordId, RemoteError)>,
}

/// Remote record service partitioned into zones.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn account_status(&self) -> Result<AccountStatus>;

    /// Create any missing zones. Idempotent.
    async fn ensure_zones(&self, zones: &[ZoneId]) -> Result<()>;

    /// Changes after `since`, or everything when `since` is `None`.
    async fn fetch_changes(&self, zone: &ZoneId, since: Option<&Checkpoint>)
    -> Result<ZoneChanges>;

    async fn upsert(&self, records: Vec<Record>) -> Result<UpsertOutcome>;

    /// Delete records. Records that are already absent count as deleted.
    async fn delete(&self, ids: &[RecordId]) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChangeEntry {
    seq: u64,
    name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneState {
    records: BTreeMap<String, Record>,
    log: Vec<ChangeEntry>,
}

/// Server-side state of every zone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteState {
    zones: BTreeMap<String, ZoneState>,
    next_seq: u64,
}

impl RemoteState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_zone(&mut self, zone: &ZoneId) {
        self.zones.entry(zone.as_str().to_string()).or_default();
    }

    pub fn has_zone(&self, zone: &ZoneId) -> bool {
        self.zones.contains_key(zone.as_str())
    }

    pub fn record(&self, id: &RecordId) -> Option<&Record> {
        self.zones.get(id.zone.as_str())?.records.get(&id.name)
    }

    pub fn records(&self, zone: &ZoneId) -> Vec<&Record> {
        self.zones
            .get(zone.as_str())
            .map(|z| z.records.values().collect())
            .unwrap_or_default()
    }

    /// Store a record, stamping the server modification time.
    pub fn save_record(&mut self, mut record: Record, now_ms: u64) -> Result<RecordId> {
        let seq = self.bump_seq();
        let zone = self
            .zones
            .get_mut(record.id.zone.as_str())
            .ok_or_else(|| RemoteError::ZoneNotFound(record.id.zone.clone()))?;

        record.modified_at_ms = Some(now_ms);
        let id = record.id.clone();
        zone.log.push(ChangeEntry {
            seq,
            name: id.name.clone(),
        });
        zone.records.insert(id.name.clone(), record);
        Ok(id)
    }

    /// Remove a record. Reports absence as an error; callers decide whether
    /// that matters.
    pub fn delete_record(&mut self, id: &RecordId) -> Result<()> {
        let seq = self.bump_seq();
        let zone = self
            .zones
            .get_mut(id.zone.as_str())
            .ok_or_else(|| RemoteError::ZoneNotFound(id.zone.clone()))?;

        if zone.records.remove(&id.name).is_none() {
            return Err(RemoteError::UnknownItem(id.clone()));
        }
        zone.log.push(ChangeEntry {
            seq,
            name: id.name.clone(),
        });
        Ok(())
    }

    pub fn changes_since(&self, zone_id: &ZoneId, since: Option<&Checkpoint>) -> Result<ZoneChanges> {
        let zone = self
            .zones
            .get(zone_id.as_str())
            .ok_or_else(|| RemoteError::ZoneNotFound(zone_id.clone()))?;

        let after = match since {
            Some(checkpoint) => checkpoint
                .0
                .parse::<u64>()
                .map_err(|_| RemoteError::Other(format!("bad checkpoint {checkpoint}")))?,
            None => 0,
        };

        let changed: BTreeSet<&str> = zone
            .log
            .iter()
            .filter(|entry| entry.seq > after)
            .map(|entry| entry.name.as_str())
            .collect();

        let mut changes = ZoneChanges::default();
        for name in changed {
            match zone.records.get(name) {
                Some(record) => changes.modified.push(record.clone()),
                None => changes
                    .deleted
                    .push(RecordId::new(name, zone_id.clone())),
            }
        }

        let last = zone.log.last().map(|entry| entry.seq).unwrap_or(0).max(after);
        changes.checkpoint = Some(Checkpoint(last.to_string()));
        Ok(changes)
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

struct Inner {
    state: RemoteState,
    account: AccountStatus,
    fetch_failures: VecDeque<RemoteError>,
    upsert_failures: VecDeque<RemoteError>,
    delete_failures: VecDeque<RemoteError>,
    rejected: HashSet<String>,
    report_absent_deletes: bool,
    delete_requests: Vec<RecordId>,
    upsert_batches: Vec<usize>,
}

/// In-memory remote store for testing.
pub struct InMemoryRemoteStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RemoteState::new(),
                account: AccountStatus::Available,
                fetch_failures: VecDeque::new(),
                upsert_failures: VecDeque::new(),
                delete_failures: VecDeque::new(),
                rejected: HashSet::new(),
                report_absent_deletes: false,
                delete_requests: Vec::new(),
                upsert_batches: Vec::new(),
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_account_status(&self, status: AccountStatus) {
        self.inner().account = status;
    }

    /// Queue an error for an upcoming `fetch_changes` call.
    pub fn fail_next_fetch(&self, error: RemoteError) {
        self.inner().fetch_failures.push_back(error);
    }

    /// Queue an error for an upcoming `upsert` call (whole batch).
    pub fn fail_next_upsert(&self, error: RemoteError) {
        self.inner().upsert_failures.push_back(error);
    }

    /// Queue an error for an upcoming `delete` call.
    pub fn fail_next_delete(&self, error: RemoteError) {
        self.inner().delete_failures.push_back(error);
    }

    /// Reject every upsert of the named record.
    pub fn reject_record(&self, name: impl Into<String>) {
        self.inner().rejected.insert(name.into());
    }

    /// Report deletes of absent records as `UnknownItem`, like a raw server would.
    pub fn set_report_absent_deletes(&self, report: bool) {
        self.inner().report_absent_deletes = report;
    }

    /// Write a record directly on the server side, bypassing failure injection.
    pub fn put_record(&self, record: Record) {
        let mut inner = self.inner();
        inner.state.ensure_zone(&record.id.zone);
        // Zone was just ensured, so this cannot fail.
        let _ = inner.state.save_record(record, now_millis());
    }

    /// Delete a record directly on the server side.
    pub fn remove_record(&self, id: &RecordId) {
        let _ = self.inner().state.delete_record(id);
    }

    pub fn record(&self, id: &RecordId) -> Option<Record> {
        self.inner().state.record(id).cloned()
    }

    pub fn record_count(&self, zone: &ZoneId) -> usize {
        self.inner().state.records(zone).len()
    }

    pub fn has_zone(&self, zone: &ZoneId) -> bool {
        self.inner().state.has_zone(zone)
    }

    /// Every id passed to `delete`, in call order.
    pub fn delete_requests(&self) -> Vec<RecordId> {
        self.inner().delete_requests.clone()
    }

    /// Size of every upsert batch received.
    pub fn upsert_batches(&self) -> Vec<usize> {
        self.inner().upsert_batches.clone()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn account_status(&self) -> Result<AccountStatus> {
        Ok(self.inner().account)
    }

    async fn ensure_zones(&self, zones: &[ZoneId]) -> Result<()> {
        let mut inner = self.inner();
        for zone in zones {
            inner.state.ensure_zone(zone);
        }
        Ok(())
    }

    async fn fetch_changes(
        &self,
        zone: &ZoneId,
        since: Option<&Checkpoint>,
    ) -> Result<ZoneChanges> {
        let mut inner = self.inner();
        if let Some(error) = inner.fetch_failures.pop_front() {
            return Err(error);
        }
        inner.state.changes_since(zone, since)
    }

    async fn upsert(&self, records: Vec<Record>) -> Result<UpsertOutcome> {
        let mut inner = self.inner();
        inner.upsert_batches.push(records.len());
        if let Some(error) = inner.upsert_failures.pop_front() {
            return Err(error);
        }

        let now_ms = now_millis();
        let mut outcome = UpsertOutcome::default();
        for record in records {
            if inner.rejected.contains(&record.id.name) {
                outcome.failed.push((
                    record.id.clone(),
                    RemoteError::Rejected(format!("{} refused by server", record.id)),
                ));
                continue;
            }
            let id = record.id.clone();
            match inner.state.save_record(record, now_ms) {
                Ok(saved) => outcome.saved.push(saved),
                Err(error) => outcome.failed.push((id, error)),
            }
        }
        Ok(outcome)
    }

    async fn delete(&self, ids: &[RecordId]) -> Result<()> {
        let mut inner = self.inner();
        inner.delete_requests.extend(ids.iter().cloned());
        if let Some(error) = inner.delete_failures.pop_front() {
            return Err(error);
        }

        for id in ids {
            match inner.state.delete_record(id) {
                Ok(()) => {}
                Err(error) if error.is_absent() && !inner.report_absent_deletes => {}
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> ZoneId {
        ZoneId::new("Items")
    }

    fn record(name: &str) -> Record {
        Record::new("Item", RecordId::new(name, zone()))
    }

    #[test]
    fn test_changes_since_checkpoint() {
        let mut state = RemoteState::new();
        state.ensure_zone(&zone());
        state.save_record(record("a"), 1).unwrap();
        state.save_record(record("b"), 2).unwrap();

        let first = state.changes_since(&zone(), None).unwrap();
        assert_eq!(first.modified.len(), 2);
        assert!(first.deleted.is_empty());

        state.delete_record(&RecordId::new("a", zone())).unwrap();
        state.save_record(record("c"), 3).unwrap();

        let second = state
            .changes_since(&zone(), first.checkpoint.as_ref())
            .unwrap();
        assert_eq!(second.modified.len(), 1);
        assert_eq!(second.modified[0].id.name, "c");
        assert_eq!(second.deleted, vec![RecordId::new("a", zone())]);

        let third = state
            .changes_since(&zone(), second.checkpoint.as_ref())
            .unwrap();
        assert!(third.modified.is_empty());
        assert!(third.deleted.is_empty());
        assert_eq!(third.checkpoint, second.checkpoint);
    }

    #[test]
    fn test_save_into_missing_zone_fails() {
        let mut state = RemoteState::new();
        assert_eq!(
            state.save_record(record("a"), 1),
            Err(RemoteError::ZoneNotFound(zone()))
        );
    }

    #[test]
    fn test_server_stamps_modification_time() {
        let mut state = RemoteState::new();
        state.ensure_zone(&zone());
        let id = state.save_record(record("a"), 77).unwrap();
        assert_eq!(state.record(&id).unwrap().modified_at_ms, Some(77));
    }

    #[tokio::test]
    async fn test_delete_absent_is_success_by_default() {
        let remote = InMemoryRemoteStore::new();
        remote.ensure_zones(&[zone()]).await.unwrap();

        let missing = RecordId::new("missing", zone());
        remote.delete(std::slice::from_ref(&missing)).await.unwrap();

        remote.set_report_absent_deletes(true);
        let err = remote.delete(&[missing]).await.unwrap_err();
        assert!(err.is_absent());
    }

    #[tokio::test]
    async fn test_rejected_records_fail_individually() {
        let remote = InMemoryRemoteStore::new();
        remote.ensure_zones(&[zone()]).await.unwrap();
        remote.reject_record("bad");

        let outcome = remote
            .upsert(vec![record("good"), record("bad")])
            .await
            .unwrap();
        assert_eq!(outcome.saved, vec![RecordId::new("good", zone())]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, RecordId::new("bad", zone()));
    }

    #[tokio::test]
    async fn test_injected_fetch_failure_is_consumed_once() {
        let remote = InMemoryRemoteStore::new();
        remote.ensure_zones(&[zone()]).await.unwrap();
        remote.fail_next_fetch(RemoteError::Transient("timeout".into()));

        assert!(remote.fetch_changes(&zone(), None).await.is_err());
        assert!(remote.fetch_changes(&zone(), None).await.is_ok());
    }
}

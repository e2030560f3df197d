//! Sync orchestrator.
//!
//! One [`SyncEngine`] owns the local object store, the tombstone ledger, the
//! pending relationship set and the per-zone checkpoints. A cycle runs in
//! fixed order:
//!
//! 1. account check
//! 2. ensure zones
//! 3. fetch every zone concurrently
//! 4. apply modified records (decode, tombstone check, insert-or-update)
//! 5. apply remote deletions
//! 6. resolve, dedupe, save, commit checkpoints
//! 7. flush tombstones
//! 8. send every local entity in bounded concurrent batches
//! 9. final resolve, orphan cleanup, tombstone expiry, save
//!
//! Every device uploads all of its entities each cycle, so fetches also
//! return this device's own echoes. An inbound record only overwrites a local
//! row when its edit time is newer; otherwise the local copy wins and goes
//! out again in step 8.
//!
//! Steps 1-3 never touch local state. Cycles never overlap: a trigger that
//! arrives while a cycle is running is dropped.

use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::codec::{self, fields};
use crate::config::SyncConfig;
use crate::dedupe::{self, BatchAdmission};
use crate::entity::{Entity, EntityKind, now_millis};
use crate::events::{EventBus, SyncEvent};
use crate::record::{Checkpoint, Record, RecordValue, ZoneId};
use crate::relationships::PendingRelationships;
use crate::remote::{AccountStatus, RemoteError, RemoteStore, UpsertOutcome, ZoneChanges};
use crate::retry::with_retry;
use crate::store::{self, ObjectStore, Predicate, StoreError};
use crate::tombstone::{LedgerError, TombstoneLedger};

pub const SYNC_STATE_KEY: &str = "sync_state.json";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync unavailable: {0}")]
    Unavailable(String),

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] LedgerError),
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Unavailable(reason) => SyncError::Unavailable(reason),
            other => SyncError::Remote(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Observable engine status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Error(String),
}

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Inbound records older than the local copy, left unapplied.
    pub superseded: usize,
    pub dropped: usize,
    pub suppressed: usize,
    pub deleted_locally: usize,
    pub duplicates_removed: usize,
    pub links_resolved: usize,
    pub tombstones_flushed: usize,
    pub tombstone_deletes_failed: usize,
    pub tombstones_expired: usize,
    pub sent: usize,
    pub send_failed: usize,
    pub orphans_removed: usize,
}

/// Checkpoints that survive restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    checkpoints: BTreeMap<String, Checkpoint>,
}

#[derive(Default)]
struct CycleState {
    persisted: PersistedState,
    /// Consecutive cycles each grouping entity ended without members.
    orphan_streaks: HashMap<Uuid, u32>,
}

struct StatusCell {
    status: SyncStatus,
    last_sync_at: Option<u64>,
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine<S, R> {
    store: Mutex<S>,
    remote: Arc<R>,
    blobs: Arc<dyn BlobStore>,
    ledger: Mutex<TombstoneLedger>,
    pending: Mutex<PendingRelationships>,
    state: Mutex<CycleState>,
    config: SyncConfig,
    status: RwLock<StatusCell>,
    syncing: AtomicBool,
    events: Arc<EventBus>,
}

impl<S: ObjectStore, R: RemoteStore> SyncEngine<S, R> {
    /// Load persisted bookkeeping and build an idle engine.
    pub async fn open(
        store: S,
        remote: Arc<R>,
        blobs: Arc<dyn BlobStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let now_ms = now_millis();
        let ledger =
            TombstoneLedger::load(blobs.clone(), config.tombstone_retention, now_ms).await?;
        let pending = PendingRelationships::load(blobs.clone()).await?;
        let persisted = match blobs
            .read(SYNC_STATE_KEY)
            .await
            .map_err(LedgerError::from)?
        {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding unreadable sync state, refetching all zones: {}", e);
                PersistedState::default()
            }),
            None => PersistedState::default(),
        };

        info!(
            "Sync engine ready: {} tombstone(s), {} pending relationship(s)",
            ledger.len(),
            pending.len()
        );

        Ok(Self {
            store: Mutex::new(store),
            remote,
            blobs,
            ledger: Mutex::new(ledger),
            pending: Mutex::new(pending),
            state: Mutex::new(CycleState {
                persisted,
                orphan_streaks: HashMap::new(),
            }),
            config,
            status: RwLock::new(StatusCell {
                status: SyncStatus::Idle,
                last_sync_at: None,
            }),
            syncing: AtomicBool::new(false),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn status(&self) -> SyncStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .status
            .clone()
    }

    /// When the last successful cycle finished, in milliseconds since Unix epoch.
    pub fn last_sync_at(&self) -> Option<u64> {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last_sync_at
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Run `f` with exclusive access to the local store.
    pub async fn with_store<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        let mut store = self.store.lock().await;
        f(&mut store)
    }

    pub async fn tombstone_count(&self) -> usize {
        self.ledger.lock().await.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Run a cycle and surface its outcome.
    ///
    /// Returns `Ok(None)` when another cycle is already running.
    pub async fn trigger_manual_sync(&self) -> Result<Option<SyncReport>> {
        let Some(_guard) = CycleGuard::acquire(&self.syncing) else {
            info!("Sync already in progress, dropping trigger");
            return Ok(None);
        };

        self.set_status(SyncStatus::Syncing, false);
        match self.run_cycle().await {
            Ok(report) => {
                info!(
                    "Sync finished: {} fetched, {} sent, {} tombstone(s) flushed",
                    report.fetched, report.sent, report.tombstones_flushed
                );
                self.set_status(SyncStatus::Success, true);
                Ok(Some(report))
            }
            Err(e) => {
                error!("Sync failed: {}", e);
                self.set_status(SyncStatus::Error(e.to_string()), false);
                Err(e)
            }
        }
    }

    /// Run a cycle from the periodic timer. Errors are logged and kept in the
    /// status only.
    pub async fn auto_sync(&self) -> Option<SyncReport> {
        match self.trigger_manual_sync().await {
            Ok(report) => report,
            Err(e) => {
                warn!("Automatic sync failed, retrying next interval: {}", e);
                None
            }
        }
    }

    /// Tombstone an entity before it is removed locally, so no cycle can
    /// bring it back.
    pub async fn notify_local_deletion(&self, kind: EntityKind, id: Uuid) -> Result<()> {
        let record_id = codec::record_id(kind, id);
        self.ledger
            .lock()
            .await
            .record(&record_id, now_millis())
            .await?;
        Ok(())
    }

    /// Delete an entity locally: tombstone, cascading delete, save.
    ///
    /// Returns the number of rows removed.
    pub async fn delete_local(&self, kind: EntityKind, id: Uuid) -> Result<usize> {
        self.notify_local_deletion(kind, id).await?;

        let mut pending = self.pending.lock().await;
        let mut store = self.store.lock().await;
        let removed = match store::delete_cascading(&mut *store, kind, id) {
            Ok(removed) => removed,
            Err(e) => {
                store.rollback();
                return Err(e.into());
            }
        };
        if let Err(e) = store.save() {
            store.rollback();
            return Err(e.into());
        }
        pending.forget(id);
        pending.persist().await?;

        info!("Deleted {} {} locally ({} row(s))", kind, id, removed);
        Ok(removed)
    }

    fn set_status(&self, status: SyncStatus, completed: bool) {
        let timestamp = now_millis();
        {
            let mut cell = self.status.write().unwrap_or_else(|e| e.into_inner());
            cell.status = status.clone();
            if completed {
                cell.last_sync_at = Some(timestamp);
            }
        }
        self.events
            .emit(SyncEvent::StatusChanged { status, timestamp });
    }

    async fn run_cycle(&self) -> Result<SyncReport> {
        let now_ms = now_millis();
        let mut report = SyncReport::default();
        info!("Sync cycle starting");

        // 1-3: remote only
        self.check_account().await?;
        self.ensure_zones().await?;
        let fetched = self.fetch_all().await?;

        // 4-6
        self.merge(&fetched, now_ms, &mut report).await?;

        // 7
        self.flush_tombstones(now_ms, &mut report).await;

        // 8
        self.send_all(now_ms, &mut report).await?;

        // 9
        self.finish_cycle(now_ms, &mut report).await?;

        Ok(report)
    }

    async fn check_account(&self) -> Result<()> {
        let status =
            with_retry(&self.config.retry, "account status", || self.remote.account_status())
                .await?;
        match status {
            AccountStatus::Available => Ok(()),
            other => Err(SyncError::Unavailable(format!("account status {other:?}"))),
        }
    }

    async fn ensure_zones(&self) -> Result<()> {
        let zones: Vec<ZoneId> = EntityKind::ALL.iter().map(EntityKind::zone).collect();
        let result =
            with_retry(&self.config.retry, "ensure zones", || self.remote.ensure_zones(&zones))
                .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_absent() => {
                debug!("Ignoring benign zone error: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch every zone concurrently; any failure fails the whole fetch.
    async fn fetch_all(&self) -> Result<Vec<(EntityKind, ZoneChanges)>> {
        let checkpoints = self.state.lock().await.persisted.checkpoints.clone();

        let fetches = EntityKind::ALL.into_iter().map(|kind| {
            let since = checkpoints.get(kind.zone().as_str()).cloned();
            async move {
                let zone = kind.zone();
                let changes = with_retry(&self.config.retry, "fetch changes", || {
                    self.remote.fetch_changes(&zone, since.as_ref())
                })
                .await?;
                debug!(
                    "Fetched {}: {} modified, {} deleted",
                    zone,
                    changes.modified.len(),
                    changes.deleted.len()
                );
                self.events.emit(SyncEvent::ZoneFetched {
                    zone: zone.to_string(),
                    modified: changes.modified.len(),
                    deleted: changes.deleted.len(),
                });
                Ok::<_, RemoteError>((kind, changes))
            }
        });

        Ok(try_join_all(fetches).await?)
    }

    /// Apply fetched changes and commit them together with the checkpoints.
    async fn merge(
        &self,
        fetched: &[(EntityKind, ZoneChanges)],
        now_ms: u64,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let ledger = self.ledger.lock().await;
        let mut pending = self.pending.lock().await;
        let mut store = self.store.lock().await;

        let applied = apply_changes(
            &mut *store,
            &ledger,
            &mut pending,
            &self.events,
            fetched,
            now_ms,
            report,
        );
        if let Err(e) = applied.and_then(|()| store.save()) {
            store.rollback();
            return Err(e.into());
        }

        if let Err(e) = pending.persist().await {
            warn!("Failed to persist pending relationships: {}", e);
        }

        for (kind, changes) in fetched {
            if let Some(checkpoint) = &changes.checkpoint {
                state
                    .persisted
                    .checkpoints
                    .insert(kind.zone().to_string(), checkpoint.clone());
            }
        }
        let contents = serde_json::to_vec_pretty(&state.persisted).map_err(LedgerError::from)?;
        self.blobs
            .write(SYNC_STATE_KEY, &contents)
            .await
            .map_err(LedgerError::from)?;
        Ok(())
    }

    async fn flush_tombstones(&self, now_ms: u64, report: &mut SyncReport) {
        let ledger = self.ledger.lock().await;
        if ledger.is_empty() {
            return;
        }
        let flush = ledger
            .flush(self.remote.as_ref(), &self.config.retry, now_ms)
            .await;
        for (id, e) in &flush.failed {
            warn!("Remote delete of {} failed, retrying next cycle: {}", id, e);
        }
        report.tombstones_flushed = flush.acknowledged.len();
        report.tombstone_deletes_failed = flush.failed.len();
        self.events.emit(SyncEvent::TombstonesFlushed {
            acknowledged: flush.acknowledged.len(),
            failed: flush.failed.len(),
        });
    }

    /// Encode and upsert every local entity that is not tombstoned.
    async fn send_all(&self, now_ms: u64, report: &mut SyncReport) -> Result<()> {
        let records = {
            let ledger = self.ledger.lock().await;
            let pending = self.pending.lock().await;
            let store = self.store.lock().await;
            outbound_records(&*store, &ledger, &pending, now_ms)
        };
        if records.is_empty() {
            return Ok(());
        }

        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<Vec<Record>> = records.chunks(batch_size).map(<[Record]>::to_vec).collect();
        debug!(
            "Sending {} record(s) in {} batch(es)",
            records.len(),
            batches.len()
        );

        let results: Vec<(usize, std::result::Result<UpsertOutcome, RemoteError>)> =
            stream::iter(batches)
                .map(|batch| async move {
                    let size = batch.len();
                    let result = with_retry(&self.config.retry, "upsert", || {
                        self.remote.upsert(batch.clone())
                    })
                    .await;
                    (size, result)
                })
                .buffer_unordered(self.config.max_concurrent_batches.max(1))
                .collect()
                .await;

        let mut unavailable = None;
        for (size, result) in results {
            match result {
                Ok(outcome) => {
                    for (id, e) in &outcome.failed {
                        warn!("Remote rejected {}: {}", id, e);
                    }
                    report.sent += outcome.saved.len();
                    report.send_failed += outcome.failed.len();
                    self.events.emit(SyncEvent::BatchSent {
                        saved: outcome.saved.len(),
                        failed: outcome.failed.len(),
                    });
                }
                Err(RemoteError::Unavailable(reason)) => {
                    unavailable = Some(reason);
                }
                Err(e) => {
                    warn!("Batch of {} record(s) failed: {}", size, e);
                    report.send_failed += size;
                    self.events.emit(SyncEvent::BatchSent {
                        saved: 0,
                        failed: size,
                    });
                }
            }
        }

        match unavailable {
            Some(reason) => Err(SyncError::Unavailable(reason)),
            None => Ok(()),
        }
    }

    async fn finish_cycle(&self, now_ms: u64, report: &mut SyncReport) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut ledger = self.ledger.lock().await;
        let mut pending = self.pending.lock().await;
        let mut store = self.store.lock().await;

        let resolved = match pending.attempt_resolve(&mut *store) {
            Ok(resolved) => resolved,
            Err(e) => {
                store.rollback();
                return Err(e.into());
            }
        };
        report.links_resolved += resolved.linked;

        if let Some(grace) = self.config.orphan_grace_cycles {
            let orphans = collect_orphans(&*store, &pending, &mut state.orphan_streaks, grace);
            for (kind, id) in orphans {
                if let Err(e) = ledger.record(&codec::record_id(kind, id), now_ms).await {
                    store.rollback();
                    return Err(e.into());
                }
                if let Err(e) = store::delete_cascading(&mut *store, kind, id) {
                    store.rollback();
                    return Err(e.into());
                }
                state.orphan_streaks.remove(&id);
                info!("Removed empty {} {}", kind, id);
                report.orphans_removed += 1;
            }
        }

        if let Err(e) = store.save() {
            store.rollback();
            return Err(e.into());
        }
        if let Err(e) = pending.persist().await {
            warn!("Failed to persist pending relationships: {}", e);
        }

        match ledger.purge_expired(now_ms).await {
            Ok(0) => {}
            Ok(purged) => {
                info!("Purged {} expired tombstone(s)", purged);
                report.tombstones_expired = purged;
            }
            Err(e) => warn!("Failed to purge expired tombstones: {}", e),
        }
        Ok(())
    }
}

/// Steps 4-6 against locked state. Leaves the transaction open for the caller.
fn apply_changes<S: ObjectStore + ?Sized>(
    store: &mut S,
    ledger: &TombstoneLedger,
    pending: &mut PendingRelationships,
    events: &EventBus,
    fetched: &[(EntityKind, ZoneChanges)],
    now_ms: u64,
    report: &mut SyncReport,
) -> std::result::Result<(), StoreError> {
    for (kind, changes) in fetched {
        report.fetched += changes.modified.len();
        let mut admission = BatchAdmission::new();
        for record in &changes.modified {
            apply_record(store, ledger, pending, events, &mut admission, record, now_ms, report)?;
        }
        if !changes.modified.is_empty() {
            report.links_resolved += pending.attempt_resolve(store)?.linked;
            report.duplicates_removed += dedupe::dedupe(store, *kind)?;
        }
    }

    for (_, changes) in fetched {
        for record_id in &changes.deleted {
            let (Some(kind), Ok(id)) = (
                EntityKind::from_zone(&record_id.zone),
                Uuid::parse_str(&record_id.name),
            ) else {
                warn!("Ignoring deletion of unrecognized record {}", record_id);
                continue;
            };
            let removed = store::delete_cascading(store, kind, id)?;
            if removed > 0 {
                debug!("Remote deleted {} {}", kind, id);
            }
            report.deleted_locally += removed;
            pending.forget(id);
        }
    }

    report.links_resolved += pending.attempt_resolve(store)?.linked;
    report.duplicates_removed += dedupe::dedupe_all(store)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_record<S: ObjectStore + ?Sized>(
    store: &mut S,
    ledger: &TombstoneLedger,
    pending: &mut PendingRelationships,
    events: &EventBus,
    admission: &mut BatchAdmission,
    record: &Record,
    now_ms: u64,
    report: &mut SyncReport,
) -> std::result::Result<(), StoreError> {
    let mutation = match codec::decode(record) {
        Ok(mutation) => mutation,
        Err(e) => {
            warn!("Dropping record {}: {}", record.id, e);
            events.emit(SyncEvent::RecordDropped {
                record: record.id.to_string(),
                reason: e.to_string(),
            });
            report.dropped += 1;
            return Ok(());
        }
    };

    let record_id = codec::record_id(mutation.kind, mutation.id);
    if ledger.is_tombstoned(&record_id, now_ms) {
        warn!("Ignoring tombstoned record {}", record_id);
        events.emit(SyncEvent::RecordSuppressed {
            record: record_id.to_string(),
        });
        report.suppressed += 1;
        return Ok(());
    }

    let rows = store.fetch(mutation.kind, &Predicate::Id(mutation.id));
    if let Some(inbound_ms) = mutation.meta().modified_at_ms {
        let local_is_newer = !rows.is_empty()
            && rows
                .iter()
                .all(|stored| stored.entity.meta().modified_at_ms >= inbound_ms);
        if local_is_newer {
            debug!("Keeping newer local {} {}", mutation.kind, mutation.id);
            report.superseded += 1;
            return Ok(());
        }
    }

    if let Some((location, category)) = mutation.desired_references() {
        pending.record(mutation.id, location, category);
    }

    if rows.is_empty() {
        if admission.admit(mutation.id) {
            let sort_order = store::next_sort_order(&*store, mutation.kind);
            debug!("Inserting {} {}", mutation.kind, mutation.id);
            store.insert(mutation.into_entity(sort_order, now_ms));
            report.inserted += 1;
        }
        return Ok(());
    }

    for mut stored in rows {
        mutation.apply_to(&mut stored.entity);
        store.update(stored.row, stored.entity)?;
    }
    report.updated += 1;
    Ok(())
}

/// Encode every live local entity. Items whose references are still
/// pending keep advertising the wanted targets, so a peer never sees the
/// reference vanish while this device waits for the target to arrive.
/// Targets tombstoned here are not advertised.
fn outbound_records<S: ObjectStore + ?Sized>(
    store: &S,
    ledger: &TombstoneLedger,
    pending: &PendingRelationships,
    now_ms: u64,
) -> Vec<Record> {
    EntityKind::ALL
        .into_iter()
        .flat_map(|kind| store.fetch(kind, &Predicate::All))
        .filter_map(|stored| {
            let mut record = codec::encode(&stored.entity);
            if ledger.is_tombstoned(&record.id, now_ms) {
                return None;
            }
            if let (Entity::Item(item), Some(wanted)) =
                (&stored.entity, pending.get(&stored.entity.id()))
            {
                let live = |kind: EntityKind, id: Uuid| {
                    !ledger.is_tombstoned(&codec::record_id(kind, id), now_ms)
                };
                let wanted_location = wanted.location.filter(|id| live(EntityKind::Location, *id));
                if let (None, Some(location)) = (item.location, wanted_location) {
                    record.set(
                        fields::LOCATION,
                        RecordValue::Reference(codec::record_id(EntityKind::Location, location)),
                    );
                }
                let wanted_category = wanted.category.filter(|id| live(EntityKind::Category, *id));
                if let (None, Some(category)) = (item.category, wanted_category) {
                    record.set(
                        fields::CATEGORY,
                        RecordValue::Reference(codec::record_id(EntityKind::Category, category)),
                    );
                }
            }
            Some(record)
        })
        .collect()
}

/// Update empty-streaks for every Location and Category and return those
/// whose streak reached `grace`.
fn collect_orphans<S: ObjectStore + ?Sized>(
    store: &S,
    pending: &PendingRelationships,
    streaks: &mut HashMap<Uuid, u32>,
    grace: u32,
) -> Vec<(EntityKind, Uuid)> {
    let wanted = pending.wanted_targets();
    let mut seen = HashSet::new();
    let mut orphans = Vec::new();

    for kind in [EntityKind::Location, EntityKind::Category] {
        for stored in store.fetch(kind, &Predicate::All) {
            let id = stored.entity.id();
            if !seen.insert(id) {
                continue;
            }
            let empty = !wanted.contains(&id)
                && store
                    .fetch(EntityKind::Item, &Predicate::References(kind, id))
                    .is_empty();
            if !empty {
                streaks.remove(&id);
                continue;
            }
            let streak = streaks.entry(id).or_insert(0);
            *streak += 1;
            if *streak >= grace {
                orphans.push((kind, id));
            }
        }
    }

    streaks.retain(|id, _| seen.contains(id));
    orphans
}

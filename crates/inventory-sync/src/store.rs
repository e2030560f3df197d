//! ObjectStore trait abstraction for the local transactional entity store.
//!
//! Implementations:
//! - `InMemoryObjectStore` - For testing, and as the core of snapshot-backed stores
//! - `FileStore` (in inventory-syncd) - Persists committed snapshots as JSON
//!
//! Rows carry store-assigned ids, so two rows may share one logical entity id.
//! That is the race the deduplicator repairs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::{Entity, EntityKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Row not found: {0}")]
    RowNotFound(RowId),

    #[error("Save failed: {0}")]
    SaveFailed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Store-assigned handle for one stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl Display for RowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "row#{}", self.0)
    }
}

/// Fetch predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    All,
    Id(Uuid),
    /// Items whose reference slot for the given group kind points at the id.
    References(EntityKind, Uuid),
}

impl Predicate {
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Id(id) => entity.id() == *id,
            Predicate::References(kind, id) => entity.references(*kind, *id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntity {
    pub row: RowId,
    pub entity: Entity,
}

/// Transactional local entity store.
///
/// Mutations are visible to `fetch` immediately and become durable on `save`.
pub trait ObjectStore: Send {
    /// Rows of `kind` matching `predicate`, in insertion order.
    fn fetch(&self, kind: EntityKind, predicate: &Predicate) -> Vec<StoredEntity>;

    fn insert(&mut self, entity: Entity) -> RowId;

    fn update(&mut self, row: RowId, entity: Entity) -> Result<()>;

    fn delete(&mut self, row: RowId) -> Result<()>;

    /// Commit pending mutations.
    fn save(&mut self) -> Result<()>;

    /// Discard pending mutations.
    fn rollback(&mut self);
}

/// First row holding the entity with `id`.
pub fn find_by_id<S: ObjectStore + ?Sized>(
    store: &S,
    kind: EntityKind,
    id: Uuid,
) -> Option<StoredEntity> {
    store.fetch(kind, &Predicate::Id(id)).into_iter().next()
}

/// Next free sort order for a kind.
pub fn next_sort_order<S: ObjectStore + ?Sized>(store: &S, kind: EntityKind) -> i64 {
    store
        .fetch(kind, &Predicate::All)
        .iter()
        .map(|stored| stored.entity.meta().sort_order.saturating_add(1))
        .max()
        .unwrap_or(0)
}

/// Delete every row holding entity `id`, then keep the kind's sort order
/// dense and, for a grouping entity, clear the reference on member Items.
///
/// Returns the number of rows removed.
pub fn delete_cascading<S: ObjectStore + ?Sized>(
    store: &mut S,
    kind: EntityKind,
    id: Uuid,
) -> Result<usize> {
    let rows = store.fetch(kind, &Predicate::Id(id));
    if rows.is_empty() {
        return Ok(0);
    }

    for stored in &rows {
        store.delete(stored.row)?;
    }
    compact_sort_order(store, kind)?;

    if kind.is_group() {
        for mut stored in store.fetch(EntityKind::Item, &Predicate::References(kind, id)) {
            if let Some(item) = stored.entity.as_item_mut() {
                match kind {
                    EntityKind::Location => item.location = None,
                    _ => item.category = None,
                }
            }
            store.update(stored.row, stored.entity)?;
        }
    }

    Ok(rows.len())
}

/// Renumber a kind's rows to `0..n`, keeping their relative order.
///
/// Rows with equal sort orders stay in row order. Returns the number of rows
/// whose sort order changed.
pub fn compact_sort_order<S: ObjectStore + ?Sized>(
    store: &mut S,
    kind: EntityKind,
) -> Result<usize> {
    let mut rows = store.fetch(kind, &Predicate::All);
    rows.sort_by_key(|stored| (stored.entity.meta().sort_order, stored.row));

    let mut changed = 0;
    for (position, mut stored) in (0_i64..).zip(rows) {
        let meta = stored.entity.meta_mut();
        if meta.sort_order != position {
            meta.sort_order = position;
            store.update(stored.row, stored.entity)?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Apply a local edit to every row holding entity `id` and stamp it with
/// `now_ms`, so it outranks older copies on the next merge.
///
/// Returns the number of rows edited.
pub fn modify<S: ObjectStore + ?Sized>(
    store: &mut S,
    kind: EntityKind,
    id: Uuid,
    now_ms: u64,
    mut edit: impl FnMut(&mut Entity),
) -> Result<usize> {
    let rows = store.fetch(kind, &Predicate::Id(id));
    for mut stored in rows.iter().cloned() {
        edit(&mut stored.entity);
        stored.entity.meta_mut().modified_at_ms = now_ms;
        store.update(stored.row, stored.entity)?;
    }
    Ok(rows.len())
}

/// Serializable image of committed rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub next_row: u64,
    pub rows: Vec<StoredEntity>,
}

/// In-memory store with a committed snapshot and a working set.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    committed: BTreeMap<RowId, Entity>,
    working: BTreeMap<RowId, Entity>,
    next_row: u64,
    /// Number of upcoming saves that should fail (for testing)
    failing_saves: u32,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let rows: BTreeMap<RowId, Entity> = snapshot
            .rows
            .into_iter()
            .map(|stored| (stored.row, stored.entity))
            .collect();
        let next_row = rows
            .keys()
            .map(|row| row.0 + 1)
            .max()
            .unwrap_or(0)
            .max(snapshot.next_row);

        Self {
            committed: rows.clone(),
            working: rows,
            next_row,
            failing_saves: 0,
        }
    }

    /// Committed rows only.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshot_of(&self.committed)
    }

    /// Rows as they would be committed by the next `save`.
    pub fn working_snapshot(&self) -> StoreSnapshot {
        self.snapshot_of(&self.working)
    }

    fn snapshot_of(&self, rows: &BTreeMap<RowId, Entity>) -> StoreSnapshot {
        StoreSnapshot {
            next_row: self.next_row,
            rows: rows
                .iter()
                .map(|(row, entity)| StoredEntity {
                    row: *row,
                    entity: entity.clone(),
                })
                .collect(),
        }
    }

    /// Make the next `count` saves fail.
    pub fn fail_next_saves(&mut self, count: u32) {
        self.failing_saves = count;
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.committed != self.working
    }

    /// Number of rows of a kind, duplicates included.
    pub fn row_count(&self, kind: EntityKind) -> usize {
        self.working.values().filter(|e| e.kind() == kind).count()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn fetch(&self, kind: EntityKind, predicate: &Predicate) -> Vec<StoredEntity> {
        self.working
            .iter()
            .filter(|(_, entity)| entity.kind() == kind && predicate.matches(entity))
            .map(|(row, entity)| StoredEntity {
                row: *row,
                entity: entity.clone(),
            })
            .collect()
    }

    fn insert(&mut self, entity: Entity) -> RowId {
        let row = RowId(self.next_row);
        self.next_row += 1;
        self.working.insert(row, entity);
        row
    }

    fn update(&mut self, row: RowId, entity: Entity) -> Result<()> {
        match self.working.get_mut(&row) {
            Some(slot) => {
                *slot = entity;
                Ok(())
            }
            None => Err(StoreError::RowNotFound(row)),
        }
    }

    fn delete(&mut self, row: RowId) -> Result<()> {
        self.working
            .remove(&row)
            .map(|_| ())
            .ok_or(StoreError::RowNotFound(row))
    }

    fn save(&mut self) -> Result<()> {
        if self.failing_saves > 0 {
            self.failing_saves -= 1;
            return Err(StoreError::SaveFailed("injected failure".into()));
        }
        self.committed = self.working.clone();
        Ok(())
    }

    fn rollback(&mut self) {
        self.working = self.committed.clone();
    }
}

//! File-backed object store.
//!
//! Keeps rows in an [`InMemoryObjectStore`] and writes the pending rows to
//! `store.json` on every save, committing them in memory only once the file
//! is in place.

use anyhow::Result;
use inventory_sync::entity::EntityKind;
use inventory_sync::store::{
    self, InMemoryObjectStore, ObjectStore, Predicate, RowId, StoreError, StoreSnapshot,
    StoredEntity,
};
use inventory_sync::Entity;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const STORE_FILE: &str = "store.json";

pub struct FileStore {
    path: PathBuf,
    rows: InMemoryObjectStore,
}

impl FileStore {
    /// Open the store in `data_dir`, starting empty if nothing was saved yet.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(STORE_FILE);
        let rows = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
            debug!("Loaded {} row(s) from {}", snapshot.rows.len(), path.display());
            InMemoryObjectStore::from_snapshot(snapshot)
        } else {
            InMemoryObjectStore::new()
        };
        Ok(Self { path, rows })
    }

    /// Every entity of `kind`, in insertion order.
    pub fn entities(&self, kind: EntityKind) -> Vec<Entity> {
        self.rows
            .fetch(kind, &Predicate::All)
            .into_iter()
            .map(|stored| stored.entity)
            .collect()
    }

    /// Insert an entity at the end of its kind's ordering and commit.
    pub fn create(&mut self, mut entity: Entity) -> std::result::Result<RowId, StoreError> {
        let sort_order = store::next_sort_order(&self.rows, entity.kind());
        entity.meta_mut().sort_order = sort_order;
        let row = self.rows.insert(entity);
        if let Err(e) = self.save() {
            self.rows.rollback();
            return Err(e);
        }
        Ok(row)
    }

    fn write_snapshot(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.rows.working_snapshot())?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl ObjectStore for FileStore {
    fn fetch(&self, kind: EntityKind, predicate: &Predicate) -> Vec<StoredEntity> {
        self.rows.fetch(kind, predicate)
    }

    fn insert(&mut self, entity: Entity) -> RowId {
        self.rows.insert(entity)
    }

    fn update(&mut self, row: RowId, entity: Entity) -> std::result::Result<(), StoreError> {
        self.rows.update(row, entity)
    }

    fn delete(&mut self, row: RowId) -> std::result::Result<(), StoreError> {
        self.rows.delete(row)
    }

    fn save(&mut self) -> std::result::Result<(), StoreError> {
        self.write_snapshot()
            .map_err(|e| StoreError::SaveFailed(format!("{}: {}", self.path.display(), e)))?;
        self.rows.save()
    }

    fn rollback(&mut self) {
        self.rows.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_sync::{Group, Item};
    use tempfile::TempDir;

    #[test]
    fn test_saved_rows_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        let saw = Item::new("Saw", 2, 0, 1_000);
        store.create(Entity::Item(saw.clone())).unwrap();
        store.create(Entity::Location(Group::new("Shed", 0, 1_000))).unwrap();

        // Uncommitted rows are not persisted
        store.insert(Entity::Item(Item::new("Ghost", 1, 5, 1_000)));

        let reopened = FileStore::open(dir.path()).unwrap();
        let items = reopened.entities(EntityKind::Item);
        assert_eq!(items, vec![Entity::Item(saw)]);
        assert_eq!(reopened.entities(EntityKind::Location).len(), 1);
    }

    #[test]
    fn test_failed_write_can_be_rolled_back() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        let saw = Item::new("Saw", 2, 0, 1_000);
        store.create(Entity::Item(saw.clone())).unwrap();

        // A directory in place of the store file makes the rename fail
        let path = dir.path().join(STORE_FILE);
        fs::remove_file(&path).unwrap();
        fs::create_dir_all(path.join("blocker")).unwrap();

        store.insert(Entity::Item(Item::new("Hammer", 1, 1, 1_000)));
        assert!(matches!(store.save(), Err(StoreError::SaveFailed(_))));
        store.rollback();

        assert_eq!(store.entities(EntityKind::Item), vec![Entity::Item(saw)]);
    }

    #[test]
    fn test_create_appends_sort_order() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        store.create(Entity::Item(Item::new("Saw", 1, 0, 1_000))).unwrap();
        store.create(Entity::Item(Item::new("Drill", 1, 0, 1_000))).unwrap();

        let orders: Vec<i64> = store
            .entities(EntityKind::Item)
            .iter()
            .map(|e| e.meta().sort_order)
            .collect();
        assert_eq!(orders, vec![0, 1]);
    }
}

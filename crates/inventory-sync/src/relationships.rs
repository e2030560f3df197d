//! Pending relationships: Item references whose targets have not arrived yet.
//!
//! Items, Locations and Categories come from independent zones in no
//! particular order. Every inbound Item records the references it wants;
//! [`PendingRelationships::attempt_resolve`] links whatever targets exist
//! locally and keeps the rest for a later pass. Resolution is idempotent, so
//! it can run after every batch and once more at the end of a cycle.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::entity::EntityKind;
use crate::store::{self, ObjectStore, Predicate, StoreError};
use crate::tombstone::Result;

pub const PENDING_KEY: &str = "pending_relationships.json";

/// References an Item wants but does not have yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRelationship {
    pub location: Option<Uuid>,
    pub category: Option<Uuid>,
}

impl PendingRelationship {
    fn is_settled(&self) -> bool {
        self.location.is_none() && self.category.is_none()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveReport {
    /// Live references set on Items during this pass
    pub linked: usize,
    /// Entries removed because every wanted reference is now in place
    pub resolved: usize,
    /// Entries still waiting for a target
    pub pending: usize,
}

pub struct PendingRelationships {
    blobs: Arc<dyn BlobStore>,
    entries: BTreeMap<Uuid, PendingRelationship>,
    dirty: bool,
}

impl PendingRelationships {
    /// Load persisted entries. An unreadable blob is logged and ignored.
    pub async fn load(blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let entries = match blobs.read(PENDING_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding unreadable pending relationships: {}", e);
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };
        Ok(Self {
            blobs,
            entries,
            dirty: false,
        })
    }

    /// Remember what an inbound Item wants. Only references present in the
    /// record overwrite what was known before.
    pub fn record(&mut self, item_id: Uuid, location: Option<Uuid>, category: Option<Uuid>) {
        if location.is_none() && category.is_none() {
            return;
        }
        let entry = self.entries.entry(item_id).or_default();
        if location.is_some() {
            entry.location = location;
        }
        if category.is_some() {
            entry.category = category;
        }
        self.dirty = true;
    }

    /// Drop everything that involves a deleted entity: its own entry and any
    /// wish for it as a target.
    pub fn forget(&mut self, id: Uuid) {
        let mut changed = self.entries.remove(&id).is_some();
        for entry in self.entries.values_mut() {
            if entry.location == Some(id) {
                entry.location = None;
                changed = true;
            }
            if entry.category == Some(id) {
                entry.category = None;
                changed = true;
            }
        }
        self.entries.retain(|_, entry| !entry.is_settled());
        self.dirty |= changed;
    }

    /// Link every wanted reference whose target exists locally.
    pub fn attempt_resolve<S: ObjectStore + ?Sized>(
        &mut self,
        store: &mut S,
    ) -> std::result::Result<ResolveReport, StoreError> {
        let mut report = ResolveReport::default();
        let mut settled = Vec::new();

        for (item_id, wanted) in self.entries.iter_mut() {
            let rows = store.fetch(EntityKind::Item, &Predicate::Id(*item_id));
            if rows.is_empty() {
                debug!("Dropping pending relationship for missing item {}", item_id);
                settled.push(*item_id);
                continue;
            }

            let location = wanted
                .location
                .filter(|id| store::find_by_id(&*store, EntityKind::Location, *id).is_some());
            let category = wanted
                .category
                .filter(|id| store::find_by_id(&*store, EntityKind::Category, *id).is_some());

            if location.is_none() && category.is_none() {
                continue;
            }

            for mut stored in rows {
                let Some(item) = stored.entity.as_item_mut() else {
                    continue;
                };
                let mut changed = false;
                if location.is_some() && item.location != location {
                    item.location = location;
                    changed = true;
                }
                if category.is_some() && item.category != category {
                    item.category = category;
                    changed = true;
                }
                if changed {
                    store.update(stored.row, stored.entity)?;
                    report.linked += 1;
                }
            }

            if location.is_some() {
                wanted.location = None;
            }
            if category.is_some() {
                wanted.category = None;
            }
            if wanted.is_settled() {
                settled.push(*item_id);
            }
        }

        if !settled.is_empty() {
            self.dirty = true;
        }
        for item_id in settled {
            if self.entries.remove(&item_id).is_some() {
                report.resolved += 1;
            }
        }
        report.pending = self.entries.len();
        Ok(report)
    }

    /// Every group id some pending Item still wants.
    pub fn wanted_targets(&self) -> HashSet<Uuid> {
        self.entries
            .values()
            .flat_map(|entry| [entry.location, entry.category])
            .flatten()
            .collect()
    }

    pub fn get(&self, item_id: &Uuid) -> Option<&PendingRelationship> {
        self.entries.get(item_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write entries through if anything changed since the last persist.
    pub async fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let contents = serde_json::to_vec_pretty(&self.entries)?;
        self.blobs.write(PENDING_KEY, &contents).await?;
        self.dirty = false;
        Ok(())
    }
}

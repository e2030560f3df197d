//! Collapse rows that share one logical entity id.

use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use crate::entity::EntityKind;
use crate::store::{self, ObjectStore, Predicate, Result};

/// Keep the first row of every id of `kind`, delete the rest and close the
/// sort-order gaps they leave.
///
/// Returns the number of rows deleted.
pub fn dedupe<S: ObjectStore + ?Sized>(store: &mut S, kind: EntityKind) -> Result<usize> {
    let mut seen = HashSet::new();
    let mut removed = 0;
    for stored in store.fetch(kind, &Predicate::All) {
        if !seen.insert(stored.entity.id()) {
            store.delete(stored.row)?;
            removed += 1;
        }
    }
    if removed > 0 {
        store::compact_sort_order(store, kind)?;
        info!("Removed {} duplicate {} row(s)", removed, kind);
    }
    Ok(removed)
}

/// [`dedupe`] every kind.
pub fn dedupe_all<S: ObjectStore + ?Sized>(store: &mut S) -> Result<usize> {
    let mut removed = 0;
    for kind in EntityKind::ALL {
        removed += dedupe(store, kind)?;
    }
    Ok(removed)
}

/// Tracks ids already inserted from the current inbound batch, so two
/// records for one new entity produce a single row.
#[derive(Debug, Default)]
pub struct BatchAdmission {
    seen: HashSet<Uuid>,
}

impl BatchAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `id` is offered.
    pub fn admit(&mut self, id: Uuid) -> bool {
        self.seen.insert(id)
    }
}

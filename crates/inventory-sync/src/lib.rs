//! inventory-sync: Cloud sync engine for an inventory of Items grouped by
//! Categories and Locations.
//!
//! This crate provides:
//! - Record codec between local entities and zoned remote records
//! - Tombstone ledger that keeps local deletions from being resurrected
//! - Order-independent resolution of cross-zone references
//! - Deduplication of rows that share one entity id
//! - The sync orchestrator and its periodic scheduler
//! - ObjectStore, RemoteStore and BlobStore trait abstractions with
//!   in-memory implementations

pub mod blob;
pub mod codec;
pub mod config;
pub mod dedupe;
pub mod engine;
pub mod entity;
pub mod events;
pub mod record;
pub mod relationships;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod tombstone;

pub use blob::{BlobError, BlobStore, InMemoryBlobStore};
pub use codec::{DecodeError, EntityMutation};
pub use config::{ConfigError, SyncConfig};
pub use engine::{SyncEngine, SyncError, SyncReport, SyncStatus};
pub use entity::{Background, Entity, EntityKind, Group, Item, Meta};
pub use events::{EventBus, Subscription, SyncEvent};
pub use record::{Checkpoint, Record, RecordId, RecordValue, ZoneId};
pub use relationships::PendingRelationships;
pub use remote::{AccountStatus, InMemoryRemoteStore, RemoteError, RemoteState, RemoteStore};
pub use retry::RetryPolicy;
pub use scheduler::PeriodicSync;
pub use store::{InMemoryObjectStore, ObjectStore, Predicate, RowId, StoreError, StoreSnapshot};
pub use tombstone::TombstoneLedger;

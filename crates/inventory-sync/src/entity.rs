//! Local entity model: Items grouped by Categories and Locations.
//!
//! Cross-references are plain ids resolved through the object store, never
//! pointers, so an Item may name a Location that has not arrived yet.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

use crate::record::ZoneId;

/// The three concrete entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Item,
    Category,
    Location,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Location, EntityKind::Category, EntityKind::Item];

    /// Record type tag used on the remote side.
    pub fn record_type(&self) -> &'static str {
        match self {
            EntityKind::Item => "Item",
            EntityKind::Category => "Category",
            EntityKind::Location => "Location",
        }
    }

    pub fn from_record_type(record_type: &str) -> Option<Self> {
        match record_type {
            "Item" => Some(EntityKind::Item),
            "Category" => Some(EntityKind::Category),
            "Location" => Some(EntityKind::Location),
            _ => None,
        }
    }

    /// Zone holding records of this kind.
    pub fn zone(&self) -> ZoneId {
        match self {
            EntityKind::Item => ZoneId::new("Items"),
            EntityKind::Category => ZoneId::new("Categories"),
            EntityKind::Location => ZoneId::new("Locations"),
        }
    }

    pub fn from_zone(zone: &ZoneId) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| &kind.zone() == zone)
    }

    pub fn is_group(&self) -> bool {
        matches!(self, EntityKind::Category | EntityKind::Location)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.record_type())
    }
}

/// Fields shared by every entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub id: Uuid,
    pub name: String,
    /// Position in the kind's list; dense and gapless.
    pub sort_order: i64,
    /// Milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Milliseconds since Unix epoch. Bumped on every local edit and taken
    /// from the remote copy on inbound merge; the newer side wins a merge.
    pub modified_at_ms: u64,
}

impl Meta {
    pub fn new(name: impl Into<String>, sort_order: i64, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            sort_order,
            created_at_ms: now_ms,
            modified_at_ms: now_ms,
        }
    }
}

/// Visual background of an Item: either a photo or a symbol with a tint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Background {
    /// Opaque encoded image payload.
    Image(Vec<u8>),
    Symbol {
        name: String,
        /// Opaque encoded color.
        tint: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub meta: Meta,
    pub quantity: u32,
    pub location: Option<Uuid>,
    pub category: Option<Uuid>,
    pub background: Option<Background>,
}

impl Item {
    pub fn new(name: impl Into<String>, quantity: u32, sort_order: i64, now_ms: u64) -> Self {
        Self {
            meta: Meta::new(name, sort_order, now_ms),
            quantity,
            location: None,
            category: None,
            background: None,
        }
    }
}

/// A Category or a Location. Both carry the same display metadata and own
/// the Items that reference them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub meta: Meta,
    /// Opaque encoded color.
    pub color: Option<Vec<u8>>,
    /// Whether the group is listed in the summary row.
    pub show_in_summary: bool,
}

impl Group {
    pub fn new(name: impl Into<String>, sort_order: i64, now_ms: u64) -> Self {
        Self {
            meta: Meta::new(name, sort_order, now_ms),
            color: None,
            show_in_summary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    Item(Item),
    Category(Group),
    Location(Group),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Item(_) => EntityKind::Item,
            Entity::Category(_) => EntityKind::Category,
            Entity::Location(_) => EntityKind::Location,
        }
    }

    pub fn meta(&self) -> &Meta {
        match self {
            Entity::Item(item) => &item.meta,
            Entity::Category(group) | Entity::Location(group) => &group.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Entity::Item(item) => &mut item.meta,
            Entity::Category(group) | Entity::Location(group) => &mut group.meta,
        }
    }

    pub fn id(&self) -> Uuid {
        self.meta().id
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Entity::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Entity::Item(item) => Some(item),
            _ => None,
        }
    }

    /// Whether this Item references the given group id in the slot for `kind`.
    pub fn references(&self, kind: EntityKind, group_id: Uuid) -> bool {
        match (self, kind) {
            (Entity::Item(item), EntityKind::Location) => item.location == Some(group_id),
            (Entity::Item(item), EntityKind::Category) => item.category == Some(group_id),
            _ => false,
        }
    }
}

/// Milliseconds since Unix epoch.
pub fn now_millis() -> u64 {
    use web_time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

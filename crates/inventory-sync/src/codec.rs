//! Conversion between local entities and remote records.
//!
//! Encoding never writes an explicit null: optional fields that are unset are
//! simply absent. Decoding produces an [`EntityMutation`] with partial-update
//! semantics, so an absent field leaves the local value untouched.

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::entity::{Background, Entity, EntityKind, Group, Item, Meta};
use crate::record::{Record, RecordId, RecordValue};

/// Field names used on the wire.
pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const SORT_ORDER: &str = "sortOrder";
    pub const CREATION_DATE: &str = "creationDate";
    pub const MODIFIED_DATE: &str = "modifiedDate";
    pub const QUANTITY: &str = "quantity";
    pub const LOCATION: &str = "location";
    pub const CATEGORY: &str = "category";
    pub const IMAGE_DATA: &str = "imageData";
    pub const SYMBOL_NAME: &str = "symbolName";
    pub const SYMBOL_COLOR: &str = "symbolColor";
    pub const COLOR: &str = "color";
    pub const SHOW_IN_SUMMARY: &str = "showInSummary";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    #[error("Record {record} does not belong in zone {zone}")]
    ZoneMismatch { record: RecordId, zone: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} is {found}, expected {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Malformed identifier: {0}")]
    MalformedId(String),

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Scalar fields common to every kind, decoded from a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPatch {
    pub name: String,
    pub sort_order: Option<i64>,
    pub created_at_ms: Option<u64>,
    pub modified_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPatch {
    pub meta: MetaPatch,
    pub quantity: u32,
    /// Desired Location id. Applied by the relationship resolver, not here.
    pub location: Option<Uuid>,
    /// Desired Category id. Applied by the relationship resolver, not here.
    pub category: Option<Uuid>,
    pub background: Option<Background>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPatch {
    pub meta: MetaPatch,
    pub color: Option<Vec<u8>>,
    pub show_in_summary: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    Item(ItemPatch),
    Group(GroupPatch),
}

/// A decoded inbound record, ready to be applied as insert-or-update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMutation {
    pub kind: EntityKind,
    pub id: Uuid,
    pub patch: Patch,
}

impl EntityMutation {
    pub fn meta(&self) -> &MetaPatch {
        match &self.patch {
            Patch::Item(item) => &item.meta,
            Patch::Group(group) => &group.meta,
        }
    }

    /// Desired (location, category) references carried by an Item record.
    pub fn desired_references(&self) -> Option<(Option<Uuid>, Option<Uuid>)> {
        match &self.patch {
            Patch::Item(item) => Some((item.location, item.category)),
            Patch::Group(_) => None,
        }
    }

    /// Apply present fields onto an existing entity of the same kind.
    ///
    /// References are left alone; they are owned by the resolver.
    pub fn apply_to(&self, entity: &mut Entity) {
        match (&self.patch, entity) {
            (Patch::Item(patch), Entity::Item(item)) => {
                apply_meta(&patch.meta, &mut item.meta);
                item.quantity = patch.quantity;
                if let Some(background) = &patch.background {
                    item.background = Some(background.clone());
                }
            }
            (Patch::Group(patch), Entity::Category(group) | Entity::Location(group)) => {
                apply_meta(&patch.meta, &mut group.meta);
                if let Some(color) = &patch.color {
                    group.color = Some(color.clone());
                }
                if let Some(show) = patch.show_in_summary {
                    group.show_in_summary = show;
                }
            }
            (_, entity) => {
                warn!(
                    "Ignoring {} mutation for {} entity {}",
                    self.kind,
                    entity.kind(),
                    self.id
                );
            }
        }
    }

    /// Materialize a new entity. Missing optional fields take defaults:
    /// `default_sort_order` for ordering and `now_ms` for timestamps.
    pub fn into_entity(self, default_sort_order: i64, now_ms: u64) -> Entity {
        let id = self.id;
        let meta_of = |patch: MetaPatch| Meta {
            id,
            name: patch.name,
            sort_order: patch.sort_order.unwrap_or(default_sort_order),
            created_at_ms: patch.created_at_ms.unwrap_or(now_ms),
            modified_at_ms: patch.modified_at_ms.unwrap_or(now_ms),
        };

        match (self.kind, self.patch) {
            (_, Patch::Item(patch)) => Entity::Item(Item {
                meta: meta_of(patch.meta),
                quantity: patch.quantity,
                location: None,
                category: None,
                background: patch.background,
            }),
            (kind, Patch::Group(patch)) => {
                let group = Group {
                    meta: meta_of(patch.meta),
                    color: patch.color,
                    show_in_summary: patch.show_in_summary.unwrap_or(false),
                };
                if kind == EntityKind::Location {
                    Entity::Location(group)
                } else {
                    Entity::Category(group)
                }
            }
        }
    }
}

fn apply_meta(patch: &MetaPatch, meta: &mut Meta) {
    meta.name = patch.name.clone();
    if let Some(sort_order) = patch.sort_order {
        meta.sort_order = sort_order;
    }
    if let Some(created) = patch.created_at_ms {
        meta.created_at_ms = created;
    }
    if let Some(modified) = patch.modified_at_ms {
        meta.modified_at_ms = modified;
    }
}

/// The record id an entity is stored under.
pub fn record_id(kind: EntityKind, id: Uuid) -> RecordId {
    RecordId::new(id.to_string(), kind.zone())
}

/// Encode an entity as a remote record.
pub fn encode(entity: &Entity) -> Record {
    let kind = entity.kind();
    let meta = entity.meta();
    let mut record = Record::new(kind.record_type(), record_id(kind, meta.id));

    record.set(fields::ID, RecordValue::String(meta.id.to_string()));
    record.set(fields::NAME, RecordValue::String(meta.name.clone()));
    record.set(fields::SORT_ORDER, RecordValue::Int(meta.sort_order));
    record.set(fields::CREATION_DATE, RecordValue::Date(meta.created_at_ms));
    record.set(fields::MODIFIED_DATE, RecordValue::Date(meta.modified_at_ms));

    match entity {
        Entity::Item(item) => {
            record.set(fields::QUANTITY, RecordValue::Int(i64::from(item.quantity)));
            if let Some(location) = item.location {
                record.set(
                    fields::LOCATION,
                    RecordValue::Reference(record_id(EntityKind::Location, location)),
                );
            }
            if let Some(category) = item.category {
                record.set(
                    fields::CATEGORY,
                    RecordValue::Reference(record_id(EntityKind::Category, category)),
                );
            }
            match &item.background {
                Some(Background::Image(data)) => {
                    record.set(fields::IMAGE_DATA, RecordValue::Bytes(data.clone()));
                }
                Some(Background::Symbol { name, tint }) => {
                    record.set(fields::SYMBOL_NAME, RecordValue::String(name.clone()));
                    if let Some(tint) = tint {
                        record.set(fields::SYMBOL_COLOR, RecordValue::Bytes(tint.clone()));
                    }
                }
                None => {}
            }
        }
        Entity::Category(group) | Entity::Location(group) => {
            if let Some(color) = &group.color {
                record.set(fields::COLOR, RecordValue::Bytes(color.clone()));
            }
            record.set(
                fields::SHOW_IN_SUMMARY,
                RecordValue::Bool(group.show_in_summary),
            );
        }
    }

    record
}

/// Decode a remote record into a mutation.
///
/// Missing or malformed required fields reject the whole record. Malformed
/// optional fields are dropped individually and the rest is kept.
pub fn decode(record: &Record) -> Result<EntityMutation> {
    let kind = EntityKind::from_record_type(&record.record_type)
        .ok_or_else(|| DecodeError::UnknownRecordType(record.record_type.clone()))?;

    if record.id.zone != kind.zone() {
        return Err(DecodeError::ZoneMismatch {
            record: record.id.clone(),
            zone: kind.zone().to_string(),
        });
    }

    let id = decode_id(record)?;
    let meta = MetaPatch {
        name: required_string(record, fields::NAME)?.to_string(),
        sort_order: optional(record, fields::SORT_ORDER, |v| match v {
            RecordValue::Int(n) => Some(*n),
            _ => None,
        }),
        created_at_ms: optional(record, fields::CREATION_DATE, as_date),
        modified_at_ms: optional(record, fields::MODIFIED_DATE, as_date)
            .or(record.modified_at_ms),
    };

    let patch = match kind {
        EntityKind::Item => {
            let quantity = match record.get(fields::QUANTITY) {
                Some(RecordValue::Int(n)) => {
                    u32::try_from(*n).map_err(|_| DecodeError::OutOfRange {
                        field: fields::QUANTITY,
                        value: *n,
                    })?
                }
                Some(other) => {
                    return Err(DecodeError::WrongType {
                        field: fields::QUANTITY,
                        expected: "int",
                        found: other.type_name(),
                    });
                }
                None => return Err(DecodeError::MissingField(fields::QUANTITY)),
            };

            Patch::Item(ItemPatch {
                meta,
                quantity,
                location: optional_reference(record, fields::LOCATION, EntityKind::Location),
                category: optional_reference(record, fields::CATEGORY, EntityKind::Category),
                background: decode_background(record),
            })
        }
        EntityKind::Category | EntityKind::Location => Patch::Group(GroupPatch {
            meta,
            color: optional(record, fields::COLOR, as_bytes),
            show_in_summary: optional(record, fields::SHOW_IN_SUMMARY, |v| match v {
                RecordValue::Bool(b) => Some(*b),
                _ => None,
            }),
        }),
    };

    Ok(EntityMutation { kind, id, patch })
}

fn decode_id(record: &Record) -> Result<Uuid> {
    let raw = required_string(record, fields::ID)?;
    let id = Uuid::parse_str(raw).map_err(|_| DecodeError::MalformedId(raw.to_string()))?;
    let name_id = Uuid::parse_str(&record.id.name)
        .map_err(|_| DecodeError::MalformedId(record.id.name.clone()))?;
    if id != name_id {
        return Err(DecodeError::MalformedId(format!(
            "{} does not match record name {}",
            raw, record.id.name
        )));
    }
    Ok(id)
}

fn required_string<'a>(record: &'a Record, field: &'static str) -> Result<&'a str> {
    match record.get(field) {
        Some(RecordValue::String(s)) => Ok(s),
        Some(other) => Err(DecodeError::WrongType {
            field,
            expected: "string",
            found: other.type_name(),
        }),
        None => Err(DecodeError::MissingField(field)),
    }
}

/// Read an optional field, dropping it (with a warning) if it has the wrong type.
fn optional<T>(
    record: &Record,
    field: &'static str,
    extract: impl Fn(&RecordValue) -> Option<T>,
) -> Option<T> {
    let value = record.get(field)?;
    let extracted = extract(value);
    if extracted.is_none() {
        warn!(
            "Dropping field {} of {}: unexpected {}",
            field,
            record.id,
            value.type_name()
        );
    }
    extracted
}

fn as_date(value: &RecordValue) -> Option<u64> {
    match value {
        RecordValue::Date(ms) => Some(*ms),
        _ => None,
    }
}

fn as_bytes(value: &RecordValue) -> Option<Vec<u8>> {
    match value {
        RecordValue::Bytes(b) => Some(b.clone()),
        _ => None,
    }
}

fn optional_reference(record: &Record, field: &'static str, target: EntityKind) -> Option<Uuid> {
    let reference = optional(record, field, |v| match v {
        RecordValue::Reference(r) => Some(r.clone()),
        _ => None,
    })?;

    if reference.zone != target.zone() {
        warn!(
            "Dropping field {} of {}: reference into unrecognized zone {}",
            field, record.id, reference.zone
        );
        return None;
    }

    match Uuid::parse_str(&reference.name) {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(
                "Dropping field {} of {}: malformed reference {}",
                field, record.id, reference.name
            );
            None
        }
    }
}

fn decode_background(record: &Record) -> Option<Background> {
    if let Some(image) = optional(record, fields::IMAGE_DATA, as_bytes) {
        return Some(Background::Image(image));
    }
    let name = optional(record, fields::SYMBOL_NAME, |v| match v {
        RecordValue::String(s) => Some(s.clone()),
        _ => None,
    })?;
    Some(Background::Symbol {
        name,
        tint: optional(record, fields::SYMBOL_COLOR, as_bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ZoneId;

    fn drill() -> Item {
        let mut item = Item::new("Drill", 3, 2, 1_000);
        item.meta.modified_at_ms = 2_000;
        item.location = Some(Uuid::new_v4());
        item.category = Some(Uuid::new_v4());
        item.background = Some(Background::Symbol {
            name: "hammer".into(),
            tint: Some(vec![255, 0, 0]),
        });
        item
    }

    #[test]
    fn test_item_round_trip_preserves_fields() {
        let item = drill();
        let record = encode(&Entity::Item(item.clone()));
        let mutation = decode(&record).unwrap();

        assert_eq!(mutation.kind, EntityKind::Item);
        assert_eq!(mutation.id, item.meta.id);
        assert_eq!(
            mutation.desired_references(),
            Some((item.location, item.category))
        );

        let decoded = mutation.into_entity(99, 5_000);
        let Entity::Item(decoded) = decoded else {
            panic!("expected item");
        };
        assert_eq!(decoded.meta, item.meta);
        assert_eq!(decoded.quantity, 3);
        assert_eq!(decoded.background, item.background);
    }

    #[test]
    fn test_group_round_trip_preserves_fields() {
        let mut garage = Group::new("Garage", 0, 1_000);
        garage.color = Some(vec![255, 0, 0]);
        garage.show_in_summary = true;

        let entity = Entity::Location(garage.clone());
        let decoded = decode(&encode(&entity)).unwrap().into_entity(7, 9_000);
        assert_eq!(decoded, entity);
    }

    #[test]
    fn test_absent_references_are_not_encoded() {
        let item = Item::new("Tape", 1, 0, 1_000);
        let record = encode(&Entity::Item(item));

        assert!(record.get(fields::LOCATION).is_none());
        assert!(record.get(fields::CATEGORY).is_none());
        assert!(record.get(fields::IMAGE_DATA).is_none());
        assert!(record.get(fields::SYMBOL_NAME).is_none());

        let mutation = decode(&record).unwrap();
        assert_eq!(mutation.desired_references(), Some((None, None)));
    }

    #[test]
    fn test_missing_quantity_drops_record() {
        let mut record = encode(&Entity::Item(drill()));
        record.fields.remove(fields::QUANTITY);
        assert_eq!(
            decode(&record),
            Err(DecodeError::MissingField(fields::QUANTITY))
        );
    }

    #[test]
    fn test_negative_quantity_drops_record() {
        let mut record = encode(&Entity::Item(drill()));
        record.set(fields::QUANTITY, RecordValue::Int(-1));
        assert!(matches!(
            decode(&record),
            Err(DecodeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_malformed_id_drops_record() {
        let mut record = encode(&Entity::Item(drill()));
        record.set(fields::ID, RecordValue::String("not-a-uuid".into()));
        assert!(matches!(decode(&record), Err(DecodeError::MalformedId(_))));
    }

    #[test]
    fn test_wrong_name_type_drops_record() {
        let mut record = encode(&Entity::Location(Group::new("Garage", 0, 1)));
        record.set(fields::NAME, RecordValue::Int(4));
        assert_eq!(
            decode(&record),
            Err(DecodeError::WrongType {
                field: fields::NAME,
                expected: "string",
                found: "int",
            })
        );
    }

    #[test]
    fn test_unknown_zone_reference_drops_only_that_field() {
        let item = drill();
        let mut record = encode(&Entity::Item(item.clone()));
        record.set(
            fields::LOCATION,
            RecordValue::Reference(RecordId::new(
                Uuid::new_v4().to_string(),
                ZoneId::new("Warehouses"),
            )),
        );

        let mutation = decode(&record).unwrap();
        assert_eq!(mutation.desired_references(), Some((None, item.category)));
    }

    #[test]
    fn test_record_in_wrong_zone_is_rejected() {
        let mut record = encode(&Entity::Item(drill()));
        record.id.zone = ZoneId::new("Locations");
        assert!(matches!(
            decode(&record),
            Err(DecodeError::ZoneMismatch { .. })
        ));
    }

    #[test]
    fn test_edit_time_survives_server_restamp() {
        let mut record = encode(&Entity::Item(drill()));
        record.modified_at_ms = Some(42_000);
        assert_eq!(decode(&record).unwrap().meta().modified_at_ms, Some(2_000));
    }

    #[test]
    fn test_server_time_fills_missing_edit_time() {
        let mut record = encode(&Entity::Item(drill()));
        record.fields.remove(fields::MODIFIED_DATE);
        record.modified_at_ms = Some(42_000);
        assert_eq!(decode(&record).unwrap().meta().modified_at_ms, Some(42_000));
    }

    mod round_trip {
        use crate::codec::{decode, encode};
        use crate::entity::{Background, Entity, Group, Item, Meta};
        use proptest::prelude::*;
        use uuid::Uuid;

        fn bytes() -> impl Strategy<Value = Vec<u8>> {
            proptest::collection::vec(any::<u8>(), 0..8)
        }

        fn meta_strategy() -> impl Strategy<Value = Meta> {
            (
                any::<u128>(),
                "[A-Za-z0-9 ]{0,16}",
                0i64..1_000,
                0u64..1 << 42,
                0u64..1 << 42,
            )
                .prop_map(|(id, name, sort_order, created_at_ms, modified_at_ms)| Meta {
                    id: Uuid::from_u128(id),
                    name,
                    sort_order,
                    created_at_ms,
                    modified_at_ms,
                })
        }

        fn background_strategy() -> impl Strategy<Value = Option<Background>> {
            prop_oneof![
                Just(None),
                bytes().prop_map(|data| Some(Background::Image(data))),
                ("[a-z.]{1,12}", proptest::option::of(bytes()))
                    .prop_map(|(name, tint)| Some(Background::Symbol { name, tint })),
            ]
        }

        fn group_strategy() -> impl Strategy<Value = Group> {
            (meta_strategy(), proptest::option::of(bytes()), any::<bool>()).prop_map(
                |(meta, color, show_in_summary)| Group {
                    meta,
                    color,
                    show_in_summary,
                },
            )
        }

        fn entity_strategy() -> impl Strategy<Value = Entity> {
            let item = (
                meta_strategy(),
                any::<u32>(),
                proptest::option::of(any::<u128>()),
                proptest::option::of(any::<u128>()),
                background_strategy(),
            )
                .prop_map(|(meta, quantity, location, category, background)| {
                    Entity::Item(Item {
                        meta,
                        quantity,
                        location: location.map(Uuid::from_u128),
                        category: category.map(Uuid::from_u128),
                        background,
                    })
                });
            prop_oneof![
                item,
                group_strategy().prop_map(Entity::Category),
                group_strategy().prop_map(Entity::Location),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

            #[test]
            fn test_decode_reproduces_every_encoded_field(entity in entity_strategy()) {
                let mutation = decode(&encode(&entity))
                    .unwrap_or_else(|e| panic!("decode failed: {e}"));

                prop_assert_eq!(mutation.kind, entity.kind());
                prop_assert_eq!(mutation.id, entity.id());
                prop_assert_eq!(
                    mutation.desired_references(),
                    entity.as_item().map(|item| (item.location, item.category))
                );

                // References are linked by the resolver, never by the codec
                let mut expected = entity.clone();
                if let Some(item) = expected.as_item_mut() {
                    item.location = None;
                    item.category = None;
                }
                prop_assert_eq!(mutation.into_entity(-1, 0), expected);
            }
        }
    }

    #[test]
    fn test_partial_update_keeps_absent_fields() {
        let mut local = Entity::Item(drill());
        let before = local.as_item().unwrap().clone();

        let mut record = Record::new("Item", record_id(EntityKind::Item, before.meta.id));
        record.set(fields::ID, RecordValue::String(before.meta.id.to_string()));
        record.set(fields::NAME, RecordValue::String("Cordless Drill".into()));
        record.set(fields::QUANTITY, RecordValue::Int(4));

        decode(&record).unwrap().apply_to(&mut local);
        let after = local.as_item().unwrap();

        assert_eq!(after.meta.name, "Cordless Drill");
        assert_eq!(after.quantity, 4);
        assert_eq!(after.meta.sort_order, before.meta.sort_order);
        assert_eq!(after.background, before.background);
        assert_eq!(after.location, before.location);
    }
}

//! Generic remote record representation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// An independent partition of the remote record store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(String);

impl ZoneId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ZoneId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary key of a record: its name within a zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub name: String,
    pub zone: ZoneId,
}

impl RecordId {
    pub fn new(name: impl Into<String>, zone: ZoneId) -> Self {
        Self {
            name: name.into(),
            zone,
        }
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone, self.name)
    }
}

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum RecordValue {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Reference(RecordId),
    /// Milliseconds since Unix epoch.
    Date(u64),
}

impl RecordValue {
    /// Name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            RecordValue::String(_) => "string",
            RecordValue::Int(_) => "int",
            RecordValue::Bool(_) => "bool",
            RecordValue::Bytes(_) => "bytes",
            RecordValue::Reference(_) => "reference",
            RecordValue::Date(_) => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub record_type: String,
    pub id: RecordId,
    pub fields: BTreeMap<String, RecordValue>,
    /// Assigned by the server; `None` until the record has been saved.
    pub modified_at_ms: Option<u64>,
}

impl Record {
    pub fn new(record_type: impl Into<String>, id: RecordId) -> Self {
        Self {
            record_type: record_type.into(),
            id,
            fields: BTreeMap::new(),
            modified_at_ms: None,
        }
    }

    pub fn set(&mut self, field: &str, value: RecordValue) {
        self.fields.insert(field.to_string(), value);
    }

    pub fn get(&self, field: &str) -> Option<&RecordValue> {
        self.fields.get(field)
    }
}

/// Opaque cursor marking how far a zone's change-fetch has progressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint(pub String);

impl Display for Checkpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_value_serialization_is_tagged() {
        let value = RecordValue::Reference(RecordId::new("abc", ZoneId::new("Locations")));
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("\"type\":\"reference\""));
        assert!(json.contains("\"zone\":\"Locations\""));

        let back: RecordValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_record_id_display() {
        let id = RecordId::new("abc", ZoneId::new("Items"));
        assert_eq!(id.to_string(), "Items/abc");
    }
}

use crate::model::{EntityRef, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A host entity row. Host fields are opaque to the eav layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: Id,
    pub content_type: String,
    pub fields: Map<String, JsonValue>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl EntityRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.content_type.clone(), self.id)
    }
}

/// A validated `{attribute, value}` pair from a write payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EavItem {
    pub attribute: String,
    pub value: JsonValue,
}

impl EavItem {
    pub fn new(attribute: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

/// Validated host-entity write: host fields plus the ordered fact sequence.
/// Create, full update and partial update all use this one shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityWrite {
    pub fields: Map<String, JsonValue>,
    pub eav: Vec<EavItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    /// Replace host fields.
    Replace,
    /// Merge host fields.
    Patch,
}

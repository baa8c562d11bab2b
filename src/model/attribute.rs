use crate::error::{EavError, EavResult};
use crate::model::{Datatype, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema declaration of one dynamically attachable field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: Id,
    pub name: String,
    pub slug: String,
    pub datatype: Datatype,
    pub enum_group_id: Option<Id>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Attribute {
    /// The enum group backing an enumeration attribute.
    ///
    /// An enum attribute without a group is a broken schema row and is reported,
    /// never coerced to another datatype.
    pub fn require_enum_group(&self) -> EavResult<Id> {
        match (self.datatype, self.enum_group_id) {
            (Datatype::Enum, Some(group_id)) => Ok(group_id),
            (Datatype::Enum, None) => Err(EavError::SchemaInconsistency {
                slug: self.slug.clone(),
            }),
            (datatype, _) => Err(EavError::Conflict(format!(
                "attribute '{}' has datatype {}, not enum",
                self.slug, datatype
            ))),
        }
    }

    /// `enum_group_id` is set exactly when the datatype is `enum`.
    pub fn is_consistent(&self) -> bool {
        self.datatype.is_enum() == self.enum_group_id.is_some()
    }
}

/// Row to insert into the attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttribute {
    pub name: String,
    pub slug: String,
    pub datatype: Datatype,
    pub enum_group_id: Option<Id>,
}

impl NewAttribute {
    /// Attribute materialized by the first fact write for an unseen slug.
    pub fn enumeration(slug: &str, enum_group_id: Id) -> Self {
        Self {
            name: slug.to_string(),
            slug: slug.to_string(),
            datatype: Datatype::Enum,
            enum_group_id: Some(enum_group_id),
        }
    }
}

/// Attribute declaration input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeInput {
    pub name: String,
    /// Defaults to the slugified name.
    pub slug: Option<String>,
    /// Defaults to `enum`.
    pub datatype: Option<Datatype>,
    /// Allowed literals; only valid for enum attributes.
    #[serde(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub name: Option<String>,
    #[serde(default)]
    pub choices: Vec<String>,
}

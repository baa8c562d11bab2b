use crate::model::Id;
use serde::{Deserialize, Serialize};

/// One literal an enumeration attribute may take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub id: Id,
    pub value: String,
}

/// A named set of enum values shared by every attribute pointing at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumGroup {
    pub id: Id,
    pub name: String,
    /// Members ordered by id.
    pub values: Vec<EnumValue>,
}

impl EnumGroup {
    pub fn literals(&self) -> Vec<&str> {
        self.values.iter().map(|v| v.value.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnumValue {
    pub value: String,
}

/// Enum group input. Get-or-create on `name`; each literal is resolved
/// inside the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnumGroup {
    pub name: String,
    #[serde(default)]
    pub values: Vec<NewEnumValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnumGroupUpdate {
    pub name: Option<String>,
    /// Literals to add; existing members are kept.
    #[serde(default)]
    pub values: Vec<NewEnumValue>,
}

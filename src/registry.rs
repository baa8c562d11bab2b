//! Registry of host entity types that carry eav facts.
//!
//! Entity types are enabled once at startup through [`EavRegistryBuilder::enable`].
//! The built [`EavRegistry`] is immutable and shared by reference with the
//! read and write paths, which use it to map a route name to the content-type
//! tag stored on value rows and to the accessor key of the flat representation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{EavError, EavResult, RegistrationError};
use crate::model::{EntityRef, Id, CHARFIELD_LENGTH};

pub const DEFAULT_ACCESSOR: &str = "eav";

fn default_accessor() -> String {
    DEFAULT_ACCESSOR.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

impl FieldDescriptor {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: false,
        }
    }
}

/// Structural description of a persistent host entity type.
///
/// An empty `fields` list accepts any host fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl EntityDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterOptions {
    /// Key of the flat fact map in read and write payloads.
    #[serde(default = "default_accessor")]
    pub accessor: String,
    /// Tag stored in `eav_value.entity_ct`; defaults to the descriptor name.
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            accessor: default_accessor(),
            content_type: None,
        }
    }
}

/// Capability handed out for an enabled entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEntity {
    descriptor: EntityDescriptor,
    accessor: String,
    content_type: String,
}

impl RegisteredEntity {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn accessor(&self) -> &str {
        &self.accessor
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.descriptor.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.descriptor.fields.iter().find(|f| f.name == name)
    }

    pub fn declares_fields(&self) -> bool {
        !self.descriptor.fields.is_empty()
    }

    /// Reverse-relation key: the polymorphic reference value rows carry.
    pub fn entity_ref(&self, id: Id) -> EntityRef {
        EntityRef::new(self.content_type.clone(), id)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    name.len() <= CHARFIELD_LENGTH && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Default)]
pub struct EavRegistryBuilder {
    entries: BTreeMap<String, RegisteredEntity>,
}

impl EavRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable eav facts on a host entity type.
    ///
    /// Re-enabling an identical registration is a no-op; anything that does not
    /// qualify as a persistent entity, or contradicts an earlier registration,
    /// is rejected.
    pub fn enable(
        &mut self,
        descriptor: EntityDescriptor,
        options: RegisterOptions,
    ) -> Result<&mut Self, RegistrationError> {
        if !is_identifier(&descriptor.name) {
            return Err(RegistrationError::InvalidName(descriptor.name));
        }
        if !is_identifier(&options.accessor) {
            return Err(RegistrationError::InvalidAccessor {
                entity: descriptor.name,
                accessor: options.accessor,
            });
        }

        let mut seen = Vec::with_capacity(descriptor.fields.len());
        for field in &descriptor.fields {
            let reason = if !is_identifier(&field.name) {
                Some("is not a valid identifier")
            } else if field.name == "id" {
                Some("collides with the primary key")
            } else if field.name == options.accessor {
                Some("collides with the eav accessor")
            } else if seen.contains(&field.name.as_str()) {
                Some("is declared twice")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(RegistrationError::InvalidField {
                    entity: descriptor.name.clone(),
                    field: field.name.clone(),
                    reason,
                });
            }
            seen.push(field.name.as_str());
        }

        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| descriptor.name.clone());
        if content_type.is_empty() || content_type.len() > CHARFIELD_LENGTH {
            return Err(RegistrationError::InvalidName(content_type));
        }

        let entry = RegisteredEntity {
            descriptor,
            accessor: options.accessor,
            content_type,
        };

        if let Some(existing) = self.entries.get(entry.name()) {
            if existing == &entry {
                return Ok(self);
            }
            return Err(RegistrationError::Conflicting(entry.name().to_string()));
        }
        if let Some(other) = self
            .entries
            .values()
            .find(|other| other.content_type == entry.content_type)
        {
            return Err(RegistrationError::ContentTypeTaken {
                content_type: entry.content_type.clone(),
                existing: other.name().to_string(),
            });
        }

        log::debug!(
            "Enabled eav on '{}' (content type '{}', accessor '{}')",
            entry.name(),
            entry.content_type,
            entry.accessor
        );
        self.entries.insert(entry.name().to_string(), entry);
        Ok(self)
    }

    pub fn build(self) -> EavRegistry {
        let by_content_type = self
            .entries
            .values()
            .map(|entry| (entry.content_type.clone(), entry.name().to_string()))
            .collect();
        EavRegistry {
            entries: self.entries,
            by_content_type,
        }
    }
}

/// Immutable map of enabled entity types.
#[derive(Debug, Clone, Default)]
pub struct EavRegistry {
    entries: BTreeMap<String, RegisteredEntity>,
    by_content_type: HashMap<String, String>,
}

impl EavRegistry {
    pub fn builder() -> EavRegistryBuilder {
        EavRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredEntity> {
        self.entries.get(name)
    }

    pub fn require(&self, name: &str) -> EavResult<&RegisteredEntity> {
        self.get(name)
            .ok_or_else(|| EavError::UnknownEntityType(name.to_string()))
    }

    pub fn by_content_type(&self, content_type: &str) -> Option<&RegisteredEntity> {
        self.by_content_type
            .get(content_type)
            .and_then(|name| self.entries.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredEntity> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

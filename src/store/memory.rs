use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Attribute, EntityRecord, EntityRef, EnumGroup, EnumValue, Fact, Id, NewAttribute, NewValue,
    Value, ValueData,
};
use crate::store::traits::{
    AttributeStore, EavTransaction, EntityStore, EnumStore, Store, TransactionalStore, ValueStore,
};

#[derive(Debug, Clone, Default)]
struct Sequences {
    attribute: Id,
    enum_group: Id,
    enum_value: Id,
    value: Id,
    entity: Id,
}

fn next_id(sequence: &mut Id) -> Id {
    *sequence += 1;
    *sequence
}

/// Tables of the in-memory store, with the same constraints as the SQL schema.
#[derive(Debug, Clone, Default)]
struct MemoryState {
    attributes: BTreeMap<Id, Attribute>,
    enum_groups: BTreeMap<Id, String>,
    /// (group id, enum value id)
    memberships: BTreeSet<(Id, Id)>,
    enum_values: BTreeMap<Id, EnumValue>,
    values: BTreeMap<Id, Value>,
    entities: BTreeMap<Id, EntityRecord>,
    sequences: Sequences,
}

impl MemoryState {
    fn attribute_by_slug(&self, slug: &str) -> Option<&Attribute> {
        self.attributes.values().find(|a| a.slug == slug)
    }

    fn group_values(&self, group_id: Id) -> Vec<EnumValue> {
        self.memberships
            .range((group_id, Id::MIN)..=(group_id, Id::MAX))
            .filter_map(|(_, value_id)| self.enum_values.get(value_id).cloned())
            .collect()
    }

    fn enum_group(&self, id: Id) -> Option<EnumGroup> {
        self.enum_groups.get(&id).map(|name| EnumGroup {
            id,
            name: name.clone(),
            values: self.group_values(id),
        })
    }

    fn fact(&self, value: &Value) -> Option<Fact> {
        let attribute = self.attributes.get(&value.attribute_id)?.clone();
        let enum_literal = match value.data {
            Some(ValueData::Enum(id)) => self.enum_values.get(&id).map(|v| v.value.clone()),
            _ => None,
        };
        Some(Fact {
            attribute,
            value: value.clone(),
            enum_literal,
        })
    }

    fn check_attribute(&self, attribute: &NewAttribute) -> StoreResult<()> {
        if attribute.datatype.is_enum() != attribute.enum_group_id.is_some() {
            return Err(StoreError::CheckViolation {
                constraint: "eav_attribute_enum_group_check".to_string(),
            });
        }
        if let Some(group_id) = attribute.enum_group_id {
            if !self.enum_groups.contains_key(&group_id) {
                return Err(StoreError::ForeignKeyViolation {
                    constraint: "eav_attribute_enum_group_id_fkey".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Process-local store used by the test suite and for running without Postgres.
///
/// A unit of work holds the store lock until it commits or rolls back, so units
/// of work are fully serialized. Reads through the store wait for any open unit
/// of work to finish.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start enum value ids after `floor`, like the bootstrap sequence step.
    pub fn with_enum_value_floor(floor: Id) -> Self {
        let mut state = MemoryState::default();
        state.sequences.enum_value = floor.max(0);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Number of value rows, across all entities.
    pub async fn value_row_count(&self) -> usize {
        self.state.lock().await.values.len()
    }

    /// Number of group memberships, across all groups.
    pub async fn membership_count(&self) -> usize {
        self.state.lock().await.memberships.len()
    }
}

#[async_trait::async_trait]
impl AttributeStore for MemoryStore {
    async fn get_attribute(&self, id: Id) -> StoreResult<Option<Attribute>> {
        Ok(self.state.lock().await.attributes.get(&id).cloned())
    }

    async fn get_attribute_by_slug(&self, slug: &str) -> StoreResult<Option<Attribute>> {
        Ok(self.state.lock().await.attribute_by_slug(slug).cloned())
    }

    async fn list_attributes(&self) -> StoreResult<Vec<Attribute>> {
        Ok(self.state.lock().await.attributes.values().cloned().collect())
    }

    async fn delete_attribute(&self, id: Id) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.values.values().any(|v| v.attribute_id == id) {
            return Err(StoreError::ForeignKeyViolation {
                constraint: "eav_value_attribute_id_fkey".to_string(),
            });
        }
        Ok(state.attributes.remove(&id).is_some())
    }
}

#[async_trait::async_trait]
impl EnumStore for MemoryStore {
    async fn get_enum_group(&self, id: Id) -> StoreResult<Option<EnumGroup>> {
        Ok(self.state.lock().await.enum_group(id))
    }

    async fn list_enum_groups(&self) -> StoreResult<Vec<EnumGroup>> {
        let state = self.state.lock().await;
        Ok(state
            .enum_groups
            .keys()
            .filter_map(|id| state.enum_group(*id))
            .collect())
    }

    async fn delete_enum_group(&self, id: Id) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.attributes.values().any(|a| a.enum_group_id == Some(id)) {
            return Err(StoreError::ForeignKeyViolation {
                constraint: "eav_attribute_enum_group_id_fkey".to_string(),
            });
        }
        state.memberships.retain(|(group_id, _)| *group_id != id);
        Ok(state.enum_groups.remove(&id).is_some())
    }

    async fn get_enum_value(&self, id: Id) -> StoreResult<Option<EnumValue>> {
        Ok(self.state.lock().await.enum_values.get(&id).cloned())
    }

    async fn list_enum_values(&self) -> StoreResult<Vec<EnumValue>> {
        Ok(self.state.lock().await.enum_values.values().cloned().collect())
    }

    async fn delete_enum_value(&self, id: Id) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.enum_values.remove(&id).is_none() {
            return Ok(false);
        }
        state.memberships.retain(|(_, value_id)| *value_id != id);
        for value in state.values.values_mut() {
            if value.data == Some(ValueData::Enum(id)) {
                value.data = None;
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl ValueStore for MemoryStore {
    async fn list_facts(&self, entity: &EntityRef) -> StoreResult<Vec<Fact>> {
        let state = self.state.lock().await;
        let mut facts: Vec<Fact> = state
            .values
            .values()
            .filter(|v| &v.entity == entity)
            .filter_map(|v| state.fact(v))
            .collect();
        facts.sort_by(|a, b| a.attribute.slug.cmp(&b.attribute.slug));
        Ok(facts)
    }

    async fn list_facts_for_content_type(&self, content_type: &str) -> StoreResult<Vec<Fact>> {
        let state = self.state.lock().await;
        let mut facts: Vec<Fact> = state
            .values
            .values()
            .filter(|v| v.entity.content_type == content_type)
            .filter_map(|v| state.fact(v))
            .collect();
        facts.sort_by(|a, b| {
            a.value
                .entity
                .id
                .cmp(&b.value.entity.id)
                .then_with(|| a.attribute.slug.cmp(&b.attribute.slug))
        });
        Ok(facts)
    }

    async fn count_values_for_attribute(&self, attribute_id: Id) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .values
            .values()
            .filter(|v| v.attribute_id == attribute_id)
            .count() as i64)
    }
}

#[async_trait::async_trait]
impl EntityStore for MemoryStore {
    async fn get_entity(&self, content_type: &str, id: Id) -> StoreResult<Option<EntityRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .get(&id)
            .filter(|e| e.content_type == content_type)
            .cloned())
    }

    async fn list_entities(&self, content_type: &str) -> StoreResult<Vec<EntityRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .entities
            .values()
            .filter(|e| e.content_type == content_type)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl TransactionalStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn EavTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

impl Store for MemoryStore {}

/// Exclusive unit of work over the in-memory tables.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    /// State before the unit of work; restored unless committed.
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait::async_trait]
impl EavTransaction for MemoryTransaction {
    async fn find_attribute(&mut self, id: Id) -> StoreResult<Option<Attribute>> {
        Ok(self.guard.attributes.get(&id).cloned())
    }

    async fn find_attribute_by_slug(&mut self, slug: &str) -> StoreResult<Option<Attribute>> {
        Ok(self.guard.attribute_by_slug(slug).cloned())
    }

    async fn get_or_create_attribute(
        &mut self,
        attribute: &NewAttribute,
    ) -> StoreResult<(Attribute, bool)> {
        if let Some(existing) = self.guard.attribute_by_slug(&attribute.slug) {
            return Ok((existing.clone(), false));
        }
        self.guard.check_attribute(attribute)?;

        let state = &mut *self.guard;
        let now = Utc::now();
        let created = Attribute {
            id: next_id(&mut state.sequences.attribute),
            name: attribute.name.clone(),
            slug: attribute.slug.clone(),
            datatype: attribute.datatype,
            enum_group_id: attribute.enum_group_id,
            created: now,
            modified: now,
        };
        state.attributes.insert(created.id, created.clone());
        Ok((created, true))
    }

    async fn rename_attribute(&mut self, id: Id, name: &str) -> StoreResult<Option<Attribute>> {
        Ok(self.guard.attributes.get_mut(&id).map(|attribute| {
            attribute.name = name.to_string();
            attribute.modified = Utc::now();
            attribute.clone()
        }))
    }

    async fn get_or_create_enum_group(&mut self, name: &str) -> StoreResult<(Id, bool)> {
        if let Some((id, _)) = self.guard.enum_groups.iter().find(|(_, n)| n.as_str() == name) {
            return Ok((*id, false));
        }
        let state = &mut *self.guard;
        let id = next_id(&mut state.sequences.enum_group);
        state.enum_groups.insert(id, name.to_string());
        Ok((id, true))
    }

    async fn lock_enum_group(&mut self, id: Id) -> StoreResult<bool> {
        Ok(self.guard.enum_groups.contains_key(&id))
    }

    async fn rename_enum_group(&mut self, id: Id, name: &str) -> StoreResult<bool> {
        if self
            .guard
            .enum_groups
            .iter()
            .any(|(other, n)| *other != id && n.as_str() == name)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "eav_enumgroup_name_key".to_string(),
            });
        }
        Ok(match self.guard.enum_groups.get_mut(&id) {
            Some(current) => {
                *current = name.to_string();
                true
            }
            None => false,
        })
    }

    async fn find_group_member(
        &mut self,
        group_id: Id,
        literal: &str,
    ) -> StoreResult<Option<EnumValue>> {
        Ok(self
            .guard
            .group_values(group_id)
            .into_iter()
            .find(|v| v.value == literal))
    }

    async fn insert_enum_value(&mut self, literal: &str) -> StoreResult<EnumValue> {
        let state = &mut *self.guard;
        let value = EnumValue {
            id: next_id(&mut state.sequences.enum_value),
            value: literal.to_string(),
        };
        state.enum_values.insert(value.id, value.clone());
        Ok(value)
    }

    async fn update_enum_value(&mut self, id: Id, literal: &str) -> StoreResult<Option<EnumValue>> {
        Ok(self.guard.enum_values.get_mut(&id).map(|value| {
            value.value = literal.to_string();
            value.clone()
        }))
    }

    async fn enum_value_groups(&mut self, value_id: Id) -> StoreResult<Vec<Id>> {
        Ok(self
            .guard
            .memberships
            .iter()
            .filter(|(_, member)| *member == value_id)
            .map(|(group_id, _)| *group_id)
            .collect())
    }

    async fn add_group_member(&mut self, group_id: Id, value_id: Id) -> StoreResult<bool> {
        if !self.guard.enum_groups.contains_key(&group_id)
            || !self.guard.enum_values.contains_key(&value_id)
        {
            return Err(StoreError::ForeignKeyViolation {
                constraint: "eav_enumgroup_values_fkey".to_string(),
            });
        }
        Ok(self.guard.memberships.insert((group_id, value_id)))
    }

    async fn upsert_value(&mut self, value: &NewValue) -> StoreResult<(Value, bool)> {
        if !self.guard.attributes.contains_key(&value.attribute_id) {
            return Err(StoreError::ForeignKeyViolation {
                constraint: "eav_value_attribute_id_fkey".to_string(),
            });
        }
        if let ValueData::Enum(enum_id) = value.data {
            if !self.guard.enum_values.contains_key(&enum_id) {
                return Err(StoreError::ForeignKeyViolation {
                    constraint: "eav_value_value_enum_id_fkey".to_string(),
                });
            }
        }

        let state = &mut *self.guard;
        if let Some(existing) = state
            .values
            .values_mut()
            .find(|v| v.attribute_id == value.attribute_id && v.entity == value.entity)
        {
            existing.data = Some(value.data.clone());
            return Ok((existing.clone(), false));
        }

        let created = Value {
            id: next_id(&mut state.sequences.value),
            attribute_id: value.attribute_id,
            entity: value.entity.clone(),
            data: Some(value.data.clone()),
        };
        state.values.insert(created.id, created.clone());
        Ok((created, true))
    }

    async fn delete_values_for_entity(&mut self, entity: &EntityRef) -> StoreResult<u64> {
        let before = self.guard.values.len();
        self.guard.values.retain(|_, v| &v.entity != entity);
        Ok((before - self.guard.values.len()) as u64)
    }

    async fn insert_entity(
        &mut self,
        content_type: &str,
        fields: &Map<String, JsonValue>,
    ) -> StoreResult<EntityRecord> {
        let state = &mut *self.guard;
        let now = Utc::now();
        let record = EntityRecord {
            id: next_id(&mut state.sequences.entity),
            content_type: content_type.to_string(),
            fields: fields.clone(),
            created: now,
            modified: now,
        };
        state.entities.insert(record.id, record.clone());
        Ok(record)
    }

    async fn lock_entity(&mut self, content_type: &str, id: Id) -> StoreResult<Option<EntityRecord>> {
        Ok(self
            .guard
            .entities
            .get(&id)
            .filter(|e| e.content_type == content_type)
            .cloned())
    }

    async fn update_entity_fields(
        &mut self,
        content_type: &str,
        id: Id,
        fields: &Map<String, JsonValue>,
    ) -> StoreResult<Option<EntityRecord>> {
        Ok(self
            .guard
            .entities
            .get_mut(&id)
            .filter(|e| e.content_type == content_type)
            .map(|record| {
                record.fields = fields.clone();
                record.modified = Utc::now();
                record.clone()
            }))
    }

    async fn delete_entity(&mut self, content_type: &str, id: Id) -> StoreResult<bool> {
        let matches = self
            .guard
            .entities
            .get(&id)
            .is_some_and(|e| e.content_type == content_type);
        if matches {
            self.guard.entities.remove(&id);
        }
        Ok(matches)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        // Dropping restores the snapshot.
        Ok(())
    }
}

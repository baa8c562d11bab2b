use serde_json::{Map, Value as JsonValue};

use crate::error::StoreResult;
use crate::model::{
    Attribute, EntityRecord, EntityRef, EnumGroup, EnumValue, Fact, Id, NewAttribute, NewValue,
    Value,
};

#[async_trait::async_trait]
pub trait AttributeStore: Send + Sync {
    async fn get_attribute(&self, id: Id) -> StoreResult<Option<Attribute>>;
    async fn get_attribute_by_slug(&self, slug: &str) -> StoreResult<Option<Attribute>>;
    async fn list_attributes(&self) -> StoreResult<Vec<Attribute>>;
    /// Fails with a foreign key violation while value rows reference the attribute.
    async fn delete_attribute(&self, id: Id) -> StoreResult<bool>;
}

#[async_trait::async_trait]
pub trait EnumStore: Send + Sync {
    async fn get_enum_group(&self, id: Id) -> StoreResult<Option<EnumGroup>>;
    async fn list_enum_groups(&self) -> StoreResult<Vec<EnumGroup>>;
    /// Drops the group's memberships; fails while an attribute references it.
    async fn delete_enum_group(&self, id: Id) -> StoreResult<bool>;
    async fn get_enum_value(&self, id: Id) -> StoreResult<Option<EnumValue>>;
    async fn list_enum_values(&self) -> StoreResult<Vec<EnumValue>>;
    /// Value rows pointing at the deleted literal keep their row with no data.
    async fn delete_enum_value(&self, id: Id) -> StoreResult<bool>;
}

/// Reverse relation from entities to their value rows.
#[async_trait::async_trait]
pub trait ValueStore: Send + Sync {
    /// Facts of one entity, ordered by attribute slug.
    async fn list_facts(&self, entity: &EntityRef) -> StoreResult<Vec<Fact>>;
    /// Facts of every entity of one content type, ordered by entity id then slug.
    async fn list_facts_for_content_type(&self, content_type: &str) -> StoreResult<Vec<Fact>>;
    async fn count_values_for_attribute(&self, attribute_id: Id) -> StoreResult<i64>;
}

#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, content_type: &str, id: Id) -> StoreResult<Option<EntityRecord>>;
    async fn list_entities(&self, content_type: &str) -> StoreResult<Vec<EntityRecord>>;
}

#[async_trait::async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Start a unit of work. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> StoreResult<Box<dyn EavTransaction>>;
}

/// Write side of the store, scoped to one atomic unit of work.
#[async_trait::async_trait]
pub trait EavTransaction: Send {
    async fn find_attribute(&mut self, id: Id) -> StoreResult<Option<Attribute>>;
    async fn find_attribute_by_slug(&mut self, slug: &str) -> StoreResult<Option<Attribute>>;
    /// Insert keyed on slug; when the slug exists the stored row wins.
    /// Returns the row and whether it was created.
    async fn get_or_create_attribute(&mut self, attribute: &NewAttribute)
        -> StoreResult<(Attribute, bool)>;
    async fn rename_attribute(&mut self, id: Id, name: &str) -> StoreResult<Option<Attribute>>;

    /// Insert keyed on name. Returns the group id and whether it was created.
    async fn get_or_create_enum_group(&mut self, name: &str) -> StoreResult<(Id, bool)>;
    /// Serialize literal resolution within a group. `false` if the group is gone.
    async fn lock_enum_group(&mut self, id: Id) -> StoreResult<bool>;
    async fn rename_enum_group(&mut self, id: Id, name: &str) -> StoreResult<bool>;
    async fn find_group_member(&mut self, group_id: Id, literal: &str)
        -> StoreResult<Option<EnumValue>>;
    async fn insert_enum_value(&mut self, literal: &str) -> StoreResult<EnumValue>;
    async fn update_enum_value(&mut self, id: Id, literal: &str) -> StoreResult<Option<EnumValue>>;
    /// Ids of the groups the literal belongs to, ascending.
    async fn enum_value_groups(&mut self, value_id: Id) -> StoreResult<Vec<Id>>;
    /// Membership is a set; returns whether the pair was added.
    async fn add_group_member(&mut self, group_id: Id, value_id: Id) -> StoreResult<bool>;

    /// Get-or-create on (attribute, entity), then overwrite the typed column.
    async fn upsert_value(&mut self, value: &NewValue) -> StoreResult<(Value, bool)>;
    async fn delete_values_for_entity(&mut self, entity: &EntityRef) -> StoreResult<u64>;

    async fn insert_entity(
        &mut self,
        content_type: &str,
        fields: &Map<String, JsonValue>,
    ) -> StoreResult<EntityRecord>;
    /// Fetch an entity and hold it for the rest of the unit of work.
    async fn lock_entity(&mut self, content_type: &str, id: Id) -> StoreResult<Option<EntityRecord>>;
    async fn update_entity_fields(
        &mut self,
        content_type: &str,
        id: Id,
        fields: &Map<String, JsonValue>,
    ) -> StoreResult<Option<EntityRecord>>;
    async fn delete_entity(&mut self, content_type: &str, id: Id) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

pub trait Store:
    AttributeStore + EnumStore + ValueStore + EntityStore + TransactionalStore + Send + Sync
{
}

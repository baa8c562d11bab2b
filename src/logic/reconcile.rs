//! Flat `{slug: value}` representation to and from normalized rows.

use itertools::Itertools;
use log::warn;
use serde_json::{Map, Value as JsonValue};
use std::future::Future;
use std::sync::Arc;

use crate::error::{EavError, EavResult};
use crate::logic::resolve::apply_facts;
use crate::logic::validate::validate_write;
use crate::model::{EntityRecord, EntityWrite, Fact, Id, WriteMode};
use crate::registry::{EavRegistry, RegisteredEntity};
use crate::store::{EavTransaction, Store};

/// Entry point for every eav operation. Holds the store, the immutable
/// registry and the retry budget for units of work.
pub struct EavService<S> {
    store: Arc<S>,
    registry: Arc<EavRegistry>,
    max_retries: u32,
}

impl<S> Clone for EavService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            max_retries: self.max_retries,
        }
    }
}

/// Commit on success, roll back explicitly on failure.
pub(crate) async fn finish<T>(
    tx: Box<dyn EavTransaction>,
    result: EavResult<T>,
) -> EavResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed after '{}': {}", err, rollback_err);
            }
            Err(err)
        }
    }
}

impl<S: Store> EavService<S> {
    pub fn new(store: Arc<S>, registry: Arc<EavRegistry>, max_retries: u32) -> Self {
        Self {
            store,
            registry,
            max_retries,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run a whole unit of work again when it lost a race with a concurrent writer.
    pub(crate) async fn retrying<T, F, Fut>(&self, operation: &str, mut attempt: F) -> EavResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EavResult<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(err) if err.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        "Retrying {} ({}/{}) after: {}",
                        operation, retries, self.max_retries, err
                    );
                }
                result => return result,
            }
        }
    }

    /// Build the flat representation: `id`, host fields, then the accessor map.
    /// Facts that cannot be shown are left out.
    fn represent(entity: &RegisteredEntity, record: &EntityRecord, facts: &[Fact]) -> JsonValue {
        let mut object = Map::new();
        object.insert("id".to_string(), JsonValue::from(record.id));
        for (key, value) in &record.fields {
            object.insert(key.clone(), value.clone());
        }

        let mut flat = Map::new();
        for fact in facts {
            match fact.flat_value() {
                Some(value) => {
                    flat.insert(fact.attribute.slug.clone(), value);
                }
                None => warn!(
                    "Omitting orphaned fact '{}' on {} (value id {})",
                    fact.attribute.slug, fact.value.entity, fact.value.id
                ),
            }
        }
        object.insert(entity.accessor().to_string(), JsonValue::Object(flat));
        JsonValue::Object(object)
    }

    async fn try_create(
        &self,
        entity: &RegisteredEntity,
        write: &EntityWrite,
    ) -> EavResult<EntityRecord> {
        let mut tx = self.store.begin().await?;
        let result = async {
            let record = tx.insert_entity(entity.content_type(), &write.fields).await?;
            apply_facts(tx.as_mut(), &record.entity_ref(), &write.eav).await?;
            Ok::<_, EavError>(record)
        }
        .await;
        finish(tx, result).await
    }

    async fn try_update(
        &self,
        entity: &RegisteredEntity,
        id: Id,
        write: &EntityWrite,
        mode: WriteMode,
    ) -> EavResult<EntityRecord> {
        let mut tx = self.store.begin().await?;
        let result = async {
            let current = tx
                .lock_entity(entity.content_type(), id)
                .await?
                .ok_or_else(|| EavError::not_found("entity", entity.entity_ref(id)))?;

            let fields = match mode {
                WriteMode::Patch => {
                    let mut merged = current.fields.clone();
                    merged.extend(write.fields.clone());
                    merged
                }
                WriteMode::Create | WriteMode::Replace => write.fields.clone(),
            };
            let record = tx
                .update_entity_fields(entity.content_type(), id, &fields)
                .await?
                .ok_or_else(|| EavError::not_found("entity", entity.entity_ref(id)))?;
            apply_facts(tx.as_mut(), &record.entity_ref(), &write.eav).await?;
            Ok::<_, EavError>(record)
        }
        .await;
        finish(tx, result).await
    }

    async fn try_delete(&self, entity: &RegisteredEntity, id: Id) -> EavResult<u64> {
        let mut tx = self.store.begin().await?;
        let result = async {
            if tx.lock_entity(entity.content_type(), id).await?.is_none() {
                return Err(EavError::not_found("entity", entity.entity_ref(id)));
            }
            let removed = tx.delete_values_for_entity(&entity.entity_ref(id)).await?;
            tx.delete_entity(entity.content_type(), id).await?;
            Ok::<_, EavError>(removed)
        }
        .await;
        finish(tx, result).await
    }

    async fn represent_record(
        &self,
        entity: &RegisteredEntity,
        record: &EntityRecord,
    ) -> EavResult<JsonValue> {
        let facts = self.store.list_facts(&record.entity_ref()).await?;
        Ok(Self::represent(entity, record, &facts))
    }

    /// Create a host entity and its facts in one unit of work.
    pub async fn create(&self, entity_type: &str, body: &JsonValue) -> EavResult<JsonValue> {
        let entity = self.registry.require(entity_type)?;
        let write = validate_write(entity, body, WriteMode::Create)?;
        let write = &write;

        let record = self
            .retrying("create", || self.try_create(entity, write))
            .await?;
        log::info!(
            "Created {} with {} facts",
            record.entity_ref(),
            write.eav.len()
        );
        self.represent_record(entity, &record).await
    }

    /// Update host fields and upsert the given facts in one unit of work.
    /// Facts not mentioned are left as they are.
    pub async fn update(
        &self,
        entity_type: &str,
        id: Id,
        body: &JsonValue,
        mode: WriteMode,
    ) -> EavResult<JsonValue> {
        let entity = self.registry.require(entity_type)?;
        let write = validate_write(entity, body, mode)?;
        let write = &write;

        let record = self
            .retrying("update", || self.try_update(entity, id, write, mode))
            .await?;
        self.represent_record(entity, &record).await
    }

    pub async fn read(&self, entity_type: &str, id: Id) -> EavResult<JsonValue> {
        let entity = self.registry.require(entity_type)?;
        let record = self
            .store
            .get_entity(entity.content_type(), id)
            .await?
            .ok_or_else(|| EavError::not_found("entity", entity.entity_ref(id)))?;
        self.represent_record(entity, &record).await
    }

    pub async fn list(&self, entity_type: &str) -> EavResult<Vec<JsonValue>> {
        let entity = self.registry.require(entity_type)?;
        let records = self.store.list_entities(entity.content_type()).await?;
        let mut facts = self
            .store
            .list_facts_for_content_type(entity.content_type())
            .await?
            .into_iter()
            .into_group_map_by(|fact| fact.value.entity.id);

        Ok(records
            .iter()
            .map(|record| {
                let facts = facts.remove(&record.id).unwrap_or_default();
                Self::represent(entity, record, &facts)
            })
            .collect())
    }

    /// Delete a host entity together with its facts.
    pub async fn delete(&self, entity_type: &str, id: Id) -> EavResult<()> {
        let entity = self.registry.require(entity_type)?;
        let removed = self
            .retrying("delete", || self.try_delete(entity, id))
            .await?;
        log::info!(
            "Deleted {} and {} facts",
            entity.entity_ref(id),
            removed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::model::{AttributeInput, Datatype, EntityRef};
    use crate::registry::{EntityDescriptor, FieldDescriptor, RegisterOptions};
    use crate::store::{AttributeStore, EntityStore, EnumStore, MemoryStore, ValueStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service() -> (EavService<MemoryStore>, Arc<MemoryStore>) {
        let mut builder = EavRegistry::builder();
        builder
            .enable(
                EntityDescriptor::new("example_model").with_field(FieldDescriptor::required("name")),
                RegisterOptions::default(),
            )
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        (
            EavService::new(store.clone(), Arc::new(builder.build()), 3),
            store,
        )
    }

    fn entity_id(representation: &JsonValue) -> Id {
        representation["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn create_then_read_round_trips_the_flat_map() {
        let (service, _) = service();
        let created = service
            .create(
                "example_model",
                &json!({"name": "E1", "eav": [{"attribute": "color", "value": "red"}]}),
            )
            .await
            .unwrap();
        assert_eq!(created["eav"], json!({"color": "red"}));

        let read = service.read("example_model", entity_id(&created)).await.unwrap();
        assert_eq!(read, json!({"id": entity_id(&created), "name": "E1", "eav": {"color": "red"}}));
    }

    #[tokio::test]
    async fn writing_the_same_fact_twice_is_idempotent() {
        let (service, store) = service();
        let body = json!({"name": "E1", "eav": [{"attribute": "color", "value": "red"}]});
        let created = service.create("example_model", &body).await.unwrap();
        service
            .update("example_model", entity_id(&created), &body, WriteMode::Replace)
            .await
            .unwrap();

        assert_eq!(store.value_row_count().await, 1);
        assert_eq!(store.membership_count().await, 1);
    }

    #[tokio::test]
    async fn update_overwrites_the_existing_value_row() {
        let (service, store) = service();
        let created = service
            .create(
                "example_model",
                &json!({"name": "E1", "eav": [{"attribute": "color", "value": "red"}]}),
            )
            .await
            .unwrap();
        let id = entity_id(&created);
        let updated = service
            .update(
                "example_model",
                id,
                &json!({"eav": [{"attribute": "color", "value": "blue"}]}),
                WriteMode::Patch,
            )
            .await
            .unwrap();
        assert_eq!(updated["eav"], json!({"color": "blue"}));
        assert_eq!(updated["name"], json!("E1"));

        let facts = store
            .list_facts(&EntityRef::new("example_model", id))
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].enum_literal.as_deref(), Some("blue"));
    }

    #[tokio::test]
    async fn concurrent_first_writes_converge_on_one_attribute() {
        let (service, store) = service();
        let body = json!({"name": "E", "eav": [{"attribute": "material", "value": "oak"}]});
        let (first, second) = tokio::join!(
            service.create("example_model", &body),
            service.create("example_model", &body)
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(store.list_attributes().await.unwrap().len(), 1);
        let groups = store.list_enum_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].literals(), vec!["oak"]);
        assert_eq!(store.membership_count().await, 1);
    }

    #[tokio::test]
    async fn new_groups_do_not_share_literals() {
        let (service, store) = service();
        service
            .create(
                "example_model",
                &json!({"name": "E1", "eav": [
                    {"attribute": "size", "value": "large"},
                    {"attribute": "color", "value": "red"}
                ]}),
            )
            .await
            .unwrap();

        let groups = store.list_enum_groups().await.unwrap();
        assert_eq!(groups.len(), 2);
        let size = groups.iter().find(|g| g.name == "size").unwrap();
        let color = groups.iter().find(|g| g.name == "color").unwrap();
        assert_eq!(size.literals(), vec!["large"]);
        assert_eq!(color.literals(), vec!["red"]);
        assert!(size
            .values
            .iter()
            .all(|v| color.values.iter().all(|c| c.id != v.id)));
    }

    #[tokio::test]
    async fn failing_batch_leaves_nothing_behind() {
        let (service, store) = service();
        service
            .create_attribute(AttributeInput {
                name: "Age".to_string(),
                slug: None,
                datatype: Some(Datatype::Int),
                choices: Vec::new(),
            })
            .await
            .unwrap();

        let err = service
            .create(
                "example_model",
                &json!({"name": "E1", "eav": [
                    {"attribute": "color", "value": "red"},
                    {"attribute": "age", "value": "not a number"}
                ]}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EavError::Fact { index: 1, .. }));

        assert!(store.list_entities("example_model").await.unwrap().is_empty());
        assert_eq!(store.value_row_count().await, 0);
        assert!(store.get_attribute_by_slug("color").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_any_write() {
        let (service, store) = service();
        let err = service
            .create(
                "example_model",
                &json!({"name": "E1", "eav": [
                    {"attribute": "color", "value": "red"},
                    {"attribute": "size"}
                ]}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.field_errors()[0].field, "eav[1].value");
        assert!(store.list_attributes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_datatype_reads_back() {
        let (service, _) = service();
        for (name, datatype) in [
            ("notes", Datatype::Text),
            ("weight", Datatype::Float),
            ("quantity", Datatype::Int),
            ("released", Datatype::Date),
            ("in_stock", Datatype::Bool),
        ] {
            service
                .create_attribute(AttributeInput {
                    name: name.to_string(),
                    slug: None,
                    datatype: Some(datatype),
                    choices: Vec::new(),
                })
                .await
                .unwrap();
        }

        let created = service
            .create(
                "example_model",
                &json!({"name": "E1", "eav": [
                    {"attribute": "notes", "value": "fragile"},
                    {"attribute": "weight", "value": 2.5},
                    {"attribute": "quantity", "value": "12"},
                    {"attribute": "released", "value": "2024-11-20"},
                    {"attribute": "in_stock", "value": true},
                    {"attribute": "color", "value": "red"}
                ]}),
            )
            .await
            .unwrap();
        assert_eq!(
            created["eav"],
            json!({
                "color": "red",
                "in_stock": true,
                "notes": "fragile",
                "quantity": 12,
                "released": "2024-11-20",
                "weight": 2.5
            })
        );
    }

    #[tokio::test]
    async fn deleted_enum_value_degrades_to_omission() {
        let (service, store) = service();
        let created = service
            .create(
                "example_model",
                &json!({"name": "E1", "eav": [
                    {"attribute": "color", "value": "red"},
                    {"attribute": "size", "value": "large"}
                ]}),
            )
            .await
            .unwrap();
        let red = store
            .list_enum_values()
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.value == "red")
            .unwrap();
        assert!(store.delete_enum_value(red.id).await.unwrap());

        let read = service.read("example_model", entity_id(&created)).await.unwrap();
        assert_eq!(read["eav"], json!({"size": "large"}));
        assert_eq!(service.list("example_model").await.unwrap()[0]["eav"], json!({"size": "large"}));
    }

    #[tokio::test]
    async fn list_groups_facts_per_entity() {
        let (service, _) = service();
        for (name, color) in [("E1", "red"), ("E2", "blue")] {
            service
                .create(
                    "example_model",
                    &json!({"name": name, "eav": [{"attribute": "color", "value": color}]}),
                )
                .await
                .unwrap();
        }
        service
            .create("example_model", &json!({"name": "E3"}))
            .await
            .unwrap();

        let listed = service.list("example_model").await.unwrap();
        let colors: Vec<JsonValue> = listed.iter().map(|e| e["eav"].clone()).collect();
        assert_eq!(
            colors,
            vec![json!({"color": "red"}), json!({"color": "blue"}), json!({})]
        );
    }

    #[tokio::test]
    async fn delete_removes_entity_and_facts() {
        let (service, store) = service();
        let created = service
            .create(
                "example_model",
                &json!({"name": "E1", "eav": [{"attribute": "color", "value": "red"}]}),
            )
            .await
            .unwrap();
        let id = entity_id(&created);
        service.delete("example_model", id).await.unwrap();

        assert_eq!(store.value_row_count().await, 0);
        assert!(store.get_entity("example_model", id).await.unwrap().is_none());
        assert!(matches!(
            service.delete("example_model", id).await,
            Err(EavError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_entity_type_and_missing_entity() {
        let (service, _) = service();
        assert!(matches!(
            service.read("doctor", 1).await,
            Err(EavError::UnknownEntityType(_))
        ));
        assert!(matches!(
            service
                .update("example_model", 42, &json!({"name": "x"}), WriteMode::Replace)
                .await,
            Err(EavError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn retryable_failures_replay_the_unit_of_work() {
        let (service, _) = service();
        let attempts = AtomicU32::new(0);
        let result = service
            .retrying("test", || {
                let attempts = &attempts;
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EavError::Store(StoreError::SerializationFailure))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let attempts = AtomicU32::new(0);
        let err = service
            .retrying("test", || {
                let attempts = &attempts;
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(EavError::Store(StoreError::UniqueViolation {
                        constraint: "eav_value_fact_key".to_string(),
                    }))
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EavError, EavResult, FieldError, StoreError};
use crate::logic::reconcile::{finish, EavService};
use crate::logic::resolve::{check_literal, resolve_group_literal};
use crate::model::{
    is_valid_slug, slugify, Attribute, AttributeInput, AttributeUpdate, EnumGroup,
    EnumGroupUpdate, EnumValue, Id, NewAttribute, NewEnumGroup, NewEnumValue, CHARFIELD_LENGTH,
    SLUG_LENGTH,
};
use crate::store::Store;

/// Attribute together with the literals of its enum group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeView {
    #[serde(flatten)]
    pub attribute: Attribute,
    pub choices: Vec<String>,
}

impl AttributeView {
    fn new(attribute: Attribute, group: Option<&EnumGroup>) -> Self {
        let choices = group
            .map(|g| g.values.iter().map(|v| v.value.clone()).collect())
            .unwrap_or_default();
        Self { attribute, choices }
    }
}

fn check_name(field: &str, name: &str, errors: &mut Vec<FieldError>) {
    if name.trim().is_empty() {
        errors.push(FieldError::new(field, "this field may not be blank"));
    } else if name.chars().count() > CHARFIELD_LENGTH {
        errors.push(FieldError::new(
            field,
            format!("ensure this field has no more than {} characters", CHARFIELD_LENGTH),
        ));
    }
}

fn check_literals<'a>(
    field: &str,
    literals: impl Iterator<Item = &'a str>,
    errors: &mut Vec<FieldError>,
) {
    for (index, literal) in literals.enumerate() {
        if let Err(err) = check_literal(literal) {
            errors.push(FieldError::new(format!("{}[{}]", field, index), err.to_string()));
        }
    }
}

fn payload_result(errors: Vec<FieldError>) -> EavResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EavError::InvalidPayload(errors))
    }
}

/// A delete refused by a foreign key is a conflict with the rows that still
/// reference the target.
fn in_use(err: StoreError, what: String) -> EavError {
    match err {
        StoreError::ForeignKeyViolation { .. } => EavError::Conflict(format!("{} is still in use", what)),
        other => EavError::Store(other),
    }
}

impl<S: Store> EavService<S> {
    // Attributes

    async fn attribute_view(&self, attribute: Attribute) -> EavResult<AttributeView> {
        let group = match attribute.enum_group_id {
            Some(group_id) => self.store().get_enum_group(group_id).await?,
            None => None,
        };
        Ok(AttributeView::new(attribute, group.as_ref()))
    }

    pub async fn list_attributes(&self) -> EavResult<Vec<AttributeView>> {
        let attributes = self.store().list_attributes().await?;
        let groups: HashMap<Id, EnumGroup> = self
            .store()
            .list_enum_groups()
            .await?
            .into_iter()
            .map(|g| (g.id, g))
            .collect();
        Ok(attributes
            .into_iter()
            .map(|attribute| {
                let group = attribute.enum_group_id.and_then(|id| groups.get(&id));
                AttributeView::new(attribute, group)
            })
            .collect())
    }

    pub async fn get_attribute(&self, id: Id) -> EavResult<AttributeView> {
        let attribute = self
            .store()
            .get_attribute(id)
            .await?
            .ok_or_else(|| EavError::not_found("attribute", id))?;
        self.attribute_view(attribute).await
    }

    async fn try_create_attribute(
        &self,
        attribute: &NewAttribute,
        choices: &[String],
    ) -> EavResult<(Attribute, bool)> {
        let mut tx = self.store().begin().await?;
        let result = async {
            let existing = tx.find_attribute_by_slug(&attribute.slug).await?;
            let (stored, created) = match existing {
                Some(existing) => (existing, false),
                None => {
                    let group_id = if attribute.datatype.is_enum() {
                        Some(tx.get_or_create_enum_group(&attribute.slug).await?.0)
                    } else {
                        None
                    };
                    let row = NewAttribute {
                        enum_group_id: group_id,
                        ..attribute.clone()
                    };
                    tx.get_or_create_attribute(&row).await?
                }
            };

            if stored.datatype != attribute.datatype {
                return Err(EavError::Conflict(format!(
                    "attribute '{}' already exists with datatype {}",
                    stored.slug, stored.datatype
                )));
            }
            if !choices.is_empty() {
                let group_id = stored.require_enum_group()?;
                for choice in choices {
                    resolve_group_literal(tx.as_mut(), group_id, choice).await?;
                }
            }
            Ok::<_, EavError>((stored, created))
        }
        .await;
        finish(tx, result).await
    }

    /// Declare an attribute. An existing slug with the same datatype is
    /// returned as-is with the new choices merged into its group.
    pub async fn create_attribute(&self, input: AttributeInput) -> EavResult<(AttributeView, bool)> {
        let mut errors = Vec::new();
        check_name("name", &input.name, &mut errors);
        let slug = input.slug.clone().unwrap_or_else(|| slugify(&input.name));
        if !is_valid_slug(&slug) {
            errors.push(FieldError::new(
                "slug",
                format!(
                    "'{}' is not a valid slug (letters, digits, '_' or '-', at most {} characters)",
                    slug, SLUG_LENGTH
                ),
            ));
        }
        let datatype = input.datatype.unwrap_or_default();
        if !datatype.is_enum() && !input.choices.is_empty() {
            errors.push(FieldError::new(
                "choices",
                format!("only enum attributes take choices, not {}", datatype),
            ));
        }
        check_literals("choices", input.choices.iter().map(String::as_str), &mut errors);
        payload_result(errors)?;

        let attribute = NewAttribute {
            name: input.name.trim().to_string(),
            slug,
            datatype,
            enum_group_id: None,
        };
        let choices = &input.choices;
        let attribute_ref = &attribute;
        let (stored, created) = self
            .retrying("create attribute", || {
                self.try_create_attribute(attribute_ref, choices)
            })
            .await?;
        if created {
            info!(
                "Declared attribute '{}' ({}, id {})",
                stored.slug, stored.datatype, stored.id
            );
        } else {
            debug!("Attribute '{}' already declared (id {})", stored.slug, stored.id);
        }
        Ok((self.attribute_view(stored).await?, created))
    }

    async fn try_update_attribute(&self, id: Id, update: &AttributeUpdate) -> EavResult<Attribute> {
        let mut tx = self.store().begin().await?;
        let result = async {
            let mut attribute = tx
                .find_attribute(id)
                .await?
                .ok_or_else(|| EavError::not_found("attribute", id))?;
            if let Some(name) = &update.name {
                attribute = tx
                    .rename_attribute(id, name.trim())
                    .await?
                    .ok_or_else(|| EavError::not_found("attribute", id))?;
            }
            if !update.choices.is_empty() {
                if !attribute.datatype.is_enum() {
                    return Err(EavError::InvalidPayload(vec![FieldError::new(
                        "choices",
                        format!("only enum attributes take choices, not {}", attribute.datatype),
                    )]));
                }
                let group_id = attribute.require_enum_group()?;
                for choice in &update.choices {
                    resolve_group_literal(tx.as_mut(), group_id, choice).await?;
                }
            }
            Ok::<_, EavError>(attribute)
        }
        .await;
        finish(tx, result).await
    }

    /// Rename an attribute and add choices to its group. Slug and datatype are
    /// fixed once declared.
    pub async fn update_attribute(&self, id: Id, update: AttributeUpdate) -> EavResult<AttributeView> {
        let mut errors = Vec::new();
        if let Some(name) = &update.name {
            check_name("name", name, &mut errors);
        }
        check_literals("choices", update.choices.iter().map(String::as_str), &mut errors);
        payload_result(errors)?;

        let update = &update;
        let attribute = self
            .retrying("update attribute", || self.try_update_attribute(id, update))
            .await?;
        self.attribute_view(attribute).await
    }

    /// Refused while any value row references the attribute.
    pub async fn delete_attribute(&self, id: Id) -> EavResult<()> {
        let attribute = self
            .store()
            .get_attribute(id)
            .await?
            .ok_or_else(|| EavError::not_found("attribute", id))?;
        let count = self.store().count_values_for_attribute(id).await?;
        if count > 0 {
            return Err(EavError::Conflict(format!(
                "attribute '{}' is referenced by {} values",
                attribute.slug, count
            )));
        }
        let deleted = self
            .store()
            .delete_attribute(id)
            .await
            .map_err(|err| in_use(err, format!("attribute '{}'", attribute.slug)))?;
        if !deleted {
            return Err(EavError::not_found("attribute", id));
        }
        info!("Deleted attribute '{}' (id {})", attribute.slug, id);
        Ok(())
    }

    // Enum groups

    pub async fn list_enum_groups(&self) -> EavResult<Vec<EnumGroup>> {
        Ok(self.store().list_enum_groups().await?)
    }

    pub async fn get_enum_group(&self, id: Id) -> EavResult<EnumGroup> {
        self.store()
            .get_enum_group(id)
            .await?
            .ok_or_else(|| EavError::not_found("enum group", id))
    }

    async fn try_create_enum_group(&self, group: &NewEnumGroup) -> EavResult<(Id, bool)> {
        let mut tx = self.store().begin().await?;
        let result = async {
            let (group_id, created) = tx.get_or_create_enum_group(&group.name).await?;
            for value in &group.values {
                resolve_group_literal(tx.as_mut(), group_id, &value.value).await?;
            }
            Ok::<_, EavError>((group_id, created))
        }
        .await;
        finish(tx, result).await
    }

    /// Get-or-create a group by name and resolve each literal inside it.
    pub async fn create_enum_group(&self, group: NewEnumGroup) -> EavResult<(EnumGroup, bool)> {
        let mut errors = Vec::new();
        check_name("name", &group.name, &mut errors);
        check_literals("values", group.values.iter().map(|v| v.value.as_str()), &mut errors);
        payload_result(errors)?;

        let group = &group;
        let (group_id, created) = self
            .retrying("create enum group", || self.try_create_enum_group(group))
            .await?;
        debug!(
            "Enum group '{}': {} (id {})",
            group.name,
            if created { "created" } else { "existing" },
            group_id
        );
        Ok((self.get_enum_group(group_id).await?, created))
    }

    async fn try_update_enum_group(&self, id: Id, update: &EnumGroupUpdate) -> EavResult<()> {
        let mut tx = self.store().begin().await?;
        let result = async {
            if !tx.lock_enum_group(id).await? {
                return Err(EavError::not_found("enum group", id));
            }
            if let Some(name) = &update.name {
                tx.rename_enum_group(id, name.trim()).await.map_err(|err| match err {
                    StoreError::UniqueViolation { .. } => {
                        EavError::Conflict(format!("enum group '{}' already exists", name.trim()))
                    }
                    other => EavError::Store(other),
                })?;
            }
            for value in &update.values {
                resolve_group_literal(tx.as_mut(), id, &value.value).await?;
            }
            Ok::<_, EavError>(())
        }
        .await;
        finish(tx, result).await
    }

    /// Rename a group and add literals to it; existing members are kept.
    pub async fn update_enum_group(&self, id: Id, update: EnumGroupUpdate) -> EavResult<EnumGroup> {
        let mut errors = Vec::new();
        if let Some(name) = &update.name {
            check_name("name", name, &mut errors);
        }
        check_literals("values", update.values.iter().map(|v| v.value.as_str()), &mut errors);
        payload_result(errors)?;

        let update = &update;
        self.retrying("update enum group", || self.try_update_enum_group(id, update))
            .await?;
        self.get_enum_group(id).await
    }

    /// Refused while an attribute points at the group. Its enum values survive.
    pub async fn delete_enum_group(&self, id: Id) -> EavResult<()> {
        let deleted = self
            .store()
            .delete_enum_group(id)
            .await
            .map_err(|err| in_use(err, format!("enum group {}", id)))?;
        if !deleted {
            return Err(EavError::not_found("enum group", id));
        }
        info!("Deleted enum group {}", id);
        Ok(())
    }

    // Enum values

    pub async fn list_enum_values(&self) -> EavResult<Vec<EnumValue>> {
        Ok(self.store().list_enum_values().await?)
    }

    pub async fn get_enum_value(&self, id: Id) -> EavResult<EnumValue> {
        self.store()
            .get_enum_value(id)
            .await?
            .ok_or_else(|| EavError::not_found("enum value", id))
    }

    /// A standalone literal, not a member of any group.
    pub async fn create_enum_value(&self, value: NewEnumValue) -> EavResult<EnumValue> {
        check_literal(&value.value)?;
        let literal = value.value.as_str();
        self.retrying("create enum value", || async move {
            let mut tx = self.store().begin().await?;
            let result = tx.insert_enum_value(literal).await.map_err(EavError::from);
            finish(tx, result).await
        })
        .await
    }

    async fn try_update_enum_value(&self, id: Id, literal: &str) -> EavResult<EnumValue> {
        let mut tx = self.store().begin().await?;
        let result = async {
            // Lock every group first so no writer resolves the new literal meanwhile.
            let groups = tx.enum_value_groups(id).await?;
            for group_id in &groups {
                tx.lock_enum_group(*group_id).await?;
            }
            for group_id in &groups {
                if let Some(other) = tx.find_group_member(*group_id, literal).await? {
                    if other.id != id {
                        return Err(EavError::Conflict(format!(
                            "enum group {} already has literal '{}' (enum value {})",
                            group_id, literal, other.id
                        )));
                    }
                }
            }
            let updated = tx
                .update_enum_value(id, literal)
                .await?
                .ok_or_else(|| EavError::not_found("enum value", id))?;
            Ok::<_, EavError>(updated)
        }
        .await;
        finish(tx, result).await
    }

    /// A literal stays unique within every group it belongs to.
    pub async fn update_enum_value(&self, id: Id, value: NewEnumValue) -> EavResult<EnumValue> {
        check_literal(&value.value)?;
        let literal = value.value.as_str();
        self.retrying("update enum value", || self.try_update_enum_value(id, literal))
            .await
    }

    /// Facts that pointed at the literal are kept and no longer shown.
    pub async fn delete_enum_value(&self, id: Id) -> EavResult<()> {
        if !self.store().delete_enum_value(id).await? {
            return Err(EavError::not_found("enum value", id));
        }
        info!("Deleted enum value {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Datatype;
    use crate::registry::{EavRegistry, EntityDescriptor, RegisterOptions};
    use crate::store::{AttributeStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn service() -> EavService<MemoryStore> {
        let mut builder = EavRegistry::builder();
        builder
            .enable(EntityDescriptor::new("example_model"), RegisterOptions::default())
            .unwrap();
        EavService::new(Arc::new(MemoryStore::new()), Arc::new(builder.build()), 3)
    }

    fn input(name: &str, datatype: Option<Datatype>, choices: &[&str]) -> AttributeInput {
        AttributeInput {
            name: name.to_string(),
            slug: None,
            datatype,
            choices: choices.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn attribute_defaults_to_enum_with_group_named_after_slug() {
        let service = service();
        let (view, created) = service
            .create_attribute(input("Blood Type", None, &["A", "B", "A"]))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(view.attribute.slug, "blood_type");
        assert_eq!(view.attribute.datatype, Datatype::Enum);
        assert_eq!(view.choices, vec!["A", "B"]);

        let group = service
            .get_enum_group(view.attribute.enum_group_id.unwrap())
            .await
            .unwrap();
        assert_eq!(group.name, "blood_type");
    }

    #[tokio::test]
    async fn redeclaring_an_attribute_merges_choices() {
        let service = service();
        let (first, _) = service
            .create_attribute(input("Size", None, &["small"]))
            .await
            .unwrap();
        let (second, created) = service
            .create_attribute(input("Size", None, &["small", "large"]))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.attribute.id, second.attribute.id);
        assert_eq!(second.choices, vec!["small", "large"]);
    }

    #[tokio::test]
    async fn redeclaring_with_another_datatype_conflicts() {
        let service = service();
        service.create_attribute(input("Size", None, &[])).await.unwrap();
        assert!(matches!(
            service.create_attribute(input("Size", Some(Datatype::Int), &[])).await,
            Err(EavError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn choices_only_fit_enum_attributes() {
        let service = service();
        let err = service
            .create_attribute(input("Age", Some(Datatype::Int), &["1"]))
            .await
            .unwrap_err();
        assert_eq!(err.field_errors()[0].field, "choices");

        let (age, _) = service
            .create_attribute(input("Age", Some(Datatype::Int), &[]))
            .await
            .unwrap();
        assert_eq!(age.attribute.enum_group_id, None);
        let err = service
            .update_attribute(
                age.attribute.id,
                AttributeUpdate {
                    name: None,
                    choices: vec!["1".to_string()],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EavError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn blank_names_and_bad_slugs_are_rejected() {
        let service = service();
        let err = service.create_attribute(input("  ", None, &[])).await.unwrap_err();
        let fields: Vec<String> = err.field_errors().into_iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["name", "slug"]);

        let mut bad = input("Color", None, &[]);
        bad.slug = Some("has space".to_string());
        assert!(matches!(
            service.create_attribute(bad).await,
            Err(EavError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn attribute_in_use_cannot_be_deleted() {
        let service = service();
        let created = service
            .create("example_model", &json!({"eav": [{"attribute": "color", "value": "red"}]}))
            .await
            .unwrap();
        let color = service.store().get_attribute_by_slug("color").await.unwrap().unwrap();
        assert!(matches!(
            service.delete_attribute(color.id).await,
            Err(EavError::Conflict(_))
        ));

        service
            .delete("example_model", created["id"].as_i64().unwrap())
            .await
            .unwrap();
        service.delete_attribute(color.id).await.unwrap();
        assert!(matches!(
            service.get_attribute(color.id).await,
            Err(EavError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rename_keeps_slug_and_adds_choices() {
        let service = service();
        let (color, _) = service
            .create_attribute(input("Color", None, &["red"]))
            .await
            .unwrap();
        let renamed = service
            .update_attribute(
                color.attribute.id,
                AttributeUpdate {
                    name: Some("Colour".to_string()),
                    choices: vec!["blue".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.attribute.name, "Colour");
        assert_eq!(renamed.attribute.slug, "color");
        assert_eq!(renamed.choices, vec!["red", "blue"]);
    }

    #[tokio::test]
    async fn enum_value_rename_cannot_duplicate_a_group_literal() {
        let service = service();
        let (color, _) = service
            .create_attribute(input("Color", None, &["red", "blue"]))
            .await
            .unwrap();
        let group = service
            .get_enum_group(color.attribute.enum_group_id.unwrap())
            .await
            .unwrap();
        let blue = group.values[1].id;

        let err = service
            .update_enum_value(blue, NewEnumValue { value: "red".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, EavError::Conflict(_)));
        let color = service.get_attribute(color.attribute.id).await.unwrap();
        assert_eq!(color.choices, vec!["red", "blue"]);

        // Renaming to itself and to a fresh literal are fine.
        service
            .update_enum_value(blue, NewEnumValue { value: "blue".to_string() })
            .await
            .unwrap();
        let navy = service
            .update_enum_value(blue, NewEnumValue { value: "navy".to_string() })
            .await
            .unwrap();
        assert_eq!(navy.value, "navy");

        // A standalone literal belongs to no group and renames freely.
        let loose = service
            .create_enum_value(NewEnumValue { value: "loose".to_string() })
            .await
            .unwrap();
        service
            .update_enum_value(loose.id, NewEnumValue { value: "red".to_string() })
            .await
            .unwrap();
        assert!(matches!(
            service
                .update_enum_value(9999, NewEnumValue { value: "x".to_string() })
                .await,
            Err(EavError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn enum_group_is_get_or_create_by_name() {
        let service = service();
        let group = NewEnumGroup {
            name: "sizes".to_string(),
            values: vec![
                NewEnumValue { value: "s".to_string() },
                NewEnumValue { value: "m".to_string() },
            ],
        };
        let (first, created) = service.create_enum_group(group.clone()).await.unwrap();
        assert!(created);
        let (second, created) = service.create_enum_group(group).await.unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(second.literals(), vec!["s", "m"]);
    }

    #[tokio::test]
    async fn enum_group_rename_collision_conflicts() {
        let service = service();
        let (a, _) = service
            .create_enum_group(NewEnumGroup { name: "a".to_string(), values: Vec::new() })
            .await
            .unwrap();
        service
            .create_enum_group(NewEnumGroup { name: "b".to_string(), values: Vec::new() })
            .await
            .unwrap();
        let err = service
            .update_enum_group(
                a.id,
                EnumGroupUpdate {
                    name: Some("b".to_string()),
                    values: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EavError::Conflict(_)));
    }

    #[tokio::test]
    async fn referenced_enum_group_cannot_be_deleted() {
        let service = service();
        let (color, _) = service
            .create_attribute(input("Color", None, &["red"]))
            .await
            .unwrap();
        let group_id = color.attribute.enum_group_id.unwrap();
        assert!(matches!(
            service.delete_enum_group(group_id).await,
            Err(EavError::Conflict(_))
        ));

        let (loose, _) = service
            .create_enum_group(NewEnumGroup {
                name: "loose".to_string(),
                values: vec![NewEnumValue { value: "x".to_string() }],
            })
            .await
            .unwrap();
        service.delete_enum_group(loose.id).await.unwrap();
        assert_eq!(service.list_enum_groups().await.unwrap().len(), 1);
        // Members outlive their group.
        assert!(service
            .list_enum_values()
            .await
            .unwrap()
            .iter()
            .any(|v| v.value == "x"));
    }

    #[tokio::test]
    async fn standalone_enum_values() {
        let service = service();
        let value = service
            .create_enum_value(NewEnumValue { value: "loose".to_string() })
            .await
            .unwrap();
        let updated = service
            .update_enum_value(value.id, NewEnumValue { value: "tight".to_string() })
            .await
            .unwrap();
        assert_eq!(updated.value, "tight");
        assert_eq!(service.get_enum_value(value.id).await.unwrap().value, "tight");

        service.delete_enum_value(value.id).await.unwrap();
        assert!(matches!(
            service.delete_enum_value(value.id).await,
            Err(EavError::NotFound { .. })
        ));
        assert!(service
            .create_enum_value(NewEnumValue { value: String::new() })
            .await
            .is_err());
    }
}

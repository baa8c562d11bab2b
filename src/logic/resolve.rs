use log::debug;
use serde_json::Value as JsonValue;

use crate::error::{EavError, EavResult};
use crate::model::{
    literal_text, Attribute, Datatype, EavItem, EntityRef, EnumValue, Id, NewAttribute, NewValue,
    Value, ValueData, CHARFIELD_LENGTH,
};
use crate::store::EavTransaction;

/// Check an enum literal before it is stored.
pub fn check_literal(literal: &str) -> EavResult<()> {
    if literal.trim().is_empty() {
        return Err(EavError::invalid_value(Datatype::Enum, "literal may not be blank"));
    }
    if literal.chars().count() > CHARFIELD_LENGTH {
        return Err(EavError::invalid_value(
            Datatype::Enum,
            format!("literal is longer than {} characters", CHARFIELD_LENGTH),
        ));
    }
    Ok(())
}

/// Resolve a slug to its attribute, creating an enum attribute backed by a
/// group of the same name when the slug is unseen.
///
/// Under concurrent first writes both writers converge on the row that was
/// inserted first; its datatype wins.
pub async fn resolve_attribute(tx: &mut dyn EavTransaction, slug: &str) -> EavResult<Attribute> {
    if let Some(attribute) = tx.find_attribute_by_slug(slug).await? {
        return Ok(attribute);
    }

    let (group_id, group_created) = tx.get_or_create_enum_group(slug).await?;
    debug!(
        "Enum group '{}' for new attribute: {} (id {})",
        slug,
        if group_created { "created" } else { "existing" },
        group_id
    );

    let (attribute, created) = tx
        .get_or_create_attribute(&NewAttribute::enumeration(slug, group_id))
        .await?;
    debug!(
        "Attribute '{}': {} (id {}, datatype {})",
        slug,
        if created { "created" } else { "existing" },
        attribute.id,
        attribute.datatype
    );
    Ok(attribute)
}

/// Find `literal` among the members of a group, or add a fresh enum value to it.
///
/// The group row stays locked until the unit of work ends, so two writers
/// cannot both add the same literal.
pub async fn resolve_group_literal(
    tx: &mut dyn EavTransaction,
    group_id: Id,
    literal: &str,
) -> EavResult<EnumValue> {
    check_literal(literal)?;
    if !tx.lock_enum_group(group_id).await? {
        return Err(EavError::not_found("enum group", group_id));
    }

    if let Some(existing) = tx.find_group_member(group_id, literal).await? {
        return Ok(existing);
    }

    let value = tx.insert_enum_value(literal).await?;
    tx.add_group_member(group_id, value.id).await?;
    debug!(
        "Enum value '{}' added to group {} (id {})",
        literal, group_id, value.id
    );
    Ok(value)
}

/// Resolve the enum value for a fact on an enumeration attribute.
pub async fn resolve_enum_value(
    tx: &mut dyn EavTransaction,
    attribute: &Attribute,
    raw: &JsonValue,
) -> EavResult<EnumValue> {
    let group_id = attribute.require_enum_group()?;
    let literal = literal_text(raw)
        .ok_or_else(|| EavError::invalid_value(Datatype::Enum, format!("{} is not a scalar", raw)))?;
    resolve_group_literal(tx, group_id, &literal).await
}

/// Write one fact: resolve its attribute (and enum value), then get-or-create
/// the value row for (attribute, entity) and set its typed column.
pub async fn upsert_fact(
    tx: &mut dyn EavTransaction,
    entity: &EntityRef,
    item: &EavItem,
) -> EavResult<Value> {
    let attribute = resolve_attribute(tx, &item.attribute).await?;

    let data = match attribute.datatype {
        Datatype::Enum => ValueData::Enum(resolve_enum_value(tx, &attribute, &item.value).await?.id),
        datatype => ValueData::parse(datatype, &item.value)?,
    };

    let (value, created) = tx
        .upsert_value(&NewValue {
            attribute_id: attribute.id,
            entity: entity.clone(),
            data,
        })
        .await?;
    debug!(
        "Fact {} on {}: {} (value id {})",
        attribute.slug,
        entity,
        if created { "created" } else { "updated" },
        value.id
    );
    Ok(value)
}

/// Apply facts in order, naming the item that failed.
pub async fn apply_facts(
    tx: &mut dyn EavTransaction,
    entity: &EntityRef,
    items: &[EavItem],
) -> EavResult<Vec<Value>> {
    let mut values = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let value = upsert_fact(tx, entity, item)
            .await
            .map_err(|err| err.for_fact(index, &item.attribute))?;
        values.push(value);
    }
    Ok(values)
}

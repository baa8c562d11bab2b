//! Payload checks that run before any unit of work starts.
//!
//! Every problem is collected into one [`EavError::InvalidPayload`] with
//! field-level entries addressed the way the client sent them.

use serde_json::{Map, Value as JsonValue};

use crate::error::{EavError, EavResult, FieldError};
use crate::model::{is_valid_slug, EavItem, EntityWrite, WriteMode, SLUG_LENGTH};
use crate::registry::RegisteredEntity;

const REQUIRED: &str = "this field is required";

fn describe(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "an object",
    }
}

fn validate_item(index: usize, raw: &JsonValue, errors: &mut Vec<FieldError>) -> Option<EavItem> {
    let prefix = format!("eav[{}]", index);
    let item = match raw {
        JsonValue::Object(item) => item,
        other => {
            errors.push(FieldError::new(
                prefix,
                format!("expected an object, got {}", describe(other)),
            ));
            return None;
        }
    };

    let attribute = match item.get("attribute") {
        None | Some(JsonValue::Null) => {
            errors.push(FieldError::new(format!("{}.attribute", prefix), REQUIRED));
            None
        }
        Some(JsonValue::String(slug)) if is_valid_slug(slug) => Some(slug.clone()),
        Some(JsonValue::String(slug)) => {
            errors.push(FieldError::new(
                format!("{}.attribute", prefix),
                format!(
                    "'{}' is not a valid slug (letters, digits, '_' or '-', at most {} characters)",
                    slug, SLUG_LENGTH
                ),
            ));
            None
        }
        Some(other) => {
            errors.push(FieldError::new(
                format!("{}.attribute", prefix),
                format!("expected a slug, got {}", describe(other)),
            ));
            None
        }
    };

    let value = match item.get("value") {
        None | Some(JsonValue::Null) => {
            errors.push(FieldError::new(format!("{}.value", prefix), REQUIRED));
            None
        }
        Some(value @ (JsonValue::Array(_) | JsonValue::Object(_))) => {
            errors.push(FieldError::new(
                format!("{}.value", prefix),
                format!("expected a scalar, got {}", describe(value)),
            ));
            None
        }
        Some(value) => Some(value.clone()),
    };

    Some(EavItem {
        attribute: attribute?,
        value: value?,
    })
}

/// Check a write payload for a registered entity type and split it into host
/// fields and facts.
///
/// `id` is ignored. Entity types that declare fields reject unknown keys and,
/// unless the write is partial, require the required ones.
pub fn validate_write(
    entity: &RegisteredEntity,
    body: &JsonValue,
    mode: WriteMode,
) -> EavResult<EntityWrite> {
    let object = match body {
        JsonValue::Object(object) => object,
        other => {
            return Err(EavError::InvalidPayload(vec![FieldError::new(
                "non_field_errors",
                format!("expected an object, got {}", describe(other)),
            )]))
        }
    };

    let mut errors = Vec::new();
    let mut fields = Map::new();
    let mut eav = Vec::new();

    for (key, value) in object {
        if key == "id" {
            continue;
        }
        if key == entity.accessor() {
            match value {
                JsonValue::Array(items) => {
                    eav = items
                        .iter()
                        .enumerate()
                        .filter_map(|(index, raw)| validate_item(index, raw, &mut errors))
                        .collect();
                }
                JsonValue::Null => {}
                other => errors.push(FieldError::new(
                    key.clone(),
                    format!("expected a list of facts, got {}", describe(other)),
                )),
            }
            continue;
        }
        if entity.declares_fields() && entity.field(key).is_none() {
            errors.push(FieldError::new(key.clone(), "unknown field"));
            continue;
        }
        fields.insert(key.clone(), value.clone());
    }

    if mode != WriteMode::Patch {
        for field in entity.fields().iter().filter(|f| f.required) {
            if matches!(fields.get(&field.name), None | Some(JsonValue::Null)) {
                errors.push(FieldError::new(field.name.clone(), REQUIRED));
            }
        }
    }

    if errors.is_empty() {
        Ok(EntityWrite { fields, eav })
    } else {
        Err(EavError::InvalidPayload(errors))
    }
}

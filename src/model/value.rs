use crate::error::{EavError, EavResult};
use crate::model::{Attribute, Datatype, Id};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Polymorphic reference to a row of any registered entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub content_type: String,
    pub id: Id,
}

impl EntityRef {
    pub fn new(content_type: impl Into<String>, id: Id) -> Self {
        Self {
            content_type: content_type.into(),
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.content_type, self.id)
    }
}

/// The one populated typed column of a value row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ValueData {
    Text(String),
    Float(f64),
    Int(i64),
    Date(NaiveDate),
    Bool(bool),
    /// Id of the enum value row.
    Enum(Id),
}

impl ValueData {
    pub fn datatype(&self) -> Datatype {
        match self {
            ValueData::Text(_) => Datatype::Text,
            ValueData::Float(_) => Datatype::Float,
            ValueData::Int(_) => Datatype::Int,
            ValueData::Date(_) => Datatype::Date,
            ValueData::Bool(_) => Datatype::Bool,
            ValueData::Enum(_) => Datatype::Enum,
        }
    }

    /// Parse an external scalar into the column for a non-enum datatype.
    /// Enum literals go through enum resolution instead.
    pub fn parse(datatype: Datatype, raw: &JsonValue) -> EavResult<Self> {
        match datatype {
            Datatype::Text => literal_text(raw)
                .map(ValueData::Text)
                .ok_or_else(|| EavError::invalid_value(datatype, "expected a scalar")),
            Datatype::Int => match raw {
                JsonValue::Number(n) => n
                    .as_i64()
                    .map(ValueData::Int)
                    .ok_or_else(|| EavError::invalid_value(datatype, format!("{} is not an integer", n))),
                JsonValue::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(ValueData::Int)
                    .map_err(|_| EavError::invalid_value(datatype, format!("'{}' is not an integer", s))),
                other => Err(EavError::invalid_value(datatype, format!("{} is not an integer", other))),
            },
            Datatype::Float => {
                let parsed = match raw {
                    JsonValue::Number(n) => n.as_f64(),
                    JsonValue::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                parsed
                    .filter(|f| f.is_finite())
                    .map(ValueData::Float)
                    .ok_or_else(|| EavError::invalid_value(datatype, format!("{} is not a number", raw)))
            }
            Datatype::Bool => match raw {
                JsonValue::Bool(b) => Ok(ValueData::Bool(*b)),
                JsonValue::Number(n) if n.as_i64() == Some(1) => Ok(ValueData::Bool(true)),
                JsonValue::Number(n) if n.as_i64() == Some(0) => Ok(ValueData::Bool(false)),
                JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(ValueData::Bool(true)),
                    "false" | "0" => Ok(ValueData::Bool(false)),
                    _ => Err(EavError::invalid_value(datatype, format!("'{}' is not a boolean", s))),
                },
                other => Err(EavError::invalid_value(datatype, format!("{} is not a boolean", other))),
            },
            Datatype::Date => match raw {
                JsonValue::String(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                    .map(ValueData::Date)
                    .map_err(|_| EavError::invalid_value(datatype, format!("'{}' is not a YYYY-MM-DD date", s))),
                other => Err(EavError::invalid_value(datatype, format!("{} is not a date", other))),
            },
            Datatype::Enum => Err(EavError::invalid_value(
                datatype,
                "enum values are resolved through their enum group",
            )),
        }
    }

    /// Flat representation of the column; enum ids need their literal looked up.
    pub fn to_json(&self) -> Option<JsonValue> {
        match self {
            ValueData::Text(s) => Some(JsonValue::String(s.clone())),
            ValueData::Float(f) => serde_json::Number::from_f64(*f).map(JsonValue::Number),
            ValueData::Int(i) => Some(JsonValue::from(*i)),
            ValueData::Date(d) => Some(JsonValue::String(d.format(DATE_FORMAT).to_string())),
            ValueData::Bool(b) => Some(JsonValue::Bool(*b)),
            ValueData::Enum(_) => None,
        }
    }
}

/// Text form of a scalar: strings as-is, numbers and booleans printed.
pub fn literal_text(raw: &JsonValue) -> Option<String> {
    match raw {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// One (attribute, entity) fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub id: Id,
    pub attribute_id: Id,
    pub entity: EntityRef,
    /// `None` once the referenced enum value has been deleted.
    pub data: Option<ValueData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewValue {
    pub attribute_id: Id,
    pub entity: EntityRef,
    pub data: ValueData,
}

/// A value row joined with its attribute and, for enums, its literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub attribute: Attribute,
    pub value: Value,
    pub enum_literal: Option<String>,
}

impl Fact {
    /// Flat `eav` entry for this fact, or `None` when the fact cannot be shown
    /// (orphaned enum reference, column not matching the attribute datatype).
    pub fn flat_value(&self) -> Option<JsonValue> {
        match (&self.value.data, self.attribute.datatype) {
            (Some(ValueData::Enum(_)), Datatype::Enum) => {
                self.enum_literal.clone().map(JsonValue::String)
            }
            (Some(data), datatype) if data.datatype() == datatype => data.to_json(),
            _ => None,
        }
    }
}

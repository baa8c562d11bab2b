use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type Id = i64;

/// Maximum length of names and enum literals (`VARCHAR(100)` columns).
pub const CHARFIELD_LENGTH: usize = 100;
/// Maximum length of an attribute slug.
pub const SLUG_LENGTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Text,
    Float,
    Int,
    Date,
    Bool,
    Enum,
}

impl Datatype {
    pub const ALL: [Datatype; 6] = [
        Datatype::Text,
        Datatype::Float,
        Datatype::Int,
        Datatype::Date,
        Datatype::Bool,
        Datatype::Enum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Text => "text",
            Datatype::Float => "float",
            Datatype::Int => "int",
            Datatype::Date => "date",
            Datatype::Bool => "bool",
            Datatype::Enum => "enum",
        }
    }

    pub fn is_enum(&self) -> bool {
        matches!(self, Datatype::Enum)
    }
}

/// Attributes first seen through a fact write are enumerations.
impl Default for Datatype {
    fn default() -> Self {
        Datatype::Enum
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Datatype::ALL
            .into_iter()
            .find(|datatype| datatype.as_str() == s)
            .ok_or_else(|| format!("unknown datatype '{}'", s))
    }
}

/// Slugs accept ASCII letters, digits, underscores and hyphens.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= SLUG_LENGTH
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Derive a slug from a human readable attribute name.
///
/// Runs of anything that is not an ASCII letter or digit collapse into a
/// single underscore; the result is lowercased and trimmed to the slug length.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    slug.truncate(SLUG_LENGTH);
    slug.trim_end_matches('_').to_string()
}

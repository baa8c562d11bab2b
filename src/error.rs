use itertools::Itertools;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::model::Datatype;

/// A single offending field in an external payload, addressed the way the
/// client sent it (`eav[2].value`, `name`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },
    #[error("row is still referenced: {constraint}")]
    ForeignKeyViolation { constraint: String },
    #[error("check constraint violated: {constraint}")]
    CheckViolation { constraint: String },
    #[error("transaction could not be serialized")]
    SerializationFailure,
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Failures caused by a concurrent writer; the whole unit of work can be replayed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::UniqueViolation { .. } | StoreError::SerializationFailure
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let constraint = db_err.constraint().unwrap_or_default().to_string();
            match db_err.code().as_deref() {
                Some("23505") => return Self::UniqueViolation { constraint },
                Some("23503") => return Self::ForeignKeyViolation { constraint },
                Some("23514") => return Self::CheckViolation { constraint },
                Some("40001") | Some("40P01") => return Self::SerializationFailure,
                _ => {}
            }
        }
        Self::Database(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("entity type name '{0}' is not a valid identifier")]
    InvalidName(String),
    #[error("entity type '{entity}': field '{field}' {reason}")]
    InvalidField {
        entity: String,
        field: String,
        reason: &'static str,
    },
    #[error("entity type '{entity}': accessor '{accessor}' is not a valid identifier")]
    InvalidAccessor { entity: String, accessor: String },
    #[error("entity type '{0}' is already registered with a different descriptor")]
    Conflicting(String),
    #[error("content type '{content_type}' is already bound to entity type '{existing}'")]
    ContentTypeTaken {
        content_type: String,
        existing: String,
    },
}

#[derive(Debug, Error)]
pub enum EavError {
    #[error("invalid payload: {}", .0.iter().join("; "))]
    InvalidPayload(Vec<FieldError>),
    #[error("eav[{index}] ({slug}): {source}")]
    Fact {
        index: usize,
        slug: String,
        #[source]
        source: Box<EavError>,
    },
    #[error("invalid {datatype} value: {reason}")]
    InvalidValue { datatype: Datatype, reason: String },
    #[error("attribute '{slug}' is enum-typed but has no enum group")]
    SchemaInconsistency { slug: String },
    #[error("entity type '{0}' is not registered for eav")]
    UnknownEntityType(String),
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EavResult<T> = Result<T, EavError>;
pub type StoreResult<T> = Result<T, StoreError>;

impl EavError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn invalid_value(datatype: Datatype, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            datatype,
            reason: reason.into(),
        }
    }

    /// Attach the position and slug of the fact item that failed.
    pub fn for_fact(self, index: usize, slug: &str) -> Self {
        match self {
            // Storage races stay unwrapped so the retry loop can see them.
            EavError::Store(err) if err.is_retryable() => EavError::Store(err),
            other => EavError::Fact {
                index,
                slug: slug.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            EavError::Store(err) => err.is_retryable(),
            EavError::Fact { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Field-level view of the error for the structured error response.
    pub fn field_errors(&self) -> Vec<FieldError> {
        match self {
            EavError::InvalidPayload(errors) => errors.clone(),
            EavError::Fact { index, source, .. } => {
                vec![FieldError::new(format!("eav[{}]", index), source.to_string())]
            }
            _ => Vec::new(),
        }
    }
}

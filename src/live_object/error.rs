//! Live object error types.

use thiserror::Error;

use crate::db::DbError;

use super::external::ExternalCallError;

/// Startup-time errors. Fatal: the runtime never begins processing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid event name '{name}': {reason}")]
    InvalidEventName { name: String, reason: String },

    #[error("Unknown chain prefix '{prefix}' in event pattern '{pattern}'")]
    UnknownChainPrefix { prefix: String, pattern: String },

    #[error(
        "Duplicate handler binding for '{pattern}' on entity '{entity}' \
         (already bound to '{existing}')"
    )]
    DuplicateBinding {
        entity: String,
        pattern: String,
        existing: String,
    },

    #[error("Entity '{0}' is registered twice")]
    DuplicateEntity(String),

    #[error("Entity '{0}' is not registered")]
    UnknownEntity(String),

    #[error("Entity '{entity}': {reason}")]
    InvalidEntity { entity: String, reason: String },

    #[error("Entity '{entity}': uniqueBy references undeclared property '{property}'")]
    UndeclaredUniqueBy { entity: String, property: String },

    #[error("Invalid configuration in {path}: {reason}")]
    InvalidConfigFile { path: String, reason: String },

    #[error("Entity '{entity}': default for '{property}' is invalid: {source}")]
    InvalidDefault {
        entity: String,
        property: String,
        #[source]
        source: CoercionError,
    },
}

/// A value that does not fit the declared property type.
#[derive(Debug, Clone, Error)]
#[error("Cannot coerce {value} into {expected} for property '{property}': {reason}")]
pub struct CoercionError {
    pub property: String,
    pub expected: &'static str,
    pub value: String,
    pub reason: String,
}

/// Failure raised from inside a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Missing event field: {0}")]
    MissingField(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Unknown property '{property}' on entity '{entity}'")]
    UnknownProperty { entity: String, property: String },

    #[error("External call failed: {0}")]
    ExternalCall(#[from] ExternalCallError),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Everything that can abort one event's lifecycle.
#[derive(Debug, Error)]
pub enum LiveObjectError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Coercion(#[from] CoercionError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DbError),

    #[error("Entity '{entity}': uniqueBy property '{property}' is not set")]
    IncompleteUniqueKey { entity: String, property: String },
}

impl LiveObjectError {
    /// Short category name used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LiveObjectError::Handler(HandlerError::ExternalCall(_)) => "external_call",
            LiveObjectError::Handler(_) => "handler",
            LiveObjectError::Coercion(_) => "coercion",
            LiveObjectError::Persistence(_) => "persistence",
            LiveObjectError::IncompleteUniqueKey { .. } => "incomplete_key",
        }
    }
}

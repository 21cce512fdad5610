//! Error types for the catalog core
//!
//! Validation, uniqueness and referential failures are raised before any
//! write and surface directly to the caller. Best-effort components (the
//! mapping cache writer, cover writes during import) log their failures
//! instead of returning them.

use serde_json::Value;
use thiserror::Error;

/// Result alias used throughout the core
pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

/// Field-level invariant violations raised when a value type is built
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} exceeds {max} characters (got {actual})")]
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{later} must not be before {earlier}")]
    OutOfOrder {
        earlier: &'static str,
        later: &'static str,
    },

    #[error("{0} cannot reference its own id")]
    SelfReference(&'static str),
}

/// Failures of the versioned serialization layer
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("migration targets version {target}, above current version {current}")]
    TargetAboveCurrent { target: u32, current: u32 },

    #[error("migrations stop at version {reached}, current version is {current}")]
    IncompleteChain { reached: u32, current: u32 },

    #[error("more than one migration targets version {0}")]
    DuplicateTarget(u32),

    #[error("migration to version {target} failed: {reason}")]
    StepFailed {
        target: u32,
        reason: String,
        /// The payload as it was read, before any step ran
        payload: Value,
    },

    #[error("record version {found} is newer than supported version {current}")]
    UnsupportedVersion { found: u64, current: u32 },

    #[error("version marker '{key}' is not a non-negative integer: {found}")]
    MalformedMarker { key: String, found: Value },

    #[error("versioned records must be JSON objects")]
    NotAnObject,

    #[error("failed to decode record at version {version}: {source}")]
    Decode {
        version: u32,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by the catalog stores and services
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{field} '{value}' is already in use")]
    Conflict { field: &'static str, value: String },

    #[error("referenced {entity} does not exist: {id}")]
    Referential { entity: &'static str, id: String },

    #[error("tag category {id} is still referenced by {tags} tag(s)")]
    CategoryInUse { id: String, tags: usize },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("import provider '{provider}' failed: {reason}")]
    Provider { provider: String, reason: String },

    #[error("no import provider supports {0}")]
    UnsupportedSource(String),
}

impl CatalogError {
    pub(crate) fn conflict(field: &'static str, value: impl Into<String>) -> Self {
        CatalogError::Conflict {
            field,
            value: value.into(),
        }
    }

    pub(crate) fn missing(entity: &'static str, id: impl ToString) -> Self {
        CatalogError::Referential {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        CatalogError::Storage(format!("{} lock poisoned", what))
    }
}

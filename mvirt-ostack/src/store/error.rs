//! Store error types.

use thiserror::Error;

use crate::model::{QuotaMetric, ResourceState};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Row not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique constraint or invariant violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The record was not in a state from which the requested one is reachable.
    #[error("resource {resource_id} is {current}, cannot move to {requested}")]
    StateConflict {
        resource_id: String,
        current: ResourceState,
        requested: ResourceState,
    },

    /// A reservation would push a counter of the scope chain past its limit.
    #[error("quota exceeded for {metric} in scope {scope_id}: {usage} + {requested} > {limit}")]
    QuotaExceeded {
        scope_id: String,
        metric: QuotaMetric,
        usage: i64,
        requested: i64,
        limit: i64,
    },

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal: {0}")]
    Internal(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

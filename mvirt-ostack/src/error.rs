//! Error taxonomy of the synchronization core.

use thiserror::Error;

use crate::backend::BackendError;
use crate::model::{QuotaMetric, ResourceState};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Illegal transition attempted; the record is unchanged.
    #[error("state conflict: resource {resource_id} is {current}, cannot move to {requested}")]
    StateConflict {
        resource_id: String,
        current: ResourceState,
        requested: ResourceState,
    },

    /// Another executor run already owns the record.
    #[error("state conflict: resource {0} has an operation in flight")]
    RunInFlight(String),

    #[error("quota exceeded for {metric} in scope {scope_id}: {usage} + {requested} > {limit}")]
    QuotaExceeded {
        scope_id: String,
        metric: QuotaMetric,
        usage: i64,
        requested: i64,
        limit: i64,
    },

    #[error("backend transient failure: {0}")]
    BackendTransient(String),

    #[error("backend terminal failure: {0}")]
    BackendTerminal(String),

    #[error("reconciliation drift in scope {scope_id}: {detail}")]
    ReconciliationDrift { scope_id: String, detail: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    /// A pull pass for the scope is already running.
    #[error("reconciliation already running for scope {0}")]
    ReconcileInProgress(String),

    #[error("store: {0}")]
    Store(StoreError),
}

impl SyncError {
    /// Errors worth another delivery of the same task.
    ///
    /// `RunInFlight` counts: the claim holder is about to finish and the
    /// record may then be in the state the task expects.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::BackendTransient(_)
                | SyncError::RunInFlight(_)
                | SyncError::Store(StoreError::Database(_))
        )
    }

    /// Errors reported straight back to the intent submitter.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SyncError::StateConflict { .. }
                | SyncError::RunInFlight(_)
                | SyncError::QuotaExceeded { .. }
                | SyncError::ReconcileInProgress(_)
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => SyncError::NotFound(msg),
            StoreError::StateConflict {
                resource_id,
                current,
                requested,
            } => SyncError::StateConflict {
                resource_id,
                current,
                requested,
            },
            StoreError::QuotaExceeded {
                scope_id,
                metric,
                usage,
                requested,
                limit,
            } => SyncError::QuotaExceeded {
                scope_id,
                metric,
                usage,
                requested,
                limit,
            },
            other => SyncError::Store(other),
        }
    }
}

impl From<BackendError> for SyncError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Transient(msg) => SyncError::BackendTransient(msg),
            BackendError::Terminal(msg) => SyncError::BackendTerminal(msg),
            BackendError::NotFound(msg) => SyncError::NotFound(msg),
        }
    }
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

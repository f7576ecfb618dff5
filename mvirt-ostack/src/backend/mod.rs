//! Backend adapter boundary.
//!
//! One adapter per resource kind speaks to the cloud control plane. The core
//! only relies on the five calls of [`BackendAdapter`] and on the adapter's
//! classification of failures.

mod simulated;

pub use simulated::{SimCall, SimulatedAdapter, SimulatedCloud};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::model::ResourceKind;

/// Adapter failure, classified by the adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Retryable (rate limit, timeout, temporary unavailability).
    #[error("transient: {0}")]
    Transient(String),
    /// Not retryable.
    #[error("terminal: {0}")]
    Terminal(String),
    /// The object does not exist at the backend.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Status of a backend object as classified by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Operation still in progress (building, resizing, deleting).
    Pending,
    /// Stable terminal status (active, available).
    Stable,
    /// The backend reports the object in an error status.
    Error(String),
    /// The object is gone.
    Deleted,
}

/// One observation of a backend object.
#[derive(Debug, Clone)]
pub struct BackendObject {
    pub backend_id: String,
    pub status: BackendStatus,
    pub attributes: Value,
}

/// Entry of a backend listing.
#[derive(Debug, Clone)]
pub struct BackendResource {
    pub backend_id: String,
    pub status: BackendStatus,
    pub attributes: Value,
    /// Local record id the object was created for, as tagged at create time.
    pub local_ref: Option<String>,
}

/// Create call input. `resource_id` is stored with the backend object so
/// listings can be correlated with local records.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub resource_id: String,
    pub scope_id: String,
    pub spec: Value,
}

/// Capability interface implemented per resource kind.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn create(&self, request: &CreateRequest) -> Result<BackendObject, BackendError>;

    async fn update(&self, backend_id: &str, spec: &Value) -> Result<BackendObject, BackendError>;

    async fn delete(&self, backend_id: &str) -> Result<BackendStatus, BackendError>;

    /// `Err(BackendError::NotFound)` when the object is absent.
    async fn fetch(&self, backend_id: &str) -> Result<BackendObject, BackendError>;

    async fn list(&self, scope_id: &str) -> Result<Vec<BackendResource>, BackendError>;
}

/// Kind to adapter lookup table.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ResourceKind, Arc<dyn BackendAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the kind it reports.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: ResourceKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Registered kinds in a stable order.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

//! DataStore trait definitions.
//!
//! Executors, the reconciler and the quota ledger only talk to these traits;
//! the SQLite implementation lives in `sqlite.rs`.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::lifecycle::Transition;
use crate::model::{
    Demand, DriftReport, QuotaMetric, QuotaUsage, Reservation, ResourceKind, ResourceRecord,
    ResourceState, Scope,
};

use super::error::Result;
use super::event::Event;

// =============================================================================
// Request DTOs
// =============================================================================

/// Filter for listing resource records.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub scope_id: Option<String>,
    pub kind: Option<ResourceKind>,
    pub state: Option<ResourceState>,
    /// Include records already in DELETED.
    pub include_deleted: bool,
}

impl RecordFilter {
    pub fn scope(scope_id: &str) -> Self {
        Self {
            scope_id: Some(scope_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Field changes applied together with a transition.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub backend_id: Option<String>,
    pub attributes: Option<Value>,
    pub spec: Option<Value>,
    pub pending_spec: Option<Value>,
    /// `Some(None)` clears the message.
    pub error_message: Option<Option<String>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend_id(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    pub fn attributes(mut self, attributes: Value) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn spec(mut self, spec: Value) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Spec an update is about to apply. Dropped when the record leaves
    /// UPDATING.
    pub fn pending_spec(mut self, spec: Value) -> Self {
        self.pending_spec = Some(spec);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }
}

/// Request to reserve quota along a scope chain.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub scope_id: String,
    pub amounts: Demand,
    /// Check limits before incrementing. Adoption of existing backend
    /// resources skips the check.
    pub enforce_limits: bool,
    /// Store the reservation as already committed.
    pub committed: bool,
    /// Record inserted in the same transaction, holding the reservation.
    pub record: Option<ResourceRecord>,
}

// =============================================================================
// Store Traits
// =============================================================================

/// Scope tree operations.
#[async_trait]
pub trait ScopeStore: Send + Sync {
    /// Insert or replace a scope. The parent must already exist.
    async fn put_scope(&self, scope: &Scope) -> Result<()>;

    async fn get_scope(&self, id: &str) -> Result<Option<Scope>>;

    async fn list_scopes(&self) -> Result<Vec<Scope>>;

    /// The scope followed by its ancestors up to the root.
    async fn scope_chain(&self, id: &str) -> Result<Vec<Scope>>;

    /// The scope and all of its descendants.
    async fn scope_subtree(&self, id: &str) -> Result<Vec<Scope>>;
}

/// Resource record operations.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a record without touching the ledger.
    async fn insert_record(&self, record: &ResourceRecord) -> Result<()>;

    async fn get_record(&self, id: &str) -> Result<Option<ResourceRecord>>;

    async fn find_by_backend_id(
        &self,
        kind: ResourceKind,
        backend_id: &str,
    ) -> Result<Option<ResourceRecord>>;

    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<ResourceRecord>>;

    /// Apply a lifecycle transition.
    ///
    /// Fails with `StateConflict` when the current state is not a source of
    /// `transition`, leaving the record unchanged.
    async fn transition(
        &self,
        id: &str,
        transition: Transition,
        patch: RecordPatch,
    ) -> Result<ResourceRecord>;

    /// Apply field changes while the record stays in `expected`.
    async fn patch_record(
        &self,
        id: &str,
        expected: ResourceState,
        patch: RecordPatch,
    ) -> Result<ResourceRecord>;
}

/// Quota ledger operations.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Check and increment every counter of the scope chain atomically.
    async fn reserve(&self, request: ReserveRequest) -> Result<Reservation>;

    async fn get_reservation(&self, id: &str) -> Result<Option<Reservation>>;

    /// Mark a pending reservation committed. Returns false if it was not pending.
    async fn commit_reservation(&self, id: &str) -> Result<bool>;

    /// Give back the reserved amounts once. Returns false if already released.
    async fn release_reservation(&self, id: &str) -> Result<bool>;

    async fn get_quota(&self, scope_id: &str) -> Result<Vec<QuotaUsage>>;

    async fn set_limit(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        limit: Option<i64>,
    ) -> Result<QuotaUsage>;

    /// Replace a counter with a recomputed value.
    async fn overwrite_usage(&self, scope_id: &str, metric: QuotaMetric, usage: i64)
    -> Result<()>;

    async fn count_pending_reservations(&self, scope_ids: &[String]) -> Result<u64>;

    /// Open a drift report or bump the pass count of the open one.
    async fn record_drift(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        recorded: i64,
        computed: i64,
    ) -> Result<DriftReport>;

    /// Close the open drift report for a counter, if any.
    async fn resolve_drift(&self, scope_id: &str, metric: QuotaMetric, corrected: bool)
    -> Result<()>;

    async fn list_drift(&self, scope_id: &str) -> Result<Vec<DriftReport>>;
}

/// Combined DataStore trait.
pub trait DataStore: ScopeStore + RecordStore + LedgerStore + Send + Sync {
    /// Subscribe to change events.
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

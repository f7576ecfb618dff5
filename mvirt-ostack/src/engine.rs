//! Intent and query boundaries.
//!
//! `SyncEngine` wires the store, ledger, executors and reconciler together.
//! `submit` validates an intent, applies the first transition, and hands the
//! rest to an executor. It never waits for the backend.

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audit::OstackAuditLogger;
use crate::backend::AdapterRegistry;
use crate::config::{ScopeConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::executor::{Executor, RunRegistry};
use crate::lifecycle::Transition;
use crate::model::{
    DriftReport, Operation, QuotaMetric, QuotaSnapshot, QuotaUsage, ResourceKind, ResourceRecord,
    ResourceState, Scope, ScopeLevel,
};
use crate::quota::{self, QuotaLedger};
use crate::reconciler::{PullReconciler, ReconcileReport};
use crate::scheduler::TaskScheduler;
use crate::store::{DataStore, Event, RecordFilter, RecordPatch};

/// A locally originated request to change a cloud resource.
#[derive(Debug, Clone)]
pub enum Intent {
    Create {
        kind: ResourceKind,
        scope_id: String,
        spec: Value,
    },
    /// Fields of `spec` replace the same fields of the stored spec.
    Update { resource_id: String, spec: Value },
    Delete { resource_id: String },
}

impl Intent {
    pub fn operation(&self) -> Operation {
        match self {
            Intent::Create { .. } => Operation::Create,
            Intent::Update { .. } => Operation::Update,
            Intent::Delete { .. } => Operation::Delete,
        }
    }
}

/// Returned by `submit` as soon as the intent is accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub resource_id: String,
    pub state: ResourceState,
}

fn merge_spec(current: &Value, changes: &Value) -> Value {
    let mut merged = current.clone();
    if let (Some(target), Some(changes)) = (merged.as_object_mut(), changes.as_object()) {
        for (key, value) in changes {
            target.insert(key.clone(), value.clone());
        }
        return merged;
    }
    changes.clone()
}

pub struct SyncEngine {
    store: Arc<dyn DataStore>,
    ledger: Arc<QuotaLedger>,
    adapters: Arc<AdapterRegistry>,
    executor: Arc<Executor>,
    reconciler: Arc<PullReconciler>,
    audit: Arc<OstackAuditLogger>,
    /// Receipts of recent intents by request id.
    receipts: Mutex<LruCache<String, SubmitReceipt>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DataStore>,
        adapters: AdapterRegistry,
        scheduler: Arc<dyn TaskScheduler>,
        config: &SyncConfig,
        audit: Arc<OstackAuditLogger>,
    ) -> Self {
        let adapters = Arc::new(adapters);
        let ledger = Arc::new(QuotaLedger::new(
            Arc::clone(&store),
            config.quota.clone(),
            Arc::clone(&audit),
        ));
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&adapters),
            scheduler,
            Arc::new(RunRegistry::new()),
            config.retry.clone(),
            config.poll.clone(),
            config.scheduler_max_attempts,
            Arc::clone(&audit),
        ));
        let reconciler = Arc::new(PullReconciler::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&adapters),
            Arc::clone(&executor),
            config.reconcile.clone(),
            Arc::clone(&audit),
        ));
        let capacity =
            NonZeroUsize::new(config.idempotency_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            store,
            ledger,
            adapters,
            executor,
            reconciler,
            audit,
            receipts: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn reconciler(&self) -> &Arc<PullReconciler> {
        &self.reconciler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.store.subscribe()
    }

    fn receipts(&self) -> MutexGuard<'_, LruCache<String, SubmitReceipt>> {
        self.receipts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the configured scopes and their limits. Parents must come first.
    pub async fn bootstrap(&self, scopes: &[ScopeConfig]) -> Result<()> {
        for config in scopes {
            let scope = Scope {
                id: config.id.clone(),
                name: config.name.clone().unwrap_or_else(|| config.id.clone()),
                level: config.level,
                parent_id: config.parent.clone(),
            };
            self.store.put_scope(&scope).await?;
            for (metric, limit) in &config.limits {
                self.ledger.set_limit(&scope.id, *metric, Some(*limit)).await?;
            }
            debug!(scope = %scope.id, level = scope.level.as_str(), "Scope bootstrapped");
        }
        if !scopes.is_empty() {
            info!(count = scopes.len(), "Scopes bootstrapped");
        }
        Ok(())
    }

    // === Intent boundary ===

    /// Accept an intent and dispatch its executor.
    ///
    /// `StateConflict` and `QuotaExceeded` are returned here and nothing is
    /// dispatched. Repeating a `request_id` returns the first receipt.
    pub async fn submit(&self, intent: Intent, request_id: Option<&str>) -> Result<SubmitReceipt> {
        if let Some(request_id) = request_id
            && let Some(receipt) = self.receipts().get(request_id).cloned()
        {
            debug!(request_id = %request_id, resource_id = %receipt.resource_id, "Duplicate intent");
            return Ok(receipt);
        }

        let operation = intent.operation();
        let receipt = match intent {
            Intent::Create {
                kind,
                scope_id,
                spec,
            } => self.submit_create(kind, &scope_id, spec).await?,
            Intent::Update { resource_id, spec } => {
                self.submit_update(&resource_id, spec).await?
            }
            Intent::Delete { resource_id } => self.submit_delete(&resource_id).await?,
        };

        self.executor.dispatch(&receipt.resource_id, operation);
        if let Some(request_id) = request_id {
            self.receipts().put(request_id.to_string(), receipt.clone());
        }
        Ok(receipt)
    }

    async fn submit_create(
        &self,
        kind: ResourceKind,
        scope_id: &str,
        spec: Value,
    ) -> Result<SubmitReceipt> {
        if self.adapters.get(kind).is_none() {
            return Err(SyncError::InvalidIntent(format!(
                "no backend adapter for {}",
                kind
            )));
        }
        if !spec.is_object() {
            return Err(SyncError::InvalidIntent("spec must be a JSON object".into()));
        }
        let scope = self
            .store
            .get_scope(scope_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("scope '{}'", scope_id)))?;
        if scope.level != ScopeLevel::Project {
            return Err(SyncError::InvalidIntent(format!(
                "resources belong to projects, {} is a {}",
                scope_id,
                scope.level.as_str()
            )));
        }

        let amounts = quota::demand(kind, &spec, &Value::Null);
        let record = ResourceRecord::scheduled(kind, scope_id, spec);
        let resource_id = record.id.clone();
        self.ledger.reserve_for(record, amounts).await?;

        self.audit
            .intent_accepted(&resource_id, kind, Operation::Create.as_str(), scope_id);
        info!(resource_id = %resource_id, kind = %kind, scope = %scope_id, "Create accepted");
        Ok(SubmitReceipt {
            resource_id,
            state: ResourceState::CreationScheduled,
        })
    }

    async fn submit_update(&self, resource_id: &str, spec: Value) -> Result<SubmitReceipt> {
        if !spec.is_object() {
            return Err(SyncError::InvalidIntent("spec must be a JSON object".into()));
        }
        let record = self.get(resource_id).await?;
        let merged = merge_spec(&record.spec, &spec);
        let updated = self
            .store
            .transition(
                resource_id,
                Transition::BeginUpdate,
                RecordPatch::new().pending_spec(merged),
            )
            .await?;

        self.audit.intent_accepted(
            resource_id,
            record.kind,
            Operation::Update.as_str(),
            &record.scope_id,
        );
        self.audit.state_changed(resource_id, record.state, updated.state);
        Ok(SubmitReceipt {
            resource_id: resource_id.to_string(),
            state: updated.state,
        })
    }

    async fn submit_delete(&self, resource_id: &str) -> Result<SubmitReceipt> {
        let record = self.get(resource_id).await?;
        let updated = self
            .store
            .transition(resource_id, Transition::ScheduleDeletion, RecordPatch::new())
            .await?;

        self.audit.intent_accepted(
            resource_id,
            record.kind,
            Operation::Delete.as_str(),
            &record.scope_id,
        );
        self.audit.state_changed(resource_id, record.state, updated.state);
        Ok(SubmitReceipt {
            resource_id: resource_id.to_string(),
            state: updated.state,
        })
    }

    /// Withdraw an intent whose executor has not started.
    pub async fn cancel(&self, resource_id: &str) -> Result<ResourceRecord> {
        self.executor.cancel(resource_id).await
    }

    /// Operator override: clear the error of an ERRED record and return it
    /// to OK. Only records known to the backend can be recovered.
    pub async fn recover(&self, resource_id: &str) -> Result<ResourceRecord> {
        let record = self.get(resource_id).await?;
        if record.state == ResourceState::Erred && record.backend_id.is_none() {
            return Err(SyncError::InvalidIntent(format!(
                "resource {} has no backend id, delete it instead",
                resource_id
            )));
        }
        let updated = self
            .store
            .transition(resource_id, Transition::Recover, RecordPatch::new().clear_error())
            .await?;
        self.audit.resource_recovered(resource_id);
        Ok(updated)
    }

    // === Query boundary ===

    pub async fn get(&self, resource_id: &str) -> Result<ResourceRecord> {
        self.store
            .get_record(resource_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("resource '{}'", resource_id)))
    }

    pub async fn list(
        &self,
        scope_id: Option<&str>,
        kind: Option<ResourceKind>,
        state: Option<ResourceState>,
    ) -> Result<Vec<ResourceRecord>> {
        let filter = RecordFilter {
            scope_id: scope_id.map(str::to_string),
            kind,
            state,
            include_deleted: false,
        };
        Ok(self.store.list_records(&filter).await?)
    }

    pub async fn list_scopes(&self) -> Result<Vec<Scope>> {
        Ok(self.store.list_scopes().await?)
    }

    pub async fn get_quota(&self, scope_id: &str) -> Result<QuotaSnapshot> {
        self.ledger.snapshot(scope_id).await
    }

    pub async fn set_limit(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        limit: Option<i64>,
    ) -> Result<QuotaUsage> {
        self.ledger.set_limit(scope_id, metric, limit).await
    }

    pub async fn list_drift(&self, scope_id: &str) -> Result<Vec<DriftReport>> {
        self.ledger.drift_reports(scope_id).await
    }

    // === Reconciliation ===

    pub async fn reconcile(&self, scope_id: &str) -> Result<ReconcileReport> {
        self.reconciler.reconcile_scope(scope_id).await
    }

    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        self.reconciler.reconcile_all().await
    }

    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        Arc::clone(&self.reconciler).spawn_periodic()
    }
}

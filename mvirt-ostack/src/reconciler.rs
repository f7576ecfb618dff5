//! Pull reconciler.
//!
//! Periodically lists what the backend holds per project and resource kind
//! and brings the local records in line: unknown objects are imported,
//! attribute changes are copied, vanished objects mark their record ERRED,
//! and transitional records without a run are resolved. Every pass ends
//! with a ledger recomputation for the scope.

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::OstackAuditLogger;
use crate::backend::{
    AdapterRegistry, BackendAdapter, BackendError, BackendObject, BackendResource, BackendStatus,
};
use crate::config::ReconcileConfig;
use crate::error::{Result, SyncError};
use crate::executor::{Executor, not_found_message};
use crate::model::{
    DriftReport, Operation, QuotaMetric, ResourceKind, ResourceRecord, ResourceState, Scope,
    ScopeLevel,
};
use crate::quota::QuotaLedger;
use crate::store::{DataStore, RecordFilter, RecordPatch, StoreError};

/// What one pass over a scope did.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub scope_id: String,
    /// Records created for unknown backend objects.
    pub imported: Vec<String>,
    /// Records whose attributes were refreshed.
    pub updated: Vec<String>,
    /// Records whose backend object vanished.
    pub disappeared: Vec<String>,
    /// Transitional records settled from the backend's view.
    pub resolved: Vec<String>,
    /// Scheduled records handed to an executor again.
    pub redispatched: Vec<String>,
    pub drift: Vec<DriftReport>,
    pub corrected: Vec<QuotaMetric>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    fn new(scope_id: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            ..Default::default()
        }
    }
}

/// Top-level keys whose values differ between two attribute objects.
fn changed_fields(old: &Value, new: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut keys: Vec<String> = old
        .keys()
        .chain(new.keys())
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Marks a scope busy for the lifetime of a pass.
struct ScopeGuard<'a> {
    busy: &'a Mutex<HashSet<String>>,
    scope_id: String,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.scope_id);
    }
}

pub struct PullReconciler {
    store: Arc<dyn DataStore>,
    ledger: Arc<QuotaLedger>,
    adapters: Arc<AdapterRegistry>,
    executor: Arc<Executor>,
    config: ReconcileConfig,
    audit: Arc<OstackAuditLogger>,
    busy: Mutex<HashSet<String>>,
}

impl PullReconciler {
    pub fn new(
        store: Arc<dyn DataStore>,
        ledger: Arc<QuotaLedger>,
        adapters: Arc<AdapterRegistry>,
        executor: Arc<Executor>,
        config: ReconcileConfig,
        audit: Arc<OstackAuditLogger>,
    ) -> Self {
        Self {
            store,
            ledger,
            adapters,
            executor,
            config,
            audit,
            busy: Mutex::new(HashSet::new()),
        }
    }

    fn busy(&self) -> MutexGuard<'_, HashSet<String>> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, scope_id: &str) -> Result<ScopeGuard<'_>> {
        if !self.busy().insert(scope_id.to_string()) {
            return Err(SyncError::ReconcileInProgress(scope_id.to_string()));
        }
        Ok(ScopeGuard {
            busy: &self.busy,
            scope_id: scope_id.to_string(),
        })
    }

    /// Run one pass over a scope.
    ///
    /// Projects are pulled from the backend; customers and tenants only get
    /// their ledger recomputed. At most one pass per scope runs at a time.
    pub async fn reconcile_scope(&self, scope_id: &str) -> Result<ReconcileReport> {
        let scope = self
            .store
            .get_scope(scope_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("scope '{}'", scope_id)))?;
        let _guard = self.enter(scope_id)?;

        let mut report = ReconcileReport::new(scope_id);
        if scope.level == ScopeLevel::Project {
            for kind in self.adapters.kinds() {
                if let Err(e) = self.pull_kind(&scope, kind, &mut report).await {
                    warn!(scope = %scope_id, kind = %kind, error = %e, "Backend listing failed, skipping kind");
                    report.errors.push(format!("{}: {}", kind, e));
                }
            }
            self.resolve_stale(&scope, &mut report).await?;
        }

        let recompute = self.ledger.recompute(scope_id).await?;
        for drift in recompute
            .drift
            .iter()
            .filter(|d| !recompute.corrected.contains(&d.metric))
        {
            let err = SyncError::ReconciliationDrift {
                scope_id: scope_id.to_string(),
                detail: format!(
                    "{} recorded {}, computed {} ({} passes)",
                    drift.metric, drift.recorded, drift.computed, drift.passes
                ),
            };
            warn!(error = %err, "Ledger counter left uncorrected");
        }
        report.drift = recompute.drift;
        report.corrected = recompute.corrected;

        info!(
            scope = %scope_id,
            imported = report.imported.len(),
            updated = report.updated.len(),
            disappeared = report.disappeared.len(),
            resolved = report.resolved.len(),
            redispatched = report.redispatched.len(),
            drift = report.drift.len(),
            errors = report.errors.len(),
            "Scope reconciled"
        );
        Ok(report)
    }

    /// Reconcile every scope, projects first and concurrently.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        let scopes = self.store.list_scopes().await?;
        let (projects, others): (Vec<Scope>, Vec<Scope>) = scopes
            .into_iter()
            .partition(|s| s.level == ScopeLevel::Project);

        let results: Vec<Result<ReconcileReport>> = futures::stream::iter(projects)
            .map(|scope| async move { self.reconcile_scope(&scope.id).await })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut reports = Vec::new();
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(SyncError::ReconcileInProgress(scope)) => {
                    debug!(scope = %scope, "Pass already running, skipped");
                }
                Err(e) => warn!(error = %e, "Scope reconciliation failed"),
            }
        }

        for scope in others {
            match self.reconcile_scope(&scope.id).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(scope = %scope.id, error = %e, "Ledger recomputation failed"),
            }
        }
        Ok(reports)
    }

    /// Run `reconcile_all` every `interval_secs`.
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.reconcile_all().await {
                    warn!(error = %e, "Reconciliation pass failed");
                }
            }
        })
    }

    async fn pull_kind(
        &self,
        scope: &Scope,
        kind: ResourceKind,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let Some(adapter) = self.adapters.get(kind) else {
            return Ok(());
        };
        let listing: Vec<BackendResource> = adapter
            .list(&scope.id)
            .await?
            .into_iter()
            .filter(|object| object.status != BackendStatus::Deleted)
            .collect();
        let records = self
            .store
            .list_records(&RecordFilter::scope(&scope.id).with_kind(kind))
            .await?;
        let runs = self.executor.runs();

        for object in &listing {
            let known = records
                .iter()
                .find(|r| r.backend_id.as_deref() == Some(object.backend_id.as_str()));
            if let Some(record) = known {
                if !runs.is_active(&record.id) {
                    self.refresh(record, object, report).await;
                }
                continue;
            }

            let orphan = object
                .local_ref
                .as_deref()
                .and_then(|local_ref| records.iter().find(|r| r.id == local_ref));
            if let Some(record) = orphan {
                if !runs.is_active(&record.id) {
                    self.adopt_orphan(record, object, report).await;
                }
                continue;
            }

            self.import(scope, kind, object, report).await;
        }

        let present: HashSet<&str> = listing.iter().map(|o| o.backend_id.as_str()).collect();
        for record in &records {
            let Some(backend_id) = record.backend_id.as_deref() else {
                continue;
            };
            if matches!(record.state, ResourceState::Ok | ResourceState::Updating)
                && !present.contains(backend_id)
                && !runs.is_active(&record.id)
            {
                self.mark_disappeared(adapter.as_ref(), record, backend_id, report)
                    .await;
            }
        }
        Ok(())
    }

    /// Copy backend attributes into a known record.
    async fn refresh(
        &self,
        record: &ResourceRecord,
        object: &BackendResource,
        report: &mut ReconcileReport,
    ) {
        let changed = changed_fields(&record.attributes, &object.attributes);
        if changed.is_empty() {
            return;
        }

        let patch = RecordPatch::new().attributes(object.attributes.clone());
        match self.store.patch_record(&record.id, record.state, patch).await {
            Ok(_) => {
                for field in &changed {
                    let old = record.attributes.get(field).unwrap_or(&Value::Null);
                    let new = object.attributes.get(field).unwrap_or(&Value::Null);
                    info!(
                        resource_id = %record.id,
                        field = %field,
                        old = %old,
                        new = %new,
                        "Attribute changed at backend"
                    );
                }
                report.updated.push(record.id.clone());
            }
            Err(StoreError::StateConflict { .. }) => {
                debug!(resource_id = %record.id, "Record moved during refresh, skipped");
            }
            Err(e) => report.errors.push(format!("{}: {}", record.id, e)),
        }
    }

    /// Attach a backend object created for a record whose create call never
    /// came back.
    async fn adopt_orphan(
        &self,
        record: &ResourceRecord,
        object: &BackendResource,
        report: &mut ReconcileReport,
    ) {
        if record.state != ResourceState::Creating || record.backend_id.is_some() {
            debug!(resource_id = %record.id, state = %record.state, "Backend object tagged for a settled record, skipped");
            return;
        }
        let runs = self.executor.runs();
        let Some(run_id) = runs.claim(&record.id, Operation::Create) else {
            return;
        };

        let result = async {
            let patched = self
                .store
                .patch_record(
                    &record.id,
                    ResourceState::Creating,
                    RecordPatch::new()
                        .backend_id(object.backend_id.clone())
                        .attributes(object.attributes.clone()),
                )
                .await?;
            match &object.status {
                BackendStatus::Stable => {
                    self.executor
                        .complete_create(
                            &patched,
                            BackendObject {
                                backend_id: object.backend_id.clone(),
                                status: object.status.clone(),
                                attributes: object.attributes.clone(),
                            },
                        )
                        .await?;
                }
                BackendStatus::Error(msg) => {
                    let message = format!("Backend reports error status: {}", msg);
                    self.executor.fail(&patched, &message, false).await?;
                }
                // Left for the stale pass to poll
                BackendStatus::Pending | BackendStatus::Deleted => {}
            }
            Ok::<_, SyncError>(())
        }
        .await;
        runs.finish(&record.id, &run_id);

        match result {
            Ok(()) => {
                info!(resource_id = %record.id, backend_id = %object.backend_id, "Orphaned backend object adopted");
                report.resolved.push(record.id.clone());
            }
            Err(e) => report.errors.push(format!("{}: {}", record.id, e)),
        }
    }

    /// Register an unknown backend object as a new OK record.
    async fn import(
        &self,
        scope: &Scope,
        kind: ResourceKind,
        object: &BackendResource,
        report: &mut ReconcileReport,
    ) {
        let record = ResourceRecord::imported(kind, &scope.id, &object.backend_id, object.attributes.clone());
        let resource_id = record.id.clone();

        match self.ledger.adopt(record).await {
            Ok(_) => {
                self.audit
                    .resource_imported(&resource_id, kind, &object.backend_id);
                report.imported.push(resource_id);
            }
            Err(SyncError::Store(StoreError::Conflict(_))) => {
                // Held by a record of another scope or an old DELETED record
                debug!(backend_id = %object.backend_id, kind = %kind, "Backend id already recorded, skipped");
            }
            Err(e) => report.errors.push(format!("{}: {}", object.backend_id, e)),
        }
    }

    /// Mark a record ERRED once `fetch` confirms its object is gone.
    async fn mark_disappeared(
        &self,
        adapter: &dyn BackendAdapter,
        record: &ResourceRecord,
        backend_id: &str,
        report: &mut ReconcileReport,
    ) {
        // The listing may predate the record's backend id
        match adapter.fetch(backend_id).await {
            Err(BackendError::NotFound(_)) => {}
            Ok(object) if object.status == BackendStatus::Deleted => {}
            Ok(_) => {
                debug!(resource_id = %record.id, backend_id = %backend_id, "Object missing from listing still exists, skipped");
                return;
            }
            Err(e) => {
                report.errors.push(format!("{}: {}", record.id, e));
                return;
            }
        }

        let runs = self.executor.runs();
        let Some(run_id) = runs.claim(&record.id, Operation::Update) else {
            return;
        };
        let message = not_found_message(record.error_message.as_deref());
        let result = self.executor.fail(record, &message, false).await;
        runs.finish(&record.id, &run_id);

        match result {
            Ok(_) => {
                self.audit.resource_disappeared(&record.id, backend_id);
                report.disappeared.push(record.id.clone());
            }
            Err(SyncError::StateConflict { .. }) => {
                debug!(resource_id = %record.id, "Record moved before it could be marked, skipped");
            }
            Err(e) => report.errors.push(format!("{}: {}", record.id, e)),
        }
    }

    /// Settle transitional records that no run holds and that have not
    /// moved for `stale_after_secs`.
    async fn resolve_stale(&self, scope: &Scope, report: &mut ReconcileReport) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stale_after_secs as i64);
        let runs = self.executor.runs();
        let stale: Vec<ResourceRecord> = self
            .store
            .list_records(&RecordFilter::scope(&scope.id))
            .await?
            .into_iter()
            .filter(|r| r.state.is_transitional() && r.modified_at <= cutoff && !runs.is_active(&r.id))
            .collect();

        for record in stale {
            match record.state {
                ResourceState::CreationScheduled => {
                    self.executor.dispatch(&record.id, Operation::Create);
                    report.redispatched.push(record.id);
                }
                ResourceState::DeletionScheduled => {
                    self.executor.dispatch(&record.id, Operation::Delete);
                    report.redispatched.push(record.id);
                }
                _ => match self.executor.resume_stale(&record.id).await {
                    Ok(outcome) => {
                        debug!(resource_id = %record.id, ?outcome, "Stale record resumed");
                        report.resolved.push(record.id);
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(resource_id = %record.id, error = %e, "Stale record moved, skipped");
                    }
                    Err(e) => report.errors.push(format!("{}: {}", record.id, e)),
                },
            }
        }
        Ok(())
    }
}

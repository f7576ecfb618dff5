//! Pull reconciliation against the simulated cloud.

mod common;

use common::{Harness, fast_config};
use async_trait::async_trait;
use mvirt_ostack::backend::{
    AdapterRegistry, BackendAdapter, BackendError, BackendObject, BackendResource, BackendStatus,
    CreateRequest, SimCall, SimulatedCloud,
};
use mvirt_ostack::executor::{NOT_FOUND_MESSAGE, RunOutcome};
use mvirt_ostack::lifecycle::Transition;
use mvirt_ostack::model::{Operation, QuotaMetric, ResourceKind, ResourceState};
use mvirt_ostack::store::{LedgerStore, RecordPatch, RecordStore};
use mvirt_ostack::{Intent, SyncError};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Notify;

#[tokio::test]
async fn test_unknown_backend_objects_are_imported() {
    let harness = Harness::spawn().await;
    let first = harness
        .create(ResourceKind::Volume, "project-1", json!({"size": 10}))
        .await;
    let second = harness
        .create(ResourceKind::Volume, "project-1", json!({"size": 20}))
        .await;
    harness.settle().await;
    let before = harness.record(&first).await;

    for size in [1, 2, 3] {
        harness
            .cloud
            .insert_external(ResourceKind::Volume, "project-1", json!({"size": size}));
    }

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.imported.len(), 3);
    assert!(report.updated.is_empty());
    assert!(report.errors.is_empty());
    assert!(report.drift.is_empty());

    let volumes = harness
        .engine
        .list(Some("project-1"), Some(ResourceKind::Volume), None)
        .await
        .unwrap();
    assert_eq!(volumes.len(), 5);
    for id in &report.imported {
        let record = harness.record(id).await;
        assert_eq!(record.state, ResourceState::Ok);
        assert!(record.backend_id.is_some());
    }

    // Records the engine created are left alone
    assert_eq!(harness.record(&first).await, before);
    assert_eq!(harness.record(&second).await.state, ResourceState::Ok);

    // Imported objects are charged on the whole chain
    assert_eq!(harness.usage("project-1", QuotaMetric::Volumes).await, 5);
    assert_eq!(harness.usage("customer-1", QuotaMetric::Storage).await, 36);

    let again = harness.engine.reconcile("project-1").await.unwrap();
    assert!(again.imported.is_empty());
}

#[tokio::test]
async fn test_import_ignores_other_projects() {
    let harness = Harness::spawn().await;
    harness
        .cloud
        .insert_external(ResourceKind::Network, "project-2", json!({"name": "other"}));

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert!(report.imported.is_empty());

    let report = harness.engine.reconcile("project-2").await.unwrap();
    assert_eq!(report.imported.len(), 1);
    assert_eq!(harness.usage("project-1", QuotaMetric::NetworkCount).await, 0);
    assert_eq!(harness.usage("tenant-1", QuotaMetric::NetworkCount).await, 1);
}

#[tokio::test]
async fn test_vanished_object_marks_record_erred() {
    let harness = Harness::spawn().await;
    let id = harness
        .create(ResourceKind::Instance, "project-1", json!({"vcpu": 2}))
        .await;
    harness.settle().await;
    let backend_id = harness.record(&id).await.backend_id.unwrap();
    assert!(harness.cloud.remove(&backend_id));

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.disappeared, vec![id.clone()]);

    let record = harness.record(&id).await;
    assert_eq!(record.state, ResourceState::Erred);
    assert_eq!(record.error_message.as_deref(), Some(NOT_FOUND_MESSAGE));
    assert_eq!(record.backend_id.as_deref(), Some(backend_id.as_str()));

    // A second pass leaves the record and its message alone
    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert!(report.disappeared.is_empty());
    let record = harness.record(&id).await;
    assert_eq!(record.error_message.as_deref(), Some(NOT_FOUND_MESSAGE));

    // Quota stays charged until the record is deleted
    assert_eq!(harness.usage("project-1", QuotaMetric::Vcpu).await, 2);
    harness
        .engine
        .submit(Intent::Delete { resource_id: id.clone() }, None)
        .await
        .unwrap();
    harness.settle().await;
    assert_eq!(harness.record(&id).await.state, ResourceState::Deleted);
    assert_eq!(harness.usage("project-1", QuotaMetric::Vcpu).await, 0);
}

#[tokio::test]
async fn test_backend_attribute_changes_are_copied() {
    let harness = Harness::spawn().await;
    let id = harness
        .create(ResourceKind::Network, "project-1", json!({"name": "lan", "mtu": 1500}))
        .await;
    harness.settle().await;
    let backend_id = harness.record(&id).await.backend_id.unwrap();

    harness.cloud.set_attribute(&backend_id, "mtu", json!(9000));

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.updated, vec![id.clone()]);

    let record = harness.record(&id).await;
    assert_eq!(record.state, ResourceState::Ok);
    assert_eq!(record.attributes["mtu"], 9000);
    assert_eq!(record.attributes["name"], "lan");
    // The requested spec is not rewritten
    assert_eq!(record.spec["mtu"], 1500);
}

#[tokio::test]
async fn test_object_created_before_crash_is_adopted() {
    let harness = Harness::stalled(SimulatedCloud::new()).await;
    let id = harness
        .create(ResourceKind::Instance, "project-1", json!({"vcpu": 2, "name": "batch"}))
        .await;

    // The run got as far as the backend call; its result was never stored
    let record = harness
        .engine
        .store()
        .transition(&id, Transition::BeginCreate, RecordPatch::new())
        .await
        .unwrap();
    harness
        .cloud
        .adapter(ResourceKind::Instance)
        .create(&CreateRequest {
            resource_id: record.id.clone(),
            scope_id: record.scope_id.clone(),
            spec: record.spec.clone(),
        })
        .await
        .unwrap();

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.resolved, vec![id.clone()]);
    assert!(report.imported.is_empty());

    let record = harness.record(&id).await;
    assert_eq!(record.state, ResourceState::Ok);
    assert_eq!(
        record.backend_id,
        harness
            .cloud
            .backend_ids(ResourceKind::Instance, "project-1")
            .first()
            .cloned()
    );

    // Counted once, and the reservation is final
    assert_eq!(harness.usage("project-1", QuotaMetric::Instances).await, 1);
    let reservation = harness
        .engine
        .store()
        .get_reservation(record.reservation_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status.as_str(), "committed");
}

#[tokio::test]
async fn test_stale_creating_record_completes_after_restart() {
    let harness = Harness::stalled(SimulatedCloud::with_settle_polls(3)).await;
    let id = harness
        .create(ResourceKind::Volume, "project-1", json!({"size": 2}))
        .await;

    // First status check scheduled, then the process dies
    let outcome = harness
        .engine
        .executor()
        .run(&id, Operation::Create)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Polling { check: 1 });
    assert_eq!(harness.record(&id).await.state, ResourceState::Creating);

    let restarted = harness.restart().await;
    let report = restarted.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.resolved, vec![id.clone()]);
    assert!(report.imported.is_empty());
    restarted.settle().await;

    let record = restarted.record(&id).await;
    assert_eq!(record.state, ResourceState::Ok);
    assert_eq!(record.attributes["status"], "available");
    assert_eq!(restarted.usage("project-1", QuotaMetric::Storage).await, 2);
}

#[tokio::test]
async fn test_stale_creating_record_without_backend_object_errs() {
    let harness = Harness::stalled(SimulatedCloud::new()).await;
    let id = harness
        .create(ResourceKind::Volume, "project-1", json!({"size": 6}))
        .await;
    harness
        .engine
        .store()
        .transition(&id, Transition::BeginCreate, RecordPatch::new())
        .await
        .unwrap();

    let restarted = harness.restart().await;
    let report = restarted.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.resolved, vec![id.clone()]);

    let record = restarted.record(&id).await;
    assert_eq!(record.state, ResourceState::Erred);
    assert_eq!(record.error_message.as_deref(), Some(NOT_FOUND_MESSAGE));
    assert_eq!(restarted.usage("project-1", QuotaMetric::Storage).await, 0);
}

#[tokio::test]
async fn test_scheduled_create_is_dispatched_again_after_restart() {
    let harness = Harness::stalled(SimulatedCloud::new()).await;
    let id = harness
        .create(ResourceKind::FloatingIp, "project-2", json!({}))
        .await;
    assert_eq!(
        harness.record(&id).await.state,
        ResourceState::CreationScheduled
    );

    let restarted = harness.restart().await;
    let report = restarted.engine.reconcile("project-2").await.unwrap();
    assert_eq!(report.redispatched, vec![id.clone()]);
    restarted.settle().await;

    assert_eq!(restarted.record(&id).await.state, ResourceState::Ok);
    assert_eq!(
        restarted
            .cloud
            .call_count(ResourceKind::FloatingIp, SimCall::Create),
        1
    );
}

#[tokio::test]
async fn test_stale_delete_of_live_object_errs() {
    let harness = Harness::stalled(SimulatedCloud::new()).await;
    let id = harness
        .create(ResourceKind::Backup, "project-1", json!({"size": 1}))
        .await;
    harness
        .engine
        .executor()
        .run(&id, Operation::Create)
        .await
        .unwrap();
    harness
        .engine
        .submit(Intent::Delete { resource_id: id.clone() }, None)
        .await
        .unwrap();

    // Crash after DELETING was stored but before the backend call
    harness
        .engine
        .store()
        .transition(&id, Transition::BeginDelete, RecordPatch::new())
        .await
        .unwrap();

    let restarted = harness.restart().await;
    restarted.engine.reconcile("project-1").await.unwrap();

    let record = restarted.record(&id).await;
    assert_eq!(record.state, ResourceState::Erred);
    assert_eq!(record.error_message.as_deref(), Some("Deletion did not complete"));
    assert!(restarted.cloud.contains(record.backend_id.as_deref().unwrap()));
}

#[tokio::test]
async fn test_listing_failure_skips_only_that_kind() {
    let harness = Harness::spawn().await;
    harness
        .cloud
        .insert_external(ResourceKind::Volume, "project-1", json!({"size": 5}));
    harness
        .cloud
        .insert_external(ResourceKind::Network, "project-1", json!({"name": "wan"}));
    harness.cloud.fail_next(
        ResourceKind::Volume,
        SimCall::List,
        BackendError::Transient("connection reset".to_string()),
    );

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.imported.len(), 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("volume"), "{:?}", report.errors);

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.imported.len(), 1);
    assert!(report.errors.is_empty());
    assert_eq!(harness.usage("project-1", QuotaMetric::Storage).await, 5);
}

#[tokio::test]
async fn test_ledger_drift_is_corrected_after_confirmation() {
    let harness = Harness::spawn().await;
    let id = harness
        .create(ResourceKind::Instance, "project-1", json!({"vcpu": 2}))
        .await;
    harness.settle().await;
    assert_eq!(harness.record(&id).await.state, ResourceState::Ok);

    harness
        .engine
        .store()
        .overwrite_usage("project-1", QuotaMetric::Vcpu, 7)
        .await
        .unwrap();

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.drift.len(), 1);
    assert_eq!(report.drift[0].metric, QuotaMetric::Vcpu);
    assert_eq!(report.drift[0].recorded, 7);
    assert_eq!(report.drift[0].computed, 2);
    assert_eq!(report.drift[0].passes, 1);
    assert!(report.corrected.is_empty());
    assert_eq!(harness.usage("project-1", QuotaMetric::Vcpu).await, 7);

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert_eq!(report.corrected, vec![QuotaMetric::Vcpu]);
    assert_eq!(harness.usage("project-1", QuotaMetric::Vcpu).await, 2);

    let drift = harness.engine.list_drift("project-1").await.unwrap();
    assert_eq!(drift.len(), 1);
    assert!(drift[0].corrected);
    assert!(drift[0].resolved);
    assert_eq!(drift[0].passes, 2);

    let report = harness.engine.reconcile("project-1").await.unwrap();
    assert!(report.drift.is_empty());
}

#[tokio::test]
async fn test_drift_that_heals_is_closed_uncorrected() {
    let harness = Harness::spawn().await;
    harness
        .create(ResourceKind::Volume, "project-2", json!({"size": 3}))
        .await;
    harness.settle().await;

    harness
        .engine
        .store()
        .overwrite_usage("tenant-1", QuotaMetric::Storage, 10)
        .await
        .unwrap();
    let report = harness.engine.reconcile("tenant-1").await.unwrap();
    assert_eq!(report.drift.len(), 1);
    assert!(report.imported.is_empty());

    harness
        .engine
        .store()
        .overwrite_usage("tenant-1", QuotaMetric::Storage, 3)
        .await
        .unwrap();
    let report = harness.engine.reconcile("tenant-1").await.unwrap();
    assert!(report.drift.is_empty());

    let drift = harness.engine.list_drift("tenant-1").await.unwrap();
    assert_eq!(drift.len(), 1);
    assert!(drift[0].resolved);
    assert!(!drift[0].corrected);
}

#[tokio::test]
async fn test_reconcile_all_covers_every_scope() {
    let harness = Harness::spawn().await;
    harness
        .cloud
        .insert_external(ResourceKind::Instance, "project-1", json!({"vcpu": 1}));
    harness
        .cloud
        .insert_external(ResourceKind::Instance, "project-2", json!({"vcpu": 3}));

    let reports = harness.engine.reconcile_all().await.unwrap();
    let mut scopes: Vec<&str> = reports.iter().map(|r| r.scope_id.as_str()).collect();
    scopes.sort();
    assert_eq!(scopes, vec!["customer-1", "project-1", "project-2", "tenant-1"]);

    let imported: usize = reports.iter().map(|r| r.imported.len()).sum();
    assert_eq!(imported, 2);
    assert!(reports.iter().all(|r| r.drift.is_empty()));
    assert_eq!(harness.usage("customer-1", QuotaMetric::Vcpu).await, 4);
}

#[tokio::test]
async fn test_reconcile_unknown_scope() {
    let harness = Harness::with_cloud(SimulatedCloud::new(), fast_config()).await;
    let err = harness.engine.reconcile("project-9").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

/// Adapter whose listing is taken, then held until released.
struct GatedListing {
    inner: Arc<dyn BackendAdapter>,
    listed: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl BackendAdapter for GatedListing {
    fn kind(&self) -> ResourceKind {
        self.inner.kind()
    }

    async fn create(&self, request: &CreateRequest) -> Result<BackendObject, BackendError> {
        self.inner.create(request).await
    }

    async fn update(&self, backend_id: &str, spec: &Value) -> Result<BackendObject, BackendError> {
        self.inner.update(backend_id, spec).await
    }

    async fn delete(&self, backend_id: &str) -> Result<BackendStatus, BackendError> {
        self.inner.delete(backend_id).await
    }

    async fn fetch(&self, backend_id: &str) -> Result<BackendObject, BackendError> {
        self.inner.fetch(backend_id).await
    }

    async fn list(&self, scope_id: &str) -> Result<Vec<BackendResource>, BackendError> {
        let listing = self.inner.list(scope_id).await;
        self.listed.notify_one();
        self.release.notified().await;
        listing
    }
}

#[tokio::test]
async fn test_record_created_during_listing_is_not_marked_disappeared() {
    let cloud = SimulatedCloud::new();
    let listed = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(GatedListing {
        inner: cloud.adapter(ResourceKind::Instance),
        listed: Arc::clone(&listed),
        release: Arc::clone(&release),
    }));
    let harness = Harness::with_adapters(cloud, adapters, fast_config()).await;

    let engine = Arc::clone(&harness.engine);
    let pass = tokio::spawn(async move { engine.reconcile("project-1").await });
    listed.notified().await;

    // Created and settled after the listing was taken
    let id = harness
        .create(ResourceKind::Instance, "project-1", json!({"vcpu": 1}))
        .await;
    harness.settle().await;
    let record = harness.record(&id).await;
    assert_eq!(record.state, ResourceState::Ok);
    assert!(harness.cloud.contains(record.backend_id.as_deref().unwrap()));

    release.notify_one();
    let report = pass.await.unwrap().unwrap();
    assert!(report.disappeared.is_empty());
    assert!(report.errors.is_empty());

    let record = harness.record(&id).await;
    assert_eq!(record.state, ResourceState::Ok);
    assert!(record.error_message.is_none());

    // Once the object is really gone, the next pass marks it
    harness.cloud.remove(record.backend_id.as_deref().unwrap());
    let engine = Arc::clone(&harness.engine);
    let pass = tokio::spawn(async move { engine.reconcile("project-1").await });
    listed.notified().await;
    release.notify_one();
    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.disappeared, vec![id.clone()]);
    assert_eq!(
        harness.record(&id).await.error_message.as_deref(),
        Some(NOT_FOUND_MESSAGE)
    );
}

//! Shared test utilities for mvirt-ostack integration tests.

#![allow(dead_code)]

use mvirt_ostack::backend::{AdapterRegistry, SimulatedCloud};
use mvirt_ostack::config::{PollConfig, ReconcileConfig, RetryConfig, ScopeConfig};
use mvirt_ostack::model::{QuotaMetric, ResourceKind, ResourceRecord, ScopeLevel};
use mvirt_ostack::rest::{AppState, create_router};
use mvirt_ostack::scheduler::{Task, TaskHandle, TaskScheduler, TokioScheduler};
use mvirt_ostack::{Intent, OstackAuditLogger, SqliteStore, SyncConfig, SyncEngine};
use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Allocate an available port for testing.
pub fn allocate_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

/// Scheduler that accepts tasks and never runs them, like a process that
/// died right after scheduling.
#[derive(Default)]
pub struct DroppingScheduler;

impl TaskScheduler for DroppingScheduler {
    fn schedule(&self, _task: Task) -> TaskHandle {
        TaskHandle::new()
    }
}

/// Config with millisecond delays and immediate staleness.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        },
        poll: PollConfig {
            max_checks: 20,
            initial_interval_ms: 1,
            max_interval_ms: 5,
            backoff_multiplier: 1.5,
        },
        reconcile: ReconcileConfig {
            interval_secs: 3600,
            parallelism: 2,
            stale_after_secs: 0,
        },
        scopes: test_scopes(),
        ..Default::default()
    }
}

/// customer-1 > tenant-1 > {project-1, project-2}
pub fn test_scopes() -> Vec<ScopeConfig> {
    let scope = |id: &str, level: ScopeLevel, parent: Option<&str>| ScopeConfig {
        id: id.to_string(),
        name: None,
        level,
        parent: parent.map(str::to_string),
        limits: BTreeMap::new(),
    };
    vec![
        scope("customer-1", ScopeLevel::Customer, None),
        scope("tenant-1", ScopeLevel::Tenant, Some("customer-1")),
        scope("project-1", ScopeLevel::Project, Some("tenant-1")),
        scope("project-2", ScopeLevel::Project, Some("tenant-1")),
    ]
}

/// Engine on a temporary database, backed by a simulated cloud.
pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub cloud: SimulatedCloud,
    pub scheduler: Option<Arc<TokioScheduler>>,
    pub config: SyncConfig,
    dir: Arc<TempDir>,
}

impl Harness {
    /// Harness whose cloud settles every operation immediately.
    pub async fn spawn() -> Self {
        Self::with_cloud(SimulatedCloud::new(), fast_config()).await
    }

    pub async fn with_cloud(cloud: SimulatedCloud, config: SyncConfig) -> Self {
        let adapters = cloud.registry();
        Self::with_adapters(cloud, adapters, config).await
    }

    /// Harness talking to `adapters`, which may wrap the cloud's own.
    pub async fn with_adapters(
        cloud: SimulatedCloud,
        adapters: AdapterRegistry,
        config: SyncConfig,
    ) -> Self {
        let dir = Arc::new(TempDir::new().expect("Failed to create temp dir"));
        let scheduler = Arc::new(TokioScheduler::new(config.retry.clone()));
        Self::build(dir, cloud, adapters, config, Some(scheduler)).await
    }

    /// Harness whose scheduled tasks never run.
    pub async fn stalled(cloud: SimulatedCloud) -> Self {
        let dir = Arc::new(TempDir::new().expect("Failed to create temp dir"));
        let adapters = cloud.registry();
        Self::build(dir, cloud, adapters, fast_config(), None).await
    }

    /// A new engine on the same database and cloud, as after a process
    /// restart. In-memory runs and timers are gone.
    pub async fn restart(&self) -> Self {
        let scheduler = Arc::new(TokioScheduler::new(self.config.retry.clone()));
        Self::build(
            Arc::clone(&self.dir),
            self.cloud.clone(),
            self.cloud.registry(),
            self.config.clone(),
            Some(scheduler),
        )
        .await
    }

    async fn build(
        dir: Arc<TempDir>,
        cloud: SimulatedCloud,
        adapters: AdapterRegistry,
        config: SyncConfig,
        scheduler: Option<Arc<TokioScheduler>>,
    ) -> Self {
        let store = SqliteStore::new(dir.path())
            .await
            .expect("Failed to open store");
        let task_scheduler: Arc<dyn TaskScheduler> = match &scheduler {
            Some(scheduler) => Arc::clone(scheduler) as Arc<dyn TaskScheduler>,
            None => Arc::new(DroppingScheduler),
        };
        let engine = Arc::new(SyncEngine::new(
            Arc::new(store),
            adapters,
            task_scheduler,
            &config,
            Arc::new(OstackAuditLogger::new_noop()),
        ));
        engine
            .bootstrap(&config.scopes)
            .await
            .expect("Failed to bootstrap scopes");

        Self {
            engine,
            cloud,
            scheduler,
            config,
            dir,
        }
    }

    /// Wait until every scheduled executor step has finished.
    pub async fn settle(&self) {
        if let Some(scheduler) = &self.scheduler {
            tokio::time::timeout(Duration::from_secs(10), scheduler.wait_idle())
                .await
                .expect("Executors did not settle");
        }
    }

    /// Submit a create intent and return the new record id.
    pub async fn create(&self, kind: ResourceKind, scope_id: &str, spec: Value) -> String {
        self.engine
            .submit(
                Intent::Create {
                    kind,
                    scope_id: scope_id.to_string(),
                    spec,
                },
                None,
            )
            .await
            .expect("Create rejected")
            .resource_id
    }

    pub async fn record(&self, id: &str) -> ResourceRecord {
        self.engine.get(id).await.expect("Record not found")
    }

    pub async fn usage(&self, scope_id: &str, metric: QuotaMetric) -> i64 {
        self.engine
            .get_quota(scope_id)
            .await
            .expect("Scope not found")
            .usage(metric)
    }
}

/// Test server wrapper serving the REST API of a harness.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub harness: Harness,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    /// Spawn the REST API on a random local port.
    pub async fn spawn() -> Self {
        let harness = Harness::spawn().await;

        let app_state = Arc::new(AppState {
            engine: Arc::clone(&harness.engine),
            audit: Arc::new(OstackAuditLogger::new_noop()),
        });
        let router = create_router(app_state);

        // Bind to port 0 to let the OS choose an available port
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
        let actual_addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        // Small delay to ensure server is ready
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr: actual_addr,
            client: Client::new(),
            harness,
            shutdown_tx,
        }
    }

    /// Get base URL for the REST API.
    pub fn base_url(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }

    /// Perform a GET request.
    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a POST request with JSON body.
    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a POST request without body.
    pub async fn post(&self, path: &str) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a PATCH request with JSON body.
    pub async fn patch_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .patch(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a PUT request with JSON body.
    pub async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .put(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a DELETE request.
    pub async fn delete(&self, path: &str) -> ReqwestResponse {
        self.client
            .delete(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        self.harness.settle().await;
    }
}

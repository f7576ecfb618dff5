use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mvirt_ostack::backend::SimulatedCloud;
use mvirt_ostack::rest::{AppState, create_router};
use mvirt_ostack::scheduler::TokioScheduler;
use mvirt_ostack::{
    DataStore, OstackAuditLogger, SqliteStore, SyncConfig, SyncEngine, create_audit_logger,
};

#[derive(Parser)]
#[command(name = "mvirt-ostack")]
#[command(about = "mvirt OpenStack sync - resource lifecycle and quota reconciliation")]
struct Args {
    /// Listen address for REST API
    #[arg(short, long, default_value = "[::1]:50060")]
    listen: String,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "/var/lib/mvirt/ostack")]
    data_dir: PathBuf,

    /// Run in development mode (simulated cloud, ephemeral storage)
    #[arg(long)]
    dev: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between pull reconciliation passes
    #[arg(long)]
    reconcile_interval_secs: Option<u64>,

    /// Scopes reconciled concurrently
    #[arg(long)]
    reconcile_parallelism: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_ostack=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(secs) = args.reconcile_interval_secs {
        config.reconcile.interval_secs = secs;
    }
    if let Some(parallelism) = args.reconcile_parallelism {
        config.reconcile.parallelism = parallelism;
    }
    config.validate()?;

    info!(
        "Starting mvirt-ostack - REST: {}, reconcile every {}s",
        args.listen, config.reconcile.interval_secs
    );

    // Open store
    let store: Arc<dyn DataStore> = if args.dev {
        Arc::new(SqliteStore::in_memory().await?)
    } else {
        tokio::fs::create_dir_all(&args.data_dir).await?;
        Arc::new(SqliteStore::new(&args.data_dir).await?)
    };

    // Backend adapters
    let adapters = if args.dev {
        info!("Development mode: using simulated cloud");
        SimulatedCloud::with_settle_polls(2).registry()
    } else {
        warn!("No backend adapters configured; only queries and quota management are available");
        Default::default()
    };

    let audit = if args.dev {
        Arc::new(OstackAuditLogger::new_noop())
    } else {
        create_audit_logger()
    };

    let scheduler = Arc::new(TokioScheduler::new(config.retry.clone()));
    let engine = Arc::new(SyncEngine::new(
        store,
        adapters,
        scheduler,
        &config,
        Arc::clone(&audit),
    ));
    engine.bootstrap(&config.scopes).await?;
    let reconciler = engine.spawn_reconciler();

    // Create REST router
    let app_state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        audit,
    });
    let mut router = create_router(app_state);
    if args.dev {
        router = router.layer(CorsLayer::permissive());
    }

    // Start REST server
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("REST API listening on {}", args.listen);

    // Run server with graceful shutdown
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let ctrl_c = signal::ctrl_c();
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        })
        .await?;

    reconciler.abort();
    info!("Shutdown complete");
    Ok(())
}

pub mod config;
pub mod dream;
pub mod error;
pub mod fileref;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod output;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod session;
pub mod worker;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;

use config::{AppConfig, ModeConfig};
use dream::DreamController;
use fileref::FileRefStore;
use hub::Hub;
use output::OutputStore;
use pool::WorkerPool;
use queue::PriorityQueue;
use registry::ModelRegistry;
use session::{spawn_dream_event_pump, spawn_pool_event_pump, SessionRouter};
use worker::{SimWorkerFactory, WorkerFactory};

/// Shared handles every axum route closes over. Cheap to clone: everything
/// behind it is already `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub filerefs: Arc<FileRefStore>,
    pub outputs: Arc<OutputStore>,
    pub router: Arc<SessionRouter>,
    pub hub: Arc<Hub>,
    pub ws_idle_timeout: Duration,
    pub ws_ping_interval: Duration,
    pub modes_path: Arc<str>,
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

/// Wires every component together, binds the HTTP/WS listener, and serves
/// until a shutdown signal arrives. Step-by-step: one accelerator-backed
/// worker pool, one dream controller layered on top of it, one session
/// router bridging the two to the WS hub, then the axum app.
pub async fn run(config: AppConfig, mode_config: ModeConfig) -> anyhow::Result<()> {
    let queue = Arc::new(PriorityQueue::new(config.queue_max));
    let registry = Arc::new(ModelRegistry::new(config.vram_total_bytes));
    let worker_factory: Arc<dyn WorkerFactory> = Arc::new(SimWorkerFactory {
        step_duration: Duration::from_millis(50),
    });
    let outputs = Arc::new(OutputStore::new());
    let filerefs = Arc::new(FileRefStore::new(Duration::from_secs(config.fileref_ttl_seconds)));
    let hub = Arc::new(Hub::new());

    let (pool_events_tx, pool_events_rx) = mpsc::unbounded_channel();
    let pool = Arc::new(WorkerPool::new(
        queue,
        registry,
        mode_config,
        worker_factory,
        outputs.clone(),
        Duration::from_secs(config.job_timeout_seconds),
        pool_events_tx,
    )?);

    let (dream_events_tx, dream_events_rx) = mpsc::unbounded_channel();
    let dream = Arc::new(DreamController::new(
        pool.clone(),
        dream_events_tx,
        Duration::from_millis(config.dream_min_interval_ms),
        Duration::from_millis(config.dream_max_interval_ms),
    ));

    let router = Arc::new(SessionRouter::new(
        pool.clone(),
        dream,
        filerefs.clone(),
        outputs.clone(),
        hub.clone(),
    ));

    let pool_pump = spawn_pool_event_pump(router.clone(), pool_events_rx);
    let dream_pump = spawn_dream_event_pump(router.clone(), dream_events_rx);

    let sweep_filerefs = filerefs.clone();
    let sweep_interval = Duration::from_secs(config.fileref_sweep_interval_seconds);
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweep_filerefs.sweep();
        }
    });

    let status_router = router.clone();
    let status_interval = Duration::from_secs(config.system_status_interval_seconds);
    let status_ticker = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(status_interval);
        loop {
            ticker.tick().await;
            status_router.tick_system_status();
        }
    });

    let state = AppState {
        pool: pool.clone(),
        filerefs,
        outputs,
        router,
        hub,
        ws_idle_timeout: Duration::from_secs(config.ws_idle_timeout_seconds),
        ws_ping_interval: Duration::from_secs(config.ws_ping_interval_seconds),
        modes_path: config.modes_path.clone().into(),
    };

    let app = Router::new()
        .route(&config.ws_path, get(ws::ws_upgrade))
        .route("/upload", post(http::upload))
        .route("/storage/:key", get(http::get_storage))
        .route("/healthz", get(http::healthz))
        .route("/metrics", get(http::metrics))
        .route("/generate", post(http::legacy_generate))
        .route("/superres", post(http::legacy_superres))
        .route("/admin/modes/reload", post(http::reload_modes))
        .with_state(state);

    let addr = format!("{}:{}", config.http_address, config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "dreamqueue-core listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    status_ticker.abort();
    pool_pump.abort();
    dream_pump.abort();
    pool.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "failed to install Ctrl+C handler");
    }
}

//! warden daemon entry point.
//!
//! Wires the store, alert manager, analysis worker, monitor, engine, and
//! IPC server together with explicit dependencies, then waits for a
//! signal or an IPC shutdown request.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wardend::alerts::{AlertManager, DEFAULT_RETENTION_HOURS};
use wardend::analysis;
use wardend::config::{Config, ConfigHandle};
use wardend::handlers::{self, HandlerDeps};
use wardend::llm::{LlmEngine, OllamaEngine};
use wardend::monitor::SystemMonitor;
use wardend::server::IpcServer;
use wardend::store::AlertStore;

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hook();

    let config = Config::load();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| format!("wardend={}", config.log_level)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("warden daemon v{}", warden_shared::VERSION);

    let started_at = Instant::now();
    let config = ConfigHandle::new(config);
    let cfg = config.get();

    // A sick database must not keep the daemon down; fall back to an
    // in-memory store and keep serving.
    let store = match AlertStore::open(&cfg.db_path) {
        Ok(store) => store,
        Err(e) => {
            warn!(
                "Alert store unavailable at {} ({}); using in-memory store",
                cfg.db_path, e
            );
            AlertStore::open(":memory:").context("Failed to open in-memory alert store")?
        }
    };
    let alerts = Arc::new(AlertManager::new(store));

    let engine: Arc<dyn LlmEngine> =
        Arc::new(OllamaEngine::new(cfg.llm_context_length, cfg.llm_threads));

    let analysis_worker = if cfg.enable_ai_alerts {
        let (tx, handle) = analysis::spawn(Arc::clone(&engine), Arc::downgrade(&alerts));
        alerts.enable_ai(tx, Arc::clone(&engine));
        Some(handle)
    } else {
        None
    };

    // One retention pass at startup; dedup and the monitor take it from here.
    let removed = alerts.cleanup_old(chrono::Duration::hours(DEFAULT_RETENTION_HOURS));
    if removed > 0 {
        info!("Startup retention pass removed {} resolved alerts", removed);
    }

    let monitor = Arc::new(SystemMonitor::new(Arc::clone(&alerts), config.clone()));
    monitor.start();

    // Best-effort warm start of the configured model; clients can load a
    // different one over IPC at any time.
    if cfg.enable_ai_alerts && !cfg.model_path.is_empty() {
        let engine = Arc::clone(&engine);
        let monitor = Arc::clone(&monitor);
        let model_path = cfg.model_path.clone();
        tokio::spawn(async move {
            match engine.load(&model_path).await {
                Ok(model) => monitor.set_llm_state(true, &model.name, engine.queue_size()),
                Err(e) => warn!("Default model not loaded: {}", e),
            }
        });
    }

    // Bind failure is the one startup error worth dying for.
    let server = IpcServer::new(&cfg.socket_path, cfg.max_requests_per_sec);
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    handlers::register_all(
        &server,
        HandlerDeps {
            monitor: Arc::clone(&monitor),
            alerts: Arc::clone(&alerts),
            engine: Arc::clone(&engine),
            config: config.clone(),
            started_at,
            shutdown: shutdown_tx,
        },
    );
    server.start()?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
        _ = shutdown_rx.recv() => info!("Shutdown requested over IPC"),
    }

    info!("Shutting down");
    server.stop().await;
    monitor.stop();

    // Dropping the last manager handle closes the analysis queue; the
    // server's handler registry holds one, so it goes first.
    drop(server);
    drop(monitor);
    drop(alerts);
    if let Some(handle) = analysis_worker {
        if tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .is_err()
        {
            warn!("Analysis worker still busy at exit");
        }
    }

    info!("Goodbye");
    Ok(())
}

fn setup_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        error!("PANIC at {}: {}", location, panic_info);
        default_hook(panic_info);
    }));
}

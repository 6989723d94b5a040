//! Control-plane method implementations.

use crate::alerts::AlertManager;
use crate::config::ConfigHandle;
use crate::llm::{InferenceRequest, LlmEngine};
use crate::monitor::SystemMonitor;
use crate::server::IpcServer;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};
use warden_shared::protocol::{error_codes, methods};
use warden_shared::{Alert, AlertSeverity, AlertType, Response, NAME, VERSION};

/// Everything the handlers need, passed in explicitly.
#[derive(Clone)]
pub struct HandlerDeps {
    pub monitor: Arc<SystemMonitor>,
    pub alerts: Arc<AlertManager>,
    pub engine: Arc<dyn LlmEngine>,
    pub config: ConfigHandle,
    pub started_at: Instant,
    pub shutdown: mpsc::Sender<()>,
}

/// Register the full method surface on the server.
pub fn register_all(server: &IpcServer, deps: HandlerDeps) {
    server.register(methods::PING, |_req| {
        Box::pin(async { Response::ok(json!({"pong": true})) })
    });

    server.register(methods::VERSION, |_req| {
        Box::pin(async { Response::ok(json!({"version": VERSION, "name": NAME})) })
    });

    let d = deps.clone();
    server.register(methods::STATUS, move |_req| {
        let d = d.clone();
        Box::pin(async move {
            let snapshot = d.monitor.get_snapshot();
            Response::ok(json!({
                "version": VERSION,
                "uptime_seconds": d.started_at.elapsed().as_secs(),
                "running": d.monitor.is_running(),
                "health": snapshot,
                "llm": d.engine.status(),
            }))
        })
    });

    let d = deps.clone();
    server.register(methods::HEALTH, move |_req| {
        let d = d.clone();
        Box::pin(async move {
            let mut snapshot = d.monitor.get_snapshot();
            if snapshot.is_empty() {
                debug!("Snapshot empty, running forced health check");
                let monitor = Arc::clone(&d.monitor);
                snapshot = match tokio::task::spawn_blocking(move || monitor.force_check()).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        return Response::err(
                            format!("Health check failed: {}", e),
                            error_codes::INTERNAL_ERROR,
                        )
                    }
                };
            }
            // The engine is authoritative for LLM state; the mirror in
            // the snapshot may lag.
            snapshot.llm_loaded = d.engine.is_loaded();
            snapshot.llm_model_name = d.engine.model_info().map(|m| m.name).unwrap_or_default();
            match serde_json::to_value(&snapshot) {
                Ok(value) => Response::ok(value),
                Err(e) => Response::err(e.to_string(), error_codes::INTERNAL_ERROR),
            }
        })
    });

    let alerts = Arc::clone(&deps.alerts);
    let list_handler = move |req: warden_shared::Request| {
        let alerts = Arc::clone(&alerts);
        Box::pin(async move { handle_alerts(&alerts, &req) }) as crate::server::HandlerFuture
    };
    server.register(methods::ALERTS, list_handler.clone());
    server.register(methods::ALERTS_GET, list_handler);

    let alerts = Arc::clone(&deps.alerts);
    server.register(methods::ALERTS_ACK, move |req| {
        let alerts = Arc::clone(&alerts);
        Box::pin(async move {
            if let Some(id) = req.param_str("id") {
                return if alerts.acknowledge(id) {
                    Response::ok(json!({"acknowledged": id}))
                } else {
                    Response::err("Alert not found", error_codes::ALERT_NOT_FOUND)
                };
            }
            if req.param_bool("all").unwrap_or(false) {
                let count = alerts.acknowledge_all();
                return Response::ok(json!({"acknowledged_count": count}));
            }
            Response::err("Missing 'id' or 'all' parameter", error_codes::INVALID_PARAMS)
        })
    });

    let alerts = Arc::clone(&deps.alerts);
    server.register(methods::ALERTS_DISMISS, move |req| {
        let alerts = Arc::clone(&alerts);
        Box::pin(async move {
            let Some(id) = req.param_str("id") else {
                return Response::err("Missing 'id' parameter", error_codes::INVALID_PARAMS);
            };
            if alerts.dismiss(id) {
                Response::ok(json!({"dismissed": id}))
            } else {
                Response::err("Alert not found", error_codes::ALERT_NOT_FOUND)
            }
        })
    });

    let config = deps.config.clone();
    server.register(methods::CONFIG_GET, move |_req| {
        let config = config.clone();
        Box::pin(async move { Response::ok(serde_json::json!(config.get())) })
    });

    let config = deps.config.clone();
    server.register(methods::CONFIG_RELOAD, move |_req| {
        let config = config.clone();
        Box::pin(async move {
            match config.reload() {
                Ok(()) => Response::ok(json!({"reloaded": true})),
                Err(e) => Response::err(
                    format!("Failed to reload configuration: {}", e),
                    error_codes::CONFIG_ERROR,
                ),
            }
        })
    });

    let engine = Arc::clone(&deps.engine);
    server.register(methods::LLM_STATUS, move |_req| {
        let engine = Arc::clone(&engine);
        Box::pin(async move { Response::ok(json!(engine.status())) })
    });

    let d = deps.clone();
    server.register(methods::LLM_LOAD, move |req| {
        let d = d.clone();
        Box::pin(async move {
            let Some(model_path) = req.param_str("model_path") else {
                return Response::err(
                    "Missing 'model_path' parameter",
                    error_codes::INVALID_PARAMS,
                );
            };
            match d.engine.load(model_path).await {
                Ok(model) => {
                    d.monitor
                        .set_llm_state(true, &model.name, d.engine.queue_size());
                    Response::ok(json!({"loaded": true, "model": model}))
                }
                Err(e) => Response::err(
                    format!("Failed to load model: {}", e),
                    error_codes::INTERNAL_ERROR,
                ),
            }
        })
    });

    let d = deps.clone();
    server.register(methods::LLM_UNLOAD, move |_req| {
        let d = d.clone();
        Box::pin(async move {
            d.engine.unload().await;
            d.monitor.set_llm_state(false, "", 0);
            Response::ok(json!({"unloaded": true}))
        })
    });

    let engine = Arc::clone(&deps.engine);
    server.register(methods::LLM_INFER, move |req| {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            if !engine.is_loaded() {
                return Response::err("Model not loaded", error_codes::LLM_NOT_LOADED);
            }
            let Some(prompt) = req.param_str("prompt") else {
                return Response::err("Missing 'prompt' parameter", error_codes::INVALID_PARAMS);
            };

            let request = InferenceRequest {
                prompt: prompt.to_string(),
                max_tokens: req.param_i64("max_tokens").map(|v| v.max(0) as u32),
                temperature: req.param_f64("temperature").map(|v| v as f32),
                top_p: req.param_f64("top_p").map(|v| v as f32),
                stop: req.param_str("stop").map(str::to_string),
            };
            Response::ok(json!(engine.infer(request).await))
        })
    });

    let shutdown = deps.shutdown.clone();
    server.register(methods::SHUTDOWN, move |_req| {
        let shutdown = shutdown.clone();
        Box::pin(async move {
            info!("Shutdown requested via IPC");
            let _ = shutdown.try_send(());
            Response::ok(json!({"shutdown": "initiated"}))
        })
    });
}

fn handle_alerts(alerts: &AlertManager, req: &warden_shared::Request) -> Response {
    let limit = req.param_i64("limit").unwrap_or(100).max(0) as usize;

    let mut list: Vec<Alert> = if let Some(raw) = req.param_str("severity") {
        let Some(severity) = AlertSeverity::parse(raw) else {
            return Response::err(
                format!("Unknown severity: {}", raw),
                error_codes::INVALID_PARAMS,
            );
        };
        alerts.get_by_severity(severity)
    } else if let Some(raw) = req.param_str("type") {
        let Some(alert_type) = AlertType::parse(raw) else {
            return Response::err(
                format!("Unknown alert type: {}", raw),
                error_codes::INVALID_PARAMS,
            );
        };
        alerts.get_by_type(alert_type)
    } else {
        alerts.get_active()
    };

    list.truncate(limit);
    Response::ok(json!({
        "alerts": list,
        "count": list.len(),
        "total_active": alerts.count_active(),
    }))
}

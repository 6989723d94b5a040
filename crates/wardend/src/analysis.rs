//! Background AI analysis of threshold alerts.
//!
//! A bounded queue feeds one worker task. The worker holds only a weak
//! reference to the alert manager: dropping the manager closes the queue
//! and cancels pending work, so shutdown never waits on inference.

use crate::alerts::AlertManager;
use crate::llm::{InferenceRequest, LlmEngine};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_shared::{AlertSeverity, AlertType};

/// Jobs waiting for analysis. A full queue drops new jobs rather than
/// blocking threshold evaluation.
pub const QUEUE_CAPACITY: usize = 16;

const ANALYSIS_MAX_TOKENS: u32 = 256;

/// One analysis request, captured from a freshly admitted primary alert.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub parent_id: String,
    pub severity: AlertSeverity,
    pub alert_type: AlertType,
    pub title: String,
    pub message: String,
    pub context: HashMap<String, String>,
}

/// Spawn the analysis worker. The returned sender goes to the alert
/// manager; the handle lets the daemon await worker exit on shutdown.
pub fn spawn(
    engine: Arc<dyn LlmEngine>,
    manager: Weak<AlertManager>,
) -> (mpsc::Sender<AnalysisJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AnalysisJob>(QUEUE_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            run_job(engine.as_ref(), &manager, job).await;
        }
        debug!("Analysis queue closed, worker exiting");
    });
    (tx, handle)
}

async fn run_job(engine: &dyn LlmEngine, manager: &Weak<AlertManager>, job: AnalysisJob) {
    // The engine can be unloaded between enqueue and dequeue.
    if !engine.is_loaded() {
        debug!("Skipping analysis for {}: engine unloaded", job.parent_id);
        return;
    }

    let request = InferenceRequest {
        prompt: build_prompt(&job),
        max_tokens: Some(ANALYSIS_MAX_TOKENS),
        ..Default::default()
    };
    let result = engine.infer(request).await;
    if !result.success {
        // Analysis failures are silent: the primary alert stands.
        debug!(
            "Analysis inference failed for {}: {}",
            job.parent_id,
            result.error.unwrap_or_default()
        );
        return;
    }

    let Some(manager) = manager.upgrade() else {
        warn!("Alert manager gone, dropping analysis for {}", job.parent_id);
        return;
    };

    let mut metadata = HashMap::new();
    metadata.insert("parent_alert_id".to_string(), job.parent_id.clone());
    metadata.insert("inference_ms".to_string(), result.time_ms.to_string());
    if let Some(info) = engine.model_info() {
        metadata.insert("model".to_string(), info.name);
    }

    manager.create(
        AlertSeverity::Info,
        AlertType::AiAnalysis,
        &format!("Analysis: {}", job.title),
        result.output.trim(),
        metadata,
    );
    debug!("Analysis alert attached to {}", job.parent_id);
}

/// Per-type prompt template plus the captured context lines.
fn build_prompt(job: &AnalysisJob) -> String {
    let lead = match job.alert_type {
        AlertType::DiskUsage => {
            "Disk usage on this host crossed an alerting threshold. \
             Suggest the most likely causes and two or three concrete cleanup steps."
        }
        AlertType::MemoryUsage => {
            "Memory usage on this host crossed an alerting threshold. \
             Suggest likely culprits and how to confirm them."
        }
        AlertType::CpuUsage => {
            "CPU usage on this host crossed an alerting threshold. \
             Suggest how to identify the offending processes."
        }
        AlertType::SecurityUpdate => {
            "Pending security updates were detected on this host. \
             Summarize the risk and recommend an update strategy."
        }
        AlertType::CveFound => {
            "Known vulnerabilities affect packages installed on this host. \
             Summarize the exposure and recommend mitigations."
        }
        AlertType::System | AlertType::AiAnalysis => {
            "A host health alert fired. Explain what it means and what to check first."
        }
    };

    let mut prompt = format!(
        "You are a Linux system administration assistant. {}\n\n\
         Alert [{}]: {}\n{}\n",
        lead,
        job.severity.as_str(),
        job.title,
        job.message
    );
    if !job.context.is_empty() {
        prompt.push_str("\nContext:\n");
        let mut keys: Vec<_> = job.context.keys().collect();
        keys.sort();
        for key in keys {
            prompt.push_str(&format!("  {}: {}\n", key, job.context[key]));
        }
    }
    prompt.push_str("\nAnswer in at most five sentences.");
    prompt
}

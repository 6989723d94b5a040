//! LLM engine interface and the Ollama-backed implementation.
//!
//! The daemon only depends on the [`LlmEngine`] trait; the production
//! engine talks to a local Ollama instance over HTTP.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const OLLAMA_API: &str = "http://127.0.0.1:11434";

/// Metadata for a loaded model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub context_length: u32,
}

/// Engine state as reported by `llm.status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStatus {
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
    pub queue_size: usize,
}

/// One synchronous inference call.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Option<String>,
}

/// Outcome of an inference call. Failures are data, not errors; callers
/// decide whether a failed inference matters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub time_ms: u64,
}

impl InferenceResult {
    pub fn failure(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            time_ms: elapsed.as_millis() as u64,
        }
    }
}

/// The inference capability the daemon core depends on.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    fn is_loaded(&self) -> bool;
    fn model_info(&self) -> Option<ModelInfo>;
    fn queue_size(&self) -> usize;

    fn status(&self) -> LlmStatus {
        LlmStatus {
            loaded: self.is_loaded(),
            model: self.model_info(),
            queue_size: self.queue_size(),
        }
    }

    async fn load(&self, model: &str) -> Result<ModelInfo>;
    async fn unload(&self);
    async fn infer(&self, request: InferenceRequest) -> InferenceResult;
}

/// Engine backed by a local Ollama server.
pub struct OllamaEngine {
    base_url: String,
    http: reqwest::Client,
    model: Mutex<Option<ModelInfo>>,
    pending: AtomicUsize,
    context_length: u32,
    threads: u32,
}

impl OllamaEngine {
    pub fn new(context_length: u32, threads: u32) -> Self {
        Self::with_base_url(OLLAMA_API, context_length, threads)
    }

    pub fn with_base_url(base_url: &str, context_length: u32, threads: u32) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            model: Mutex::new(None),
            pending: AtomicUsize::new(0),
            context_length,
            threads,
        }
    }

    /// Check whether the Ollama server has the given model available.
    async fn has_model(&self, model: &str) -> Result<bool> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Ollama tags request failed: {}", response.status()));
        }

        let json: serde_json::Value = response.json().await?;
        let found = json
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models.iter().any(|m| {
                    m.get("name")
                        .and_then(|n| n.as_str())
                        .map(|n| n == model || n.starts_with(&format!("{}:", model)))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        Ok(found)
    }
}

/// Build the /api/generate request body for a model and request.
fn generate_body(model: &str, request: &InferenceRequest, threads: u32) -> serde_json::Value {
    let mut options = serde_json::Map::new();
    if threads > 0 {
        options.insert("num_thread".to_string(), threads.into());
    }
    if let Some(max_tokens) = request.max_tokens {
        options.insert("num_predict".to_string(), max_tokens.into());
    }
    if let Some(temperature) = request.temperature {
        options.insert("temperature".to_string(), temperature.into());
    }
    if let Some(top_p) = request.top_p {
        options.insert("top_p".to_string(), top_p.into());
    }
    if let Some(ref stop) = request.stop {
        options.insert("stop".to_string(), serde_json::json!([stop]));
    }

    serde_json::json!({
        "model": model,
        "prompt": request.prompt,
        "stream": false,
        "options": options,
    })
}

#[async_trait]
impl LlmEngine for OllamaEngine {
    fn is_loaded(&self) -> bool {
        self.model.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn model_info(&self) -> Option<ModelInfo> {
        self.model.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn queue_size(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    async fn load(&self, model: &str) -> Result<ModelInfo> {
        if !self.has_model(model).await? {
            return Err(anyhow!("Model not available in Ollama: {}", model));
        }

        let info = ModelInfo {
            name: model.to_string(),
            context_length: self.context_length,
        };
        *self.model.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        info!("Model loaded: {}", model);
        Ok(info)
    }

    async fn unload(&self) {
        let previous = self
            .model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(info) = previous {
            info!("Model unloaded: {}", info.name);
        }
    }

    async fn infer(&self, request: InferenceRequest) -> InferenceResult {
        let started = Instant::now();

        let Some(info) = self.model_info() else {
            return InferenceResult::failure("No model loaded", started.elapsed());
        };

        self.pending.fetch_add(1, Ordering::Relaxed);
        let result = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&generate_body(&info.name, &request, self.threads))
            .send()
            .await;
        self.pending.fetch_sub(1, Ordering::Relaxed);

        let response = match result {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("Inference request failed: {}", r.status());
                return InferenceResult::failure(
                    format!("Ollama request failed: {}", r.status()),
                    started.elapsed(),
                );
            }
            Err(e) => {
                warn!("Inference request failed: {}", e);
                return InferenceResult::failure(e.to_string(), started.elapsed());
            }
        };

        let json: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return InferenceResult::failure(e.to_string(), started.elapsed()),
        };

        let output = json
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();

        debug!("Inference completed in {}ms", started.elapsed().as_millis());
        InferenceResult {
            success: true,
            output,
            error: None,
            time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// In-process engine double for tests: canned replies, recorded prompts.
pub struct StubEngine {
    loaded: AtomicBool,
    model: Mutex<Option<ModelInfo>>,
    reply: Mutex<String>,
    fail: AtomicBool,
    prompts: Mutex<Vec<String>>,
}

impl StubEngine {
    pub fn unloaded() -> Self {
        Self {
            loaded: AtomicBool::new(false),
            model: Mutex::new(None),
            reply: Mutex::new("stub analysis".to_string()),
            fail: AtomicBool::new(false),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn loaded(model: &str) -> Self {
        let engine = Self::unloaded();
        engine.loaded.store(true, Ordering::SeqCst);
        *engine.model.lock().unwrap() = Some(ModelInfo {
            name: model.to_string(),
            context_length: 2048,
        });
        engine
    }

    pub fn set_reply(&self, reply: &str) {
        *self.reply.lock().unwrap() = reply.to_string();
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmEngine for StubEngine {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn model_info(&self) -> Option<ModelInfo> {
        self.model.lock().unwrap().clone()
    }

    fn queue_size(&self) -> usize {
        0
    }

    async fn load(&self, model: &str) -> Result<ModelInfo> {
        let info = ModelInfo {
            name: model.to_string(),
            context_length: 2048,
        };
        *self.model.lock().unwrap() = Some(info.clone());
        self.loaded.store(true, Ordering::SeqCst);
        Ok(info)
    }

    async fn unload(&self) {
        self.loaded.store(false, Ordering::SeqCst);
        *self.model.lock().unwrap() = None;
    }

    async fn infer(&self, request: InferenceRequest) -> InferenceResult {
        self.prompts.lock().unwrap().push(request.prompt);
        if self.fail.load(Ordering::SeqCst) {
            return InferenceResult::failure("stub failure", Duration::from_millis(1));
        }
        InferenceResult {
            success: true,
            output: self.reply.lock().unwrap().clone(),
            error: None,
            time_ms: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_body_includes_only_set_options() {
        let request = InferenceRequest {
            prompt: "hello".to_string(),
            max_tokens: Some(128),
            temperature: None,
            top_p: Some(0.9),
            stop: Some("\n\n".to_string()),
        };
        let body = generate_body("qwen2.5:0.5b-instruct", &request, 4);

        assert_eq!(body["model"], "qwen2.5:0.5b-instruct");
        assert_eq!(body["prompt"], "hello");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["options"]["num_thread"], 4);
        assert_eq!(body["options"]["top_p"], 0.9);
        assert_eq!(body["options"]["stop"][0], "\n\n");
        assert!(body["options"].get("temperature").is_none());
    }

    #[tokio::test]
    async fn stub_engine_lifecycle() {
        let engine = StubEngine::unloaded();
        assert!(!engine.is_loaded());
        assert!(engine.model_info().is_none());

        engine.load("test-model").await.unwrap();
        assert!(engine.is_loaded());
        assert_eq!(engine.model_info().unwrap().name, "test-model");

        let status = engine.status();
        assert!(status.loaded);
        assert_eq!(status.queue_size, 0);

        engine.unload().await;
        assert!(!engine.is_loaded());
    }

    #[tokio::test]
    async fn stub_engine_records_prompts_and_fails_on_demand() {
        let engine = StubEngine::loaded("m");
        engine.set_reply("analysis text");

        let result = engine
            .infer(InferenceRequest {
                prompt: "why is the disk full?".to_string(),
                ..Default::default()
            })
            .await;
        assert!(result.success);
        assert_eq!(result.output, "analysis text");
        assert_eq!(engine.prompts(), vec!["why is the disk full?".to_string()]);

        engine.set_failing(true);
        let result = engine.infer(InferenceRequest::default()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn ollama_engine_infer_without_model_fails_fast() {
        let engine = OllamaEngine::with_base_url("http://127.0.0.1:1", 2048, 0);
        let result = engine.infer(InferenceRequest::default()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No model loaded"));
    }
}

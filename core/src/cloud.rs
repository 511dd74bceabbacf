//! Cloud backend: OpenAI-compatible chat completions over the gateway.
//!
//! The cloud path goes through the same [`ModelService`] interface as
//! on-device backends, so the orchestrator's timeout race, stop-sequence
//! handling, and metrics assembly are identical regardless of where a
//! request executes.

use crate::adapter::{CancelToken, GenerationRequest, ModelService, RawGeneration, StreamSink};
use crate::config::CloudConfig;
use crate::error::{LumenError, LumenResult};
use serde_json::json;
use std::time::{Duration, Instant};

/// Gateway-backed cloud generation client.
pub struct CloudClient {
    config: CloudConfig,
    model_id: String,
    agent: ureq::Agent,
}

impl CloudClient {
    /// Create a client that bills requests against `model_id`.
    pub fn new(config: CloudConfig, model_id: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms as u64))
            .build();
        Self {
            config,
            model_id: model_id.into(),
            agent,
        }
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": &request.prompt}));

        let model = self
            .config
            .default_model
            .clone()
            .unwrap_or_else(|| self.model_id.clone());

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
        });
        if !request.stop_sequences.is_empty() {
            body["stop"] = json!(request.stop_sequences);
        }
        if let Some(seed) = request.seed {
            body["seed"] = json!(seed);
        }
        body
    }

    fn complete(&self, request: &GenerationRequest) -> LumenResult<RawGeneration> {
        let url = format!(
            "{}/chat/completions",
            self.config.gateway_url.trim_end_matches('/')
        );
        let body = self.request_body(request);

        let started = Instant::now();
        let mut http = self.agent.post(&url).set("Content-Type", "application/json");
        if let Some(key) = self.config.resolve_api_key() {
            http = http.set("Authorization", &format!("Bearer {}", key));
        }

        let response = http
            .send_json(&body)
            .map_err(|e| LumenError::GenerationFailed(format!("gateway: {}", e)))?;
        let payload: serde_json::Value = response
            .into_json()
            .map_err(|e| LumenError::GenerationFailed(format!("gateway response: {}", e)))?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                LumenError::GenerationFailed("gateway response missing content".into())
            })?
            .to_string();
        let tokens_used = payload["usage"]["completion_tokens"]
            .as_u64()
            .unwrap_or_else(|| text.split_whitespace().count() as u64)
            as u32;

        Ok(RawGeneration {
            text,
            tokens_used,
            tokenization_ms: 0,
            inference_ms: started.elapsed().as_millis() as u64,
        })
    }
}

impl ModelService for CloudClient {
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> LumenResult<RawGeneration> {
        if cancel.is_cancelled() {
            return Err(LumenError::GenerationFailed("cancelled".into()));
        }
        self.complete(request)
    }

    fn generate_stream(
        &self,
        request: &GenerationRequest,
        sink: StreamSink,
        cancel: &CancelToken,
    ) -> LumenResult<RawGeneration> {
        // The gateway does not stream yet; the completion is chunked
        // locally so callers observe the same incremental interface.
        let raw = self.generate(request, cancel)?;
        for word in raw.text.split_inclusive(' ') {
            if cancel.is_cancelled() {
                break;
            }
            if !sink.emit(word) {
                break;
            }
        }
        Ok(raw)
    }
}

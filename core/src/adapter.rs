//! Framework adapter registry.
//!
//! A framework adapter wraps one inference backend (llama.cpp, Core ML, MLX,
//! ONNX, ...) behind a uniform create/load/configure interface. The registry
//! maps a logical framework to a registered adapter and selects adapters for
//! models with first-match-wins semantics in registration order.
//!
//! The actual inference kernels live behind [`ModelService`]; this crate
//! never looks inside them.

use crate::device::HardwareCapabilities;
use crate::error::{LumenError, LumenResult};
use crate::registry::{ModelFormat, ModelInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Logical inference framework identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Framework {
    /// llama.cpp (GGUF models)
    LlamaCpp,
    /// Apple Core ML (.mlpackage models)
    CoreMl,
    /// Apple MLX
    Mlx,
    /// WhisperKit (speech recognition bundles)
    WhisperKit,
    /// ONNX Runtime
    Onnx,
    /// TensorFlow Lite
    TfLite,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::LlamaCpp => "llamaCpp",
            Framework::CoreMl => "coreML",
            Framework::Mlx => "mlx",
            Framework::WhisperKit => "whisperKit",
            Framework::Onnx => "onnx",
            Framework::TfLite => "tfLite",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Modality an adapter can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Modality {
    Text,
    VoiceToText,
    TextToVoice,
}

/// Cooperative cancellation flag shared between the orchestrator and a
/// backend service. Services check it between decode steps; the timeout race
/// sets it so that the losing side actually stops working.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Fully-resolved request handed to a backend service.
///
/// All option fields are concrete here; defaults were already merged by the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub seed: Option<u64>,
    /// Per-backend tuning knobs, opaque to the orchestrator.
    pub framework_options: HashMap<String, serde_json::Value>,
}

/// Raw output of a backend service, before orchestrator post-processing.
#[derive(Debug, Clone)]
pub struct RawGeneration {
    pub text: String,
    pub tokens_used: u32,
    /// Time the backend spent tokenizing the prompt.
    pub tokenization_ms: u64,
    /// Time the backend spent in the decode loop.
    pub inference_ms: u64,
}

/// Sink for incremental text fragments produced by a streaming backend.
///
/// Backed by a bounded tokio channel; `emit` returns `false` once the
/// consumer is gone, which a well-behaved service treats as cancellation.
pub struct StreamSink {
    tx: mpsc::Sender<String>,
}

impl StreamSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Emit a fragment. Returns `false` if the consumer hung up.
    pub fn emit(&self, fragment: impl Into<String>) -> bool {
        self.tx.blocking_send(fragment.into()).is_ok()
    }
}

/// A loaded backend ready to serve generation requests.
///
/// Implementations are blocking; the orchestrator runs them on the blocking
/// thread pool and races them against the request timeout.
pub trait ModelService: Send + Sync {
    /// Run a complete generation and return the assembled output.
    fn generate(&self, request: &GenerationRequest, cancel: &CancelToken)
        -> LumenResult<RawGeneration>;

    /// Run a generation, pushing fragments into `sink` as they decode.
    /// Returns the final raw generation once the stream ends.
    fn generate_stream(
        &self,
        request: &GenerationRequest,
        sink: StreamSink,
        cancel: &CancelToken,
    ) -> LumenResult<RawGeneration>;

    /// Release backend resources (contexts, sessions). Idempotent.
    fn cleanup(&self) {}
}

/// A pluggable inference backend capable of creating services for models.
pub trait FrameworkAdapter: Send + Sync {
    /// The framework this adapter implements.
    fn framework(&self) -> Framework;

    /// Modalities the adapter can serve.
    fn modalities(&self) -> &[Modality];

    /// On-disk formats the adapter accepts.
    fn formats(&self) -> &[ModelFormat];

    /// Whether this adapter can load the given model.
    fn can_handle(&self, model: &ModelInfo) -> bool {
        model.compatible_frameworks.contains(&self.framework())
            && self.formats().contains(&model.format)
    }

    /// Create an unloaded service for the modality.
    fn create_service(&self, modality: Modality) -> LumenResult<Arc<dyn ModelService>>;

    /// Load the model and return an initialized service.
    fn load_model(
        &self,
        model: &ModelInfo,
        modality: Modality,
    ) -> LumenResult<Arc<dyn ModelService>>;

    /// Apply hardware configuration (accelerator selection, thread counts).
    fn configure(&self, _hardware: &HardwareCapabilities) {}

    /// Estimated memory footprint of loading the model with this adapter.
    fn estimate_memory_usage(&self, model: &ModelInfo) -> u64 {
        model.estimated_memory
    }
}

/// Registry of framework adapters.
///
/// Selection is first-match-wins in registration order; there is no scoring.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn FrameworkAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Order matters: earlier registrations win ties.
    pub fn register(&mut self, adapter: Arc<dyn FrameworkAdapter>) {
        log::debug!("registered adapter for {}", adapter.framework());
        self.adapters.push(adapter);
    }

    /// First registered adapter whose `can_handle` accepts the model.
    pub fn find_best_adapter(&self, model: &ModelInfo) -> Option<Arc<dyn FrameworkAdapter>> {
        self.adapters.iter().find(|a| a.can_handle(model)).cloned()
    }

    /// Frameworks with a live registered adapter.
    ///
    /// Reflects what is actually usable right now, not the set of frameworks
    /// the crate knows about.
    pub fn available_frameworks(&self) -> Vec<Framework> {
        let mut seen = Vec::new();
        for adapter in &self.adapters {
            let fw = adapter.framework();
            if !seen.contains(&fw) {
                seen.push(fw);
            }
        }
        seen
    }

}

impl AdapterRegistry {
    /// Find an adapter and load the model in one step, surfacing
    /// `FrameworkNotAvailable` when nothing matches.
    pub fn load_with_best(
        &self,
        model: &ModelInfo,
        modality: Modality,
    ) -> LumenResult<(Framework, Arc<dyn ModelService>)> {
        let adapter = self
            .find_best_adapter(model)
            .ok_or(LumenError::FrameworkNotAvailable(model.preferred_framework))?;
        let service = adapter.load_model(model, modality)?;
        Ok((adapter.framework(), service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAdapter;

    fn gguf_model(id: &str) -> ModelInfo {
        ModelInfo::new(id, id, ModelFormat::Gguf, Framework::LlamaCpp)
    }

    #[test]
    fn first_match_wins_in_registration_order() {
        let mut registry = AdapterRegistry::new();
        let first = MockAdapter::new(Framework::LlamaCpp).with_memory_estimate(111);
        let second = MockAdapter::new(Framework::LlamaCpp).with_memory_estimate(222);
        registry.register(Arc::new(first));
        registry.register(Arc::new(second));

        let model = gguf_model("phi-3-mini");
        let chosen = registry.find_best_adapter(&model).unwrap();
        assert_eq!(chosen.estimate_memory_usage(&model), 111);
    }

    #[test]
    fn available_frameworks_reflect_live_adapters_only() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.available_frameworks().is_empty());

        registry.register(Arc::new(MockAdapter::new(Framework::LlamaCpp)));
        registry.register(Arc::new(MockAdapter::new(Framework::Onnx)));
        registry.register(Arc::new(MockAdapter::new(Framework::Onnx)));

        assert_eq!(
            registry.available_frameworks(),
            vec![Framework::LlamaCpp, Framework::Onnx]
        );
    }

    #[test]
    fn no_adapter_means_framework_not_available() {
        let registry = AdapterRegistry::new();
        let model = gguf_model("phi-3-mini");
        let err = registry.load_with_best(&model, Modality::Text).err();
        assert!(matches!(err, Some(LumenError::FrameworkNotAvailable(_))));
    }
}

//! Generation result types.
//!
//! A [`GenerationResult`] is an immutable value assembled once per request.
//! Timing figures come from two places: backends report tokenization and
//! decode time, the orchestrator measures queue wait and post-processing
//! around them.

use crate::adapter::Framework;
use crate::device::AcceleratorClass;
use crate::routing::{RouteTarget, RoutingReason};
use serde::{Deserialize, Serialize};

/// Per-phase performance breakdown for one generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Time spent tokenizing the prompt (backend-reported).
    pub tokenization_ms: u64,
    /// Time spent in the decode loop (backend-reported).
    pub inference_ms: u64,
    /// Orchestrator post-processing (thinking-tag filtering, assembly).
    pub post_processing_ms: u64,
    /// Time between request arrival and backend dispatch.
    pub queue_wait_ms: u64,
    /// Decode throughput.
    pub tokens_per_second: f64,
    /// Peak resident memory during the request, if known.
    pub peak_memory_bytes: Option<u64>,
}

/// Structured metadata preserved for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultExtras {
    /// Why the router picked the target it did.
    pub routing_reason: RoutingReason,
    /// Whether execution fell back from the originally routed target.
    pub fallback_used: bool,
    /// Whether the result came from a cache rather than a fresh decode.
    pub cache_hit: bool,
}

/// Output of a completed generation. Constructed once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_used: u32,
    /// Identifier of the model that served the request.
    pub model_id: String,
    /// End-to-end wall-clock latency.
    pub latency_ms: u64,
    /// Where the request actually executed.
    pub execution_target: RouteTarget,
    /// Estimated cost avoided relative to a cloud baseline, in USD.
    pub cost_saved: f64,
    /// Framework that executed, when on-device.
    pub framework: Option<Framework>,
    /// Accelerator class engaged, when known.
    pub accelerator: Option<AcceleratorClass>,
    /// Memory consumed by the request, if the backend reports it.
    pub memory_used_bytes: Option<u64>,
    pub metrics: PerformanceMetrics,
    pub extras: ResultExtras,
}

impl GenerationResult {
    /// Tokens per second, recomputed from the stored figures.
    pub fn throughput(&self) -> f64 {
        self.metrics.tokens_per_second
    }

    pub fn executed_on_device(&self) -> bool {
        matches!(self.execution_target, RouteTarget::OnDevice { .. })
    }
}

//! lumen-core: on-device/cloud hybrid LLM inference orchestration.
//!
//! The crate orchestrates everything around inference without implementing
//! inference itself: model catalog and artifact downloads, a per-model
//! lifecycle state machine, device/cloud routing, blocking backend adapters
//! raced against timeouts, and generation analytics.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`orchestrator`] | [`LumenRuntime`]: the facade tying everything together |
//! | [`registry`] | Model catalog, persistence, on-disk discovery |
//! | [`lifecycle`] | Per-model state machine with defined error re-entry |
//! | [`download`] | Resumable single-file and manifest-driven package fetches |
//! | [`routing`] | Pure device/cloud/hybrid routing decisions |
//! | [`adapter`] | Backend adapter registry and the [`ModelService`] seam |
//! | [`cloud`] | OpenAI-compatible gateway client |
//! | [`device`] | Hardware capability detection and resource snapshots |
//! | [`options`] | Sparse per-call options merged over persisted defaults |
//! | [`result`] | Immutable generation results and metrics |
//! | [`analytics`] | Session-grouped generation analytics |
//! | [`config`] | Runtime tunables and the data directory layout |
//! | [`error`] | The unified [`LumenError`] type |
//!
//! # Quick start
//!
//! ```no_run
//! use lumen_core::{GenerationOptions, LumenRuntime, RuntimeConfig};
//!
//! # async fn run() -> lumen_core::LumenResult<()> {
//! let runtime = LumenRuntime::with_config(RuntimeConfig::default())?;
//! runtime.load_model("phi-3-mini").await?;
//! let result = runtime
//!     .generate("What is 2 + 2?", &GenerationOptions::default().with_max_tokens(10))
//!     .await?;
//! println!("{} ({} on {})", result.text, result.tokens_used, result.execution_target);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod adapter;
pub mod analytics;
pub mod cloud;
pub mod config;
pub mod device;
pub mod download;
pub mod error;
pub mod lifecycle;
pub mod options;
pub mod orchestrator;
pub mod registry;
pub mod result;
pub mod routing;
pub mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use adapter::{
    AdapterRegistry, CancelToken, Framework, FrameworkAdapter, GenerationRequest, Modality,
    ModelService, RawGeneration, StreamSink,
};
pub use analytics::{AnalyticsSink, AnalyticsTracker, GenerationRecord, SessionSummary};
pub use cloud::CloudClient;
pub use config::{default_data_dir, CloudConfig, RuntimeConfig};
pub use device::{
    AcceleratorClass, DeviceSnapshot, HardwareCapabilities, HardwareRequirements, LoadBand,
    ThermalState,
};
pub use download::{
    DownloadManager, DownloadProgress, DownloadStrategy, DownloadTask, DownloadTransport,
};
pub use error::{LumenError, LumenResult};
pub use lifecycle::{LifecycleFault, LifecycleMachine, LifecycleObserver, ModelLifecycleState};
pub use options::{BudgetFallback, GenerationDefaults, GenerationOptions, TokenBudget};
pub use orchestrator::{GenerationStream, LumenRuntime};
pub use registry::{ModelFormat, ModelInfo, ModelRegistry};
pub use result::{GenerationResult, PerformanceMetrics, ResultExtras};
pub use routing::{
    CustomRouter, ExecutionTarget, ResourceThresholds, RouteTarget, RoutingDecision, RoutingEngine,
    RoutingPolicy, RoutingReason,
};

//! The runtime: ties the catalog, lifecycle, routing, downloads, backends,
//! and analytics together behind one facade.
//!
//! # Concurrency model
//!
//! - One model is resident at a time; the loaded slot is an async mutex.
//! - Each model id owns a lifecycle machine behind its own async mutex.
//!   Concurrent `load_model` calls for the same id serialize on it: the
//!   first caller does the work, later callers find the model resident and
//!   return immediately (block-and-share, no duplicate loads).
//! - Backend services are blocking and run on the blocking thread pool,
//!   raced against the configured generation timeout. The losing side is
//!   cancelled through a shared [`CancelToken`], not abandoned.
//! - Analytics ingestion never affects generation outcomes; failures are
//!   logged and swallowed here.

use crate::adapter::{
    AdapterRegistry, CancelToken, Framework, FrameworkAdapter, GenerationRequest, Modality,
    ModelService,
};
use crate::analytics::{AnalyticsTracker, GenerationRecord};
use crate::cloud::CloudClient;
use crate::config::RuntimeConfig;
use crate::device::{self, HardwareCapabilities};
use crate::download::{DownloadManager, DownloadStrategy, DownloadTask, TaskState};
use crate::error::{LumenError, LumenResult};
use crate::lifecycle::{LifecycleFault, LifecycleMachine, LifecycleObserver, ModelLifecycleState};
use crate::options::{
    resolve, BudgetFallback, GenerationDefaults, GenerationOptions, ResolvedOptions,
};
use crate::registry::{ModelInfo, ModelRegistry};
use crate::result::{GenerationResult, PerformanceMetrics, ResultExtras};
use crate::routing::{ExecutionTarget, RouteTarget, RoutingDecision, RoutingEngine};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Canonical order the lifecycle walks when loading a model.
const LOAD_CHAIN: &[ModelLifecycleState] = &[
    ModelLifecycleState::Discovered,
    ModelLifecycleState::Downloading,
    ModelLifecycleState::Downloaded,
    ModelLifecycleState::Validating,
    ModelLifecycleState::Validated,
    ModelLifecycleState::Initializing,
    ModelLifecycleState::Initialized,
    ModelLifecycleState::Loading,
    ModelLifecycleState::Loaded,
    ModelLifecycleState::Ready,
];

struct LoadedModel {
    model: ModelInfo,
    framework: Framework,
    service: Arc<dyn ModelService>,
}

/// The orchestration runtime.
///
/// An explicit, caller-constructed handle: nothing here is a process-wide
/// singleton, and several runtimes with separate data directories can
/// coexist (the `lumen-sdk` facade layers an idempotent, coalescing
/// `initialize()` on top for the common one-runtime case).
pub struct LumenRuntime {
    config: RuntimeConfig,
    registry: Arc<ModelRegistry>,
    adapters: RwLock<AdapterRegistry>,
    router: RoutingEngine,
    downloads: Arc<DownloadManager>,
    analytics: Arc<AnalyticsTracker>,
    capabilities: HardwareCapabilities,
    defaults: RwLock<GenerationDefaults>,
    lifecycles: Mutex<HashMap<String, Arc<tokio::sync::Mutex<LifecycleMachine>>>>,
    loaded: tokio::sync::Mutex<Option<LoadedModel>>,
}

impl LumenRuntime {
    /// Build a runtime with the default HTTP transport. Loads the
    /// persisted catalog and generation defaults, and scans the models
    /// directory for artifacts left by previous runs.
    pub fn with_config(config: RuntimeConfig) -> LumenResult<Self> {
        let timeout = config.download_timeout;
        Self::with_transport(config, Arc::new(crate::download::HttpTransport::new(timeout)))
    }

    /// Build a runtime fetching artifacts through `transport`.
    pub fn with_transport(
        config: RuntimeConfig,
        transport: Arc<dyn crate::download::DownloadTransport>,
    ) -> LumenResult<Self> {
        let registry = ModelRegistry::with_data_dir(&config.data_dir)?;
        registry.discover(&config.models_dir())?;

        let defaults = match fs::read_to_string(config.settings_path()) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                log::warn!("malformed settings.json, using defaults: {}", e);
                GenerationDefaults::default()
            }),
            Err(_) => GenerationDefaults::default(),
        };

        let capabilities = device::detect_capabilities();
        log::info!(
            "runtime up: {} cores, {} MiB RAM, accelerator {}, thermal {}",
            capabilities.cpu_cores,
            capabilities.total_memory / (1024 * 1024),
            capabilities.accelerator.as_str(),
            capabilities.thermal_state.as_str()
        );

        Ok(Self {
            router: RoutingEngine::new(
                config.thresholds.clone(),
                config.cloud.provider.clone(),
                config.hybrid_device_portion,
            ),
            downloads: Arc::new(DownloadManager::new(transport)),
            analytics: Arc::new(AnalyticsTracker::new(config.analytics_enabled)),
            registry: Arc::new(registry),
            adapters: RwLock::new(AdapterRegistry::new()),
            capabilities,
            defaults: RwLock::new(defaults),
            lifecycles: Mutex::new(HashMap::new()),
            loaded: tokio::sync::Mutex::new(None),
            config,
        })
    }

    // ========================================================================
    // Registration and configuration
    // ========================================================================

    /// Register a backend adapter. The adapter is configured with the
    /// detected hardware before it serves any load.
    pub fn register_adapter(&self, adapter: Arc<dyn FrameworkAdapter>) {
        adapter.configure(&self.capabilities);
        self.adapters
            .write()
            .expect("adapter lock poisoned")
            .register(adapter);
    }

    /// Register a custom download strategy, consulted before the built-ins.
    pub fn register_download_strategy(&self, strategy: Arc<dyn DownloadStrategy>) {
        self.downloads.register_strategy(strategy);
    }

    /// Register or replace a catalog entry.
    pub fn register_model(&self, model: ModelInfo) {
        self.registry.register(model);
        if let Err(e) = self.registry.persist() {
            log::warn!("catalog persist failed: {}", e);
        }
    }

    /// Snapshot of every known model, sorted by id.
    pub fn list_available_models(&self) -> Vec<ModelInfo> {
        self.registry.all()
    }

    /// Mark a model as wrapping reasoning output in the given delimiter
    /// pair (or clear the flag). Tagged spans are filtered from generation
    /// output.
    pub fn set_thinking_support(
        &self,
        model_id: &str,
        tags: Option<(String, String)>,
    ) -> LumenResult<()> {
        self.registry.set_thinking_support(model_id, tags)?;
        if let Err(e) = self.registry.persist() {
            log::warn!("catalog persist failed: {}", e);
        }
        Ok(())
    }

    pub fn available_frameworks(&self) -> Vec<Framework> {
        self.adapters
            .read()
            .expect("adapter lock poisoned")
            .available_frameworks()
    }

    pub fn hardware_capabilities(&self) -> &HardwareCapabilities {
        &self.capabilities
    }

    pub fn analytics(&self) -> &AnalyticsTracker {
        self.analytics.as_ref()
    }

    pub fn generation_defaults(&self) -> GenerationDefaults {
        self.defaults.read().expect("defaults lock poisoned").clone()
    }

    /// Replace the persisted generation defaults. Persistence is best
    /// effort: a write failure keeps the in-memory value and logs.
    pub fn set_generation_defaults(&self, defaults: GenerationDefaults) {
        match serde_json::to_string_pretty(&defaults) {
            Ok(raw) => {
                if let Err(e) = fs::write(self.config.settings_path(), raw) {
                    log::warn!("settings persist failed: {}", e);
                }
            }
            Err(e) => log::warn!("settings serialize failed: {}", e),
        }
        *self.defaults.write().expect("defaults lock poisoned") = defaults;
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn machine_for(&self, model_id: &str) -> Arc<tokio::sync::Mutex<LifecycleMachine>> {
        let mut machines = self.lifecycles.lock().expect("lifecycle lock poisoned");
        Arc::clone(machines.entry(model_id.to_string()).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(LifecycleMachine::new(
                model_id,
                ModelLifecycleState::Discovered,
            )))
        }))
    }

    /// Register a lifecycle observer for a model. Observers fire
    /// synchronously on every transition, including ones driven by
    /// background download workers.
    pub async fn observe_lifecycle(&self, model_id: &str, observer: LifecycleObserver) {
        let machine = self.machine_for(model_id);
        machine.lock().await.add_observer(observer);
    }

    /// Current lifecycle state of a model, if it is being tracked.
    pub async fn lifecycle_state(&self, model_id: &str) -> Option<ModelLifecycleState> {
        let machine = {
            let machines = self.lifecycles.lock().expect("lifecycle lock poisoned");
            machines.get(model_id).cloned()
        }?;
        let state = machine.lock().await.state();
        Some(state)
    }

    /// Load a model and make it the resident one, unloading any previous
    /// resident. Concurrent calls for the same id coalesce: they serialize
    /// on the model's lifecycle mutex and later callers share the result.
    /// Returns the loaded model's catalog snapshot.
    pub async fn load_model(&self, model_id: &str) -> LumenResult<ModelInfo> {
        let model = self
            .registry
            .get(model_id)
            .ok_or_else(|| LumenError::ModelNotFound(model_id.to_string()))?;
        if !model.is_loadable() {
            return Err(LumenError::LoadingFailed(format!(
                "{}: no compatible frameworks",
                model_id
            )));
        }

        let machine = self.machine_for(model_id);
        let mut machine = machine.lock().await;

        // A concurrent caller may have finished the load while this one
        // waited for the lifecycle mutex.
        {
            let loaded = self.loaded.lock().await;
            if loaded.as_ref().is_some_and(|l| l.model.id == model_id)
                && machine.state() == ModelLifecycleState::Ready
            {
                log::debug!("{}: already resident, sharing", model_id);
                return Ok(model);
            }
        }

        drive_to(&mut machine, ModelLifecycleState::Loading)?;

        let load_result = self
            .adapters
            .read()
            .expect("adapter lock poisoned")
            .load_with_best(&model, Modality::Text);
        let (framework, service) = match load_result {
            Ok(pair) => pair,
            Err(e) => {
                machine.handle_error(LifecycleFault::BackendFailure(e.to_string()));
                return Err(match e {
                    LumenError::FrameworkNotAvailable(fw) => LumenError::FrameworkNotAvailable(fw),
                    other => LumenError::LoadingFailed(other.to_string()),
                });
            }
        };

        drive_to(&mut machine, ModelLifecycleState::Ready)?;

        let mut loaded = self.loaded.lock().await;
        if let Some(previous) = loaded.take() {
            log::info!("unloading {} to load {}", previous.model.id, model_id);
            previous.service.cleanup();
            self.forget_machine(&previous.model.id);
        }
        *loaded = Some(LoadedModel {
            model: model.clone(),
            framework,
            service,
        });
        if let Err(e) = self.registry.touch_last_used(model_id) {
            log::debug!("last-used update failed: {}", e);
        }
        log::info!("{}: loaded on {}", model_id, framework);
        Ok(model)
    }

    /// Unload the resident model, if any. Idempotent.
    pub async fn unload_model(&self) {
        let mut loaded = self.loaded.lock().await;
        if let Some(previous) = loaded.take() {
            previous.service.cleanup();
            self.forget_machine(&previous.model.id);
            log::info!("{}: unloaded", previous.model.id);
        }
    }

    /// Id of the resident model, if any.
    pub async fn current_model(&self) -> Option<String> {
        self.loaded.lock().await.as_ref().map(|l| l.model.id.clone())
    }

    fn forget_machine(&self, model_id: &str) {
        self.lifecycles
            .lock()
            .expect("lifecycle lock poisoned")
            .remove(model_id);
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Start a background download for a cataloged model. Returns a task
    /// handle for progress polling, cancellation, and awaiting the result.
    ///
    /// On success the artifact path is recorded in the catalog (only after
    /// validation passed) and a per-model manifest is written next to the
    /// artifact so it survives catalog loss.
    pub fn download_model(&self, model_id: &str) -> LumenResult<DownloadTask> {
        let model = self
            .registry
            .get(model_id)
            .ok_or_else(|| LumenError::ModelNotFound(model_id.to_string()))?;

        let dest_root = self.config.models_dir();
        let state = Arc::new(TaskState::default());
        let machine = self.machine_for(model_id);

        let downloads = Arc::clone(&self.downloads);
        let registry = Arc::clone(&self.registry);
        let worker_state = Arc::clone(&state);
        let worker_dest = dest_root.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_download(&downloads, &registry, &model, &worker_dest, &worker_state, &machine)
        });

        Ok(DownloadTask::new(
            model_id.to_string(),
            dest_root,
            state,
            handle,
        ))
    }

    /// Delete a model's local artifacts and clear its catalog location.
    /// Unloads the model first if it is resident.
    pub async fn delete_model(&self, model_id: &str) -> LumenResult<()> {
        if self.current_model().await.as_deref() == Some(model_id) {
            self.unload_model().await;
        }
        let model = self
            .registry
            .get(model_id)
            .ok_or_else(|| LumenError::ModelNotFound(model_id.to_string()))?;

        let model_dir = self.config.models_dir().join(model_id);
        if model_dir.exists() {
            fs::remove_dir_all(&model_dir)?;
        } else if let Some(path) = &model.local_path {
            if path.exists() {
                fs::remove_dir_all(path).or_else(|_| fs::remove_file(path))?;
            }
        }
        self.registry.clear_local_path(model_id)?;
        self.registry.persist()?;
        self.forget_machine(model_id);
        log::info!("{}: deleted local artifacts", model_id);
        Ok(())
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Run a complete generation against the resident model.
    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> LumenResult<GenerationResult> {
        self.run_generation(prompt, None, options, "text").await
    }

    async fn run_generation(
        &self,
        prompt: &str,
        system_prompt: Option<String>,
        options: &GenerationOptions,
        session_type: &str,
    ) -> LumenResult<GenerationResult> {
        let arrived = Instant::now();
        let (model, framework, service) = self.resident().await?;
        // Catalog metadata (thinking tags, last-used) may have changed since
        // the model was loaded; prefer the live entry.
        let model = self.registry.get(&model.id).unwrap_or(model);
        let resolved = self.resolve_with_budget(options)?;
        let decision = self.route(&resolved, &model);
        let request = build_request(prompt, system_prompt, &resolved);

        let machine = self.machine_for(&model.id);
        {
            let mut machine = machine.lock().await;
            if let Err(e) = machine.transition_to(ModelLifecycleState::Executing) {
                log::debug!("{}: lifecycle out of step: {}", model.id, e);
            }
        }

        let queue_wait_ms = arrived.elapsed().as_millis() as u64;
        let started = Instant::now();

        let executed = match &decision.target {
            RouteTarget::OnDevice { .. } => self
                .execute(Arc::clone(&service), request.clone())
                .await
                .map(|raw| (raw, false)),
            RouteTarget::Cloud { .. } => self
                .execute(self.cloud_service(&model), request.clone())
                .await
                .map(|raw| (raw, false)),
            RouteTarget::Hybrid { .. } => {
                // Device first; cloud picks up the request if the device
                // side fails for any reason other than a timeout.
                match self.execute(Arc::clone(&service), request.clone()).await {
                    Ok(raw) => Ok((raw, false)),
                    Err(LumenError::GenerationFailed(detail)) if detail.contains("timed out") => {
                        Err(LumenError::GenerationFailed(detail))
                    }
                    Err(e) => {
                        log::warn!("hybrid device side failed, falling back to cloud: {}", e);
                        self.execute(self.cloud_service(&model), request)
                            .await
                            .map(|raw| (raw, true))
                    }
                }
            }
        };

        {
            let mut machine = machine.lock().await;
            match &executed {
                Ok(_) => {
                    if let Err(e) = machine.transition_to(ModelLifecycleState::Ready) {
                        log::debug!("{}: lifecycle out of step: {}", model.id, e);
                    }
                }
                Err(e) => machine.handle_error(LifecycleFault::BackendFailure(e.to_string())),
            }
        }
        let (raw, fallback_used) = executed?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let post_started = Instant::now();
        let text = apply_stop_sequences(&raw.text, &resolved.stop_sequences);
        // Tokens spent past a stop match were discarded with the text; the
        // reported count covers what the caller actually received.
        let tokens_used = if text.len() < raw.text.len() {
            text.split_whitespace().count() as u32
        } else {
            raw.tokens_used
        };
        let mut text = text;
        if let Some(tags) = &model.metadata.thinking_tags {
            text = strip_thinking(&text, tags);
        }
        let post_processing_ms = post_started.elapsed().as_millis() as u64;

        let result = self.assemble(
            &model,
            framework,
            &decision,
            text,
            tokens_used,
            latency_ms,
            PerformanceMetrics {
                tokenization_ms: raw.tokenization_ms,
                inference_ms: raw.inference_ms,
                post_processing_ms,
                queue_wait_ms,
                tokens_per_second: throughput(raw.tokens_used, raw.inference_ms),
                peak_memory_bytes: None,
            },
            fallback_used,
        );
        self.record(session_type, &result, true);
        Ok(result)
    }

    /// Run a streaming generation against the resident model.
    ///
    /// Fragments arrive in order; stop sequences are honored across
    /// fragment boundaries (matched text is never emitted); the terminal
    /// [`GenerationResult`] is delivered through [`GenerationStream::finish`].
    pub async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> LumenResult<GenerationStream> {
        let arrived = Instant::now();
        let (model, framework, service) = self.resident().await?;
        let resolved = self.resolve_with_budget(options)?;
        let decision = self.route(&resolved, &model);
        let request = build_request(prompt, None, &resolved);

        let service: Arc<dyn ModelService> = match &decision.target {
            RouteTarget::Cloud { .. } => self.cloud_service(&model),
            _ => service,
        };

        let machine = self.machine_for(&model.id);
        {
            let mut machine = machine.lock().await;
            if let Err(e) = machine.transition_to(ModelLifecycleState::Executing) {
                log::debug!("{}: lifecycle out of step: {}", model.id, e);
            }
        }

        let (raw_tx, raw_rx) = mpsc::channel::<String>(32);
        let (out_tx, out_rx) = mpsc::channel::<StreamEvent>(32);
        let cancel = CancelToken::new();

        let backend_cancel = cancel.clone();
        let backend = tokio::task::spawn_blocking(move || {
            service.generate_stream(
                &request,
                crate::adapter::StreamSink::new(raw_tx),
                &backend_cancel,
            )
        });

        let driver = StreamDriver {
            model,
            framework,
            decision,
            stop_sequences: resolved.stop_sequences.clone(),
            max_tokens: resolved.max_tokens,
            timeout: self.config.generation_timeout,
            queue_wait_ms: arrived.elapsed().as_millis() as u64,
            cost_per_1k: self.config.cloud_cost_per_1k_tokens,
            machine,
        };
        tokio::spawn(driver.run(
            raw_rx,
            out_tx,
            backend,
            cancel,
            Arc::clone(&self.analytics),
        ));

        Ok(GenerationStream {
            rx: out_rx,
            finished: None,
        })
    }

    /// Generate and parse a typed value from model output.
    ///
    /// A system prompt instructing JSON-only output is injected. Up to
    /// three attempts run, lowering the temperature by 0.2 per retry
    /// (floor 0.1) to coax the model toward literal output.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> LumenResult<T> {
        let system = "Respond with a single JSON object matching the \
                      requested structure. No prose, no code fences."
            .to_string();
        let initial = options
            .temperature
            .unwrap_or_else(|| self.generation_defaults().temperature);

        let mut last_detail = String::new();
        for attempt in 1..=3u32 {
            let mut attempt_options = options.clone();
            attempt_options.temperature =
                Some((initial - 0.2 * (attempt - 1) as f32).max(0.1));

            let result = self
                .run_generation(prompt, Some(system.clone()), &attempt_options, "structured")
                .await?;
            match extract_json(&result.text) {
                Some(json) => match serde_json::from_str::<T>(json) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        last_detail = format!("attempt {}: parse error: {}", attempt, e);
                        log::debug!("structured {}", last_detail);
                    }
                },
                None => {
                    last_detail = format!("attempt {}: no JSON object in output", attempt);
                    log::debug!("structured {}", last_detail);
                }
            }
        }
        Err(LumenError::ExtractionFailed(last_detail))
    }

    // ------------------------------------------------------------------------

    async fn resident(
        &self,
    ) -> LumenResult<(ModelInfo, Framework, Arc<dyn ModelService>)> {
        let loaded = self.loaded.lock().await;
        let loaded = loaded
            .as_ref()
            .ok_or_else(|| LumenError::ModelNotFound("no model loaded".to_string()))?;
        Ok((
            loaded.model.clone(),
            loaded.framework,
            Arc::clone(&loaded.service),
        ))
    }

    fn resolve_with_budget(&self, options: &GenerationOptions) -> LumenResult<ResolvedOptions> {
        let defaults = self.generation_defaults();
        let mut resolved = resolve(options, &defaults);
        if let Some(budget) = resolved.token_budget.clone() {
            if resolved.max_tokens > budget.max_tokens {
                match budget.fallback_behavior {
                    BudgetFallback::Truncate => {
                        log::debug!(
                            "token budget caps max_tokens {} -> {}",
                            resolved.max_tokens,
                            budget.max_tokens
                        );
                        resolved.max_tokens = budget.max_tokens;
                    }
                    BudgetFallback::SwitchToDevice => {
                        resolved.preferred_execution_target = Some(ExecutionTarget::OnDevice);
                    }
                    BudgetFallback::Stop => {
                        return Err(LumenError::GenerationFailed(format!(
                            "token budget exceeded: requested {}, budget {}",
                            resolved.max_tokens, budget.max_tokens
                        )));
                    }
                }
            }
        }
        Ok(resolved)
    }

    fn route(&self, resolved: &ResolvedOptions, model: &ModelInfo) -> RoutingDecision {
        self.router.decide(
            resolved.preferred_execution_target,
            model,
            &self.config.routing_policy,
            &device::snapshot(),
        )
    }

    fn cloud_service(&self, model: &ModelInfo) -> Arc<dyn ModelService> {
        Arc::new(CloudClient::new(self.config.cloud.clone(), model.id.clone()))
    }

    /// Race a blocking backend call against the generation timeout. On
    /// timeout the cancel token is set so the backend actually stops.
    async fn execute(
        &self,
        service: Arc<dyn ModelService>,
        request: GenerationRequest,
    ) -> LumenResult<crate::adapter::RawGeneration> {
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let handle =
            tokio::task::spawn_blocking(move || service.generate(&request, &worker_cancel));
        let timeout = self.config.generation_timeout;

        tokio::select! {
            joined = handle => joined
                .map_err(|e| LumenError::GenerationFailed(format!("worker panicked: {}", e)))?,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                Err(LumenError::GenerationFailed(format!(
                    "timed out after {:?}", timeout
                )))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        model: &ModelInfo,
        framework: Framework,
        decision: &RoutingDecision,
        text: String,
        tokens_used: u32,
        latency_ms: u64,
        metrics: PerformanceMetrics,
        fallback_used: bool,
    ) -> GenerationResult {
        let on_device = matches!(
            decision.target,
            RouteTarget::OnDevice { .. } | RouteTarget::Hybrid { .. }
        ) && !fallback_used;
        let cost_saved = if on_device {
            tokens_used as f64 / 1000.0 * self.config.cloud_cost_per_1k_tokens
        } else {
            0.0
        };
        GenerationResult {
            text,
            tokens_used,
            model_id: model.id.clone(),
            latency_ms,
            execution_target: decision.target.clone(),
            cost_saved,
            framework: on_device.then_some(framework),
            accelerator: on_device.then_some(self.capabilities.accelerator),
            memory_used_bytes: None,
            metrics,
            extras: ResultExtras {
                routing_reason: decision.reason,
                fallback_used,
                cache_hit: false,
            },
        }
    }

    fn record(&self, session_type: &str, result: &GenerationResult, success: bool) {
        record_result(&self.analytics, session_type, result, success);
    }
}

/// Ingest a completed generation; failures are logged, never surfaced.
fn record_result(
    analytics: &AnalyticsTracker,
    session_type: &str,
    result: &GenerationResult,
    success: bool,
) {
    let record = GenerationRecord {
        id: Uuid::new_v4(),
        model_id: result.model_id.clone(),
        framework: result.framework,
        target: result.execution_target.as_str().to_string(),
        tokens_used: result.tokens_used,
        latency_ms: result.latency_ms,
        cost_saved: result.cost_saved,
        timestamp_ms: now_ms(),
        success,
    };
    if let Err(e) = analytics.record_generation(session_type, record) {
        log::debug!("analytics record dropped: {}", e);
    }
}

// ============================================================================
// Streaming
// ============================================================================

enum StreamEvent {
    Fragment(String),
    Done(Box<GenerationResult>),
    Failed(LumenError),
}

/// Consumer side of a streaming generation.
pub struct GenerationStream {
    rx: mpsc::Receiver<StreamEvent>,
    finished: Option<LumenResult<GenerationResult>>,
}

impl GenerationStream {
    /// Next text fragment, or `None` once the stream has terminated.
    pub async fn next_fragment(&mut self) -> Option<String> {
        if self.finished.is_some() {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamEvent::Fragment(text)) => Some(text),
            Some(StreamEvent::Done(result)) => {
                self.finished = Some(Ok(*result));
                None
            }
            Some(StreamEvent::Failed(e)) => {
                self.finished = Some(Err(e));
                None
            }
            None => {
                self.finished = Some(Err(LumenError::GenerationFailed(
                    "stream ended without a result".to_string(),
                )));
                None
            }
        }
    }

    /// Drain remaining fragments and return the terminal result.
    pub async fn finish(mut self) -> LumenResult<GenerationResult> {
        while self.next_fragment().await.is_some() {}
        self.finished.take().unwrap_or(Err(LumenError::GenerationFailed(
            "stream ended without a result".to_string(),
        )))
    }
}

impl tokio_stream::Stream for GenerationStream {
    type Item = String;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<String>> {
        use std::task::Poll;
        let this = self.get_mut();
        if this.finished.is_some() {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Fragment(text))) => Poll::Ready(Some(text)),
            Poll::Ready(Some(StreamEvent::Done(result))) => {
                this.finished = Some(Ok(*result));
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Failed(e))) => {
                this.finished = Some(Err(e));
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.finished = Some(Err(LumenError::GenerationFailed(
                    "stream ended without a result".to_string(),
                )));
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct StreamDriver {
    model: ModelInfo,
    framework: Framework,
    decision: RoutingDecision,
    stop_sequences: Vec<String>,
    max_tokens: u32,
    timeout: Duration,
    queue_wait_ms: u64,
    cost_per_1k: f64,
    machine: Arc<tokio::sync::Mutex<LifecycleMachine>>,
}

impl StreamDriver {
    async fn run(
        self,
        mut raw_rx: mpsc::Receiver<String>,
        out_tx: mpsc::Sender<StreamEvent>,
        backend: tokio::task::JoinHandle<LumenResult<crate::adapter::RawGeneration>>,
        cancel: CancelToken,
        analytics: Arc<AnalyticsTracker>,
    ) {
        let started = Instant::now();
        let mut filter = StopFilter::new(&self.stop_sequences);
        let mut collected = String::new();
        let mut words_emitted = 0usize;
        // Truncated output: a stop-sequence match or the max-token cap. The
        // collected text stands regardless of how the backend winds down.
        let mut truncated = false;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                fragment = raw_rx.recv() => match fragment {
                    Some(fragment) => {
                        let (mut emit, hit_stop) = filter.push(&fragment);
                        // The token cap is approximate: whitespace-split
                        // words stand in for tokens, counted here so a
                        // backend ignoring `max_tokens` cannot stream
                        // unbounded.
                        let budget = (self.max_tokens as usize).saturating_sub(words_emitted);
                        let capped = match cut_at_word_budget(&emit, budget) {
                            Some(cut) => {
                                emit.truncate(cut);
                                true
                            }
                            None => false,
                        };
                        if !emit.is_empty() {
                            words_emitted += emit.split_whitespace().count();
                            collected.push_str(&emit);
                            if out_tx.send(StreamEvent::Fragment(emit)).await.is_err() {
                                // Consumer hung up; stop the backend.
                                cancel.cancel();
                                self.settle(None).await;
                                return;
                            }
                        }
                        if hit_stop || capped {
                            truncated = true;
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    cancel.cancel();
                    let detail = format!("timed out after {:?}", self.timeout);
                    self.settle(Some(detail.clone())).await;
                    let _ = out_tx
                        .send(StreamEvent::Failed(LumenError::GenerationFailed(detail)))
                        .await;
                    return;
                }
            }
        }
        drop(raw_rx);

        if !truncated {
            let tail = filter.flush();
            if !tail.is_empty() {
                collected.push_str(&tail);
                if out_tx.send(StreamEvent::Fragment(tail)).await.is_err() {
                    self.settle(None).await;
                    return;
                }
            }
        }

        let raw = backend.await;
        let (tokens_used, backend_timing) = match raw {
            // Truncation discarded whatever the backend produced past the
            // match; report only what was delivered.
            Ok(Ok(_)) if truncated => (collected.split_whitespace().count() as u32, (0, 0)),
            Ok(Ok(raw)) => (raw.tokens_used, (raw.tokenization_ms, raw.inference_ms)),
            Ok(Err(e)) if truncated => {
                log::debug!("backend ended after truncation: {}", e);
                (collected.split_whitespace().count() as u32, (0, 0))
            }
            Ok(Err(e)) => {
                self.settle(Some(e.to_string())).await;
                let _ = out_tx.send(StreamEvent::Failed(e)).await;
                return;
            }
            Err(e) => {
                let detail = format!("worker panicked: {}", e);
                self.settle(Some(detail.clone())).await;
                let _ = out_tx
                    .send(StreamEvent::Failed(LumenError::GenerationFailed(detail)))
                    .await;
                return;
            }
        };
        self.settle(None).await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let on_device = matches!(self.decision.target, RouteTarget::OnDevice { .. });
        let result = GenerationResult {
            text: collected,
            tokens_used,
            model_id: self.model.id.clone(),
            latency_ms,
            execution_target: self.decision.target.clone(),
            cost_saved: if on_device {
                tokens_used as f64 / 1000.0 * self.cost_per_1k
            } else {
                0.0
            },
            framework: on_device.then_some(self.framework),
            accelerator: None,
            memory_used_bytes: None,
            metrics: PerformanceMetrics {
                tokenization_ms: backend_timing.0,
                inference_ms: backend_timing.1,
                post_processing_ms: 0,
                queue_wait_ms: self.queue_wait_ms,
                tokens_per_second: throughput(tokens_used, backend_timing.1),
                peak_memory_bytes: None,
            },
            extras: ResultExtras {
                routing_reason: self.decision.reason,
                fallback_used: false,
                cache_hit: false,
            },
        };
        record_result(&analytics, "stream", &result, true);
        let _ = out_tx.send(StreamEvent::Done(Box::new(result))).await;
    }

    /// Return the lifecycle to `Ready`, or park it in `Error` when the
    /// stream failed.
    async fn settle(&self, failure: Option<String>) {
        let mut machine = self.machine.lock().await;
        match failure {
            None => {
                if let Err(e) = machine.transition_to(ModelLifecycleState::Ready) {
                    log::debug!("{}: lifecycle out of step: {}", self.model.id, e);
                }
            }
            Some(detail) => machine.handle_error(LifecycleFault::BackendFailure(detail)),
        }
    }
}

/// Stop-sequence filter for fragment streams.
///
/// Holds back the longest possible stop-sequence prefix at the end of the
/// pending buffer so a match split across fragments is still caught and the
/// matched text is never emitted.
struct StopFilter {
    stops: Vec<String>,
    pending: String,
    holdback: usize,
}

impl StopFilter {
    fn new(stops: &[String]) -> Self {
        // An empty stop would match at offset zero and kill the stream
        // before the first fragment; the blocking path skips them too.
        let stops: Vec<String> = stops.iter().filter(|s| !s.is_empty()).cloned().collect();
        let holdback = stops.iter().map(|s| s.len()).max().unwrap_or(0);
        Self {
            stops,
            pending: String::new(),
            holdback: holdback.saturating_sub(1),
        }
    }

    /// Feed a fragment; returns (text safe to emit, hit a stop sequence).
    fn push(&mut self, fragment: &str) -> (String, bool) {
        self.pending.push_str(fragment);

        if let Some(at) = self
            .stops
            .iter()
            .filter_map(|s| self.pending.find(s.as_str()))
            .min()
        {
            let emit = self.pending[..at].to_string();
            self.pending.clear();
            return (emit, true);
        }

        if self.pending.len() <= self.holdback {
            return (String::new(), false);
        }
        let cut = floor_char_boundary(&self.pending, self.pending.len() - self.holdback);
        let emit = self.pending[..cut].to_string();
        self.pending.drain(..cut);
        (emit, false)
    }

    /// Remaining held-back text once the stream ends without a match.
    fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Byte index at which `text` exceeds a budget of whitespace-split words,
/// or `None` when it fits. A budget of zero cuts at the start.
fn cut_at_word_budget(text: &str, budget: usize) -> Option<usize> {
    if budget == 0 {
        return Some(0);
    }
    let mut words = 0;
    let mut in_word = false;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
            if words > budget {
                return Some(i);
            }
        }
    }
    None
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// ============================================================================
// Post-processing helpers
// ============================================================================

fn build_request(
    prompt: &str,
    system_prompt: Option<String>,
    resolved: &ResolvedOptions,
) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt.to_string(),
        system_prompt,
        max_tokens: resolved.max_tokens,
        temperature: resolved.temperature,
        top_p: resolved.top_p,
        top_k: resolved.top_k,
        stop_sequences: resolved.stop_sequences.clone(),
        seed: resolved.seed,
        framework_options: resolved.framework_options.clone(),
    }
}

/// Truncate at the earliest occurrence of any stop sequence. The sequence
/// itself is not part of the output.
fn apply_stop_sequences(text: &str, stops: &[String]) -> String {
    let cut = stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min();
    match cut {
        Some(at) => text[..at].to_string(),
        None => text.to_string(),
    }
}

/// Remove reasoning spans delimited by the model's thinking tags. An
/// unclosed opening tag swallows the rest of the text.
fn strip_thinking(text: &str, tags: &(String, String)) -> String {
    let (open, close) = tags;
    if open.is_empty() || close.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(open.as_str()) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + open.len()..];
        match after_open.find(close.as_str()) {
            Some(end) => rest = &after_open[end + close.len()..],
            None => return out.trim().to_string(),
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Best-effort JSON object extraction from free-form model output. Handles
/// fenced code blocks and surrounding prose.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn throughput(tokens: u32, inference_ms: u64) -> f64 {
    if inference_ms == 0 {
        0.0
    } else {
        tokens as f64 / (inference_ms as f64 / 1000.0)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Step a lifecycle machine along the canonical load chain up to `target`,
/// recovering from `Error` through the fault's re-entry point first.
fn drive_to(
    machine: &mut LifecycleMachine,
    target: ModelLifecycleState,
) -> Result<(), crate::lifecycle::LifecycleError> {
    if machine.state() == ModelLifecycleState::Error {
        let reentry = machine
            .recovery_state()
            .unwrap_or(ModelLifecycleState::Validating);
        machine.transition_to(reentry)?;
    }
    let current = LOAD_CHAIN.iter().position(|s| *s == machine.state());
    let wanted = LOAD_CHAIN.iter().position(|s| *s == target);
    if let (Some(current), Some(wanted)) = (current, wanted) {
        for state in &LOAD_CHAIN[current + 1..=wanted.max(current)] {
            machine.transition_to(*state)?;
        }
    }
    Ok(())
}

/// Download worker body, run on the blocking pool. Drives the lifecycle
/// around the fetch and records the artifact in the catalog on success.
fn run_download(
    downloads: &DownloadManager,
    registry: &ModelRegistry,
    model: &ModelInfo,
    dest_root: &std::path::Path,
    state: &TaskState,
    machine: &tokio::sync::Mutex<LifecycleMachine>,
) -> LumenResult<std::path::PathBuf> {
    {
        let mut machine = machine.blocking_lock();
        if let Err(e) = drive_to(&mut machine, ModelLifecycleState::Downloading) {
            log::warn!("{}: lifecycle out of step: {}", model.id, e);
        }
    }

    let result = downloads.download(model, dest_root, state);

    let mut machine = machine.blocking_lock();
    match &result {
        Ok(path) => {
            if let Err(e) = drive_to(&mut machine, ModelLifecycleState::Validated) {
                log::warn!("{}: lifecycle out of step: {}", model.id, e);
            }
            registry.set_local_path(&model.id, path.clone())?;
            let model_dir = dest_root.join(&model.id);
            if let Err(e) = registry.write_model_manifest(&model.id, &model_dir) {
                log::warn!("{}: manifest write failed: {}", model.id, e);
            }
            if let Err(e) = registry.persist() {
                log::warn!("catalog persist failed: {}", e);
            }
        }
        Err(LumenError::ValidationFailed(detail)) => {
            machine.handle_error(LifecycleFault::ChecksumMismatch(detail.clone()));
        }
        Err(e) => {
            machine.handle_error(LifecycleFault::ArtifactMissing(e.to_string()));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_filter_catches_match_split_across_fragments() {
        let mut filter = StopFilter::new(&["###".to_string()]);
        let (emit, hit) = filter.push("hello #");
        assert!(!hit);
        assert_eq!(emit, "hello");
        let (emit, hit) = filter.push("## world");
        assert!(hit);
        // The held-back " #" completes the match; nothing of it leaks out.
        assert_eq!(emit, " ");
    }

    #[test]
    fn stop_filter_flushes_holdback_without_match() {
        let mut filter = StopFilter::new(&["###".to_string()]);
        let (emit, _) = filter.push("ab");
        assert_eq!(emit, "");
        assert_eq!(filter.flush(), "ab");
    }

    #[test]
    fn empty_stop_sequences_are_ignored_by_the_stream_filter() {
        let mut filter = StopFilter::new(&[String::new(), "###".to_string()]);
        let (emit, hit) = filter.push("hello");
        assert!(!hit);
        assert_eq!(emit, "hel");
        assert_eq!(filter.flush(), "lo");
    }

    #[test]
    fn word_budget_cut_points() {
        assert_eq!(cut_at_word_budget("one two three", 2), Some(8));
        assert_eq!(cut_at_word_budget("one two", 2), None);
        assert_eq!(cut_at_word_budget("anything", 0), Some(0));
        assert_eq!(cut_at_word_budget("  padded out  ", 2), None);
    }

    #[test]
    fn stop_filter_without_stops_passes_through() {
        let mut filter = StopFilter::new(&[]);
        let (emit, hit) = filter.push("anything at all");
        assert!(!hit);
        assert_eq!(emit, "anything at all");
    }

    #[test]
    fn stop_sequences_truncate_at_earliest_match() {
        let text = "keep this END not this STOP nor this";
        let stops = vec!["STOP".to_string(), "END".to_string()];
        assert_eq!(apply_stop_sequences(text, &stops), "keep this ");
    }

    #[test]
    fn thinking_spans_are_removed() {
        let tags = ("<think>".to_string(), "</think>".to_string());
        let text = "<think>step by step</think>The answer is 4.";
        assert_eq!(strip_thinking(text, &tags), "The answer is 4.");
    }

    #[test]
    fn unclosed_thinking_tag_swallows_the_tail() {
        let tags = ("<think>".to_string(), "</think>".to_string());
        let text = "Sure. <think>hmm, let me";
        assert_eq!(strip_thinking(text, &tags), "Sure.");
    }

    #[test]
    fn json_is_extracted_from_prose_and_fences() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn drive_to_walks_the_chain_in_order() {
        let mut machine = LifecycleMachine::new("m", ModelLifecycleState::Discovered);
        drive_to(&mut machine, ModelLifecycleState::Loading).unwrap();
        assert_eq!(machine.state(), ModelLifecycleState::Loading);
        drive_to(&mut machine, ModelLifecycleState::Ready).unwrap();
        assert_eq!(machine.state(), ModelLifecycleState::Ready);
    }

    #[test]
    fn drive_to_recovers_through_the_fault_reentry_point() {
        let mut machine = LifecycleMachine::new("m", ModelLifecycleState::Validating);
        machine.handle_error(LifecycleFault::ChecksumMismatch("bad digest".into()));
        drive_to(&mut machine, ModelLifecycleState::Ready).unwrap();
        assert_eq!(machine.state(), ModelLifecycleState::Ready);
    }

    #[test]
    fn retry_temperature_schedule_floors_at_point_one() {
        fn close(actual: &[f32], expected: &[f32]) -> bool {
            actual.len() == expected.len()
                && actual
                    .iter()
                    .zip(expected)
                    .all(|(a, e)| (a - e).abs() < f32::EPSILON)
        }
        let initial: f32 = 0.7;
        let temps: Vec<f32> = (1..=3)
            .map(|n| (initial - 0.2 * (n - 1) as f32).max(0.1))
            .collect();
        assert!(close(&temps, &[0.7, 0.5, 0.3]), "got {:?}", temps);
        let low: Vec<f32> = (1..=3).map(|n| (0.2 - 0.2 * (n - 1) as f32).max(0.1)).collect();
        assert!(close(&low, &[0.2, 0.1, 0.1]), "got {:?}", low);
    }
}

//! lumen-sdk: the developer-facing surface of the Lumen runtime.
//!
//! [`Lumen`] wraps a [`LumenRuntime`] behind an idempotent, coalescing
//! `initialize()`: concurrent callers during an in-flight initialization
//! await the same outcome instead of racing a second one, and every other
//! method answers `NotInitialized` until it has run. The handle itself is
//! caller-constructed; nothing here is a process-wide singleton.
//!
//! ```no_run
//! use lumen_sdk::prelude::*;
//!
//! # async fn run() -> lumen_core::LumenResult<()> {
//! let lumen = Lumen::builder().build();
//! lumen.initialize().await?;
//! lumen.load_model("phi-3-mini").await?;
//! let result = lumen
//!     .generate("Write a haiku about autumn", &GenerationOptions::default())
//!     .await?;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```

pub mod settings;

use lumen_core::adapter::FrameworkAdapter;
use lumen_core::config::{CloudConfig, RuntimeConfig};
use lumen_core::download::{DownloadStrategy, DownloadTask, DownloadTransport};
use lumen_core::error::{LumenError, LumenResult};
use lumen_core::options::{GenerationDefaults, GenerationOptions};
use lumen_core::orchestrator::{GenerationStream, LumenRuntime};
use lumen_core::registry::ModelInfo;
use lumen_core::result::GenerationResult;
use lumen_core::routing::RoutingPolicy;
use serde::de::DeserializeOwned;
use settings::SettingsSync;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Re-exports of everything a typical integration needs.
pub mod prelude {
    pub use crate::{Lumen, LumenBuilder};
    pub use lumen_core::{
        ExecutionTarget, Framework, GenerationDefaults, GenerationOptions, GenerationResult,
        LumenError, LumenResult, ModelFormat, ModelInfo, RoutingPolicy,
    };
}

/// Configuration builder for a [`Lumen`] handle.
pub struct LumenBuilder {
    config: RuntimeConfig,
    transport: Option<Arc<dyn DownloadTransport>>,
    remote_settings_sync: bool,
}

impl LumenBuilder {
    fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            transport: None,
            remote_settings_sync: false,
        }
    }

    /// Root directory for the catalog, settings, and model artifacts.
    /// Defaults to `~/.lumen`.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn routing_policy(mut self, policy: RoutingPolicy) -> Self {
        self.config.routing_policy = policy;
        self
    }

    pub fn generation_timeout(mut self, timeout: Duration) -> Self {
        self.config.generation_timeout = timeout;
        self
    }

    pub fn cloud(mut self, cloud: CloudConfig) -> Self {
        self.config.cloud = cloud;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.cloud.api_key = Some(key.into());
        self
    }

    pub fn analytics(mut self, enabled: bool) -> Self {
        self.config.analytics_enabled = enabled;
        self
    }

    /// Mirror settings changes to the gateway (best effort). Off by
    /// default.
    pub fn remote_settings_sync(mut self, enabled: bool) -> Self {
        self.remote_settings_sync = enabled;
        self
    }

    /// Replace the artifact download transport. Tests inject fakes here.
    pub fn download_transport(mut self, transport: Arc<dyn DownloadTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Lumen {
        let sync = SettingsSync::new(&self.config.cloud, self.remote_settings_sync);
        Lumen {
            config: self.config,
            transport: self.transport,
            runtime: OnceCell::new(),
            sync,
        }
    }
}

/// The SDK facade.
pub struct Lumen {
    config: RuntimeConfig,
    transport: Option<Arc<dyn DownloadTransport>>,
    runtime: OnceCell<Arc<LumenRuntime>>,
    sync: SettingsSync,
}

impl Lumen {
    pub fn builder() -> LumenBuilder {
        LumenBuilder::new()
    }

    /// Bring the runtime up. Idempotent: repeat calls are no-ops, and
    /// concurrent callers during an in-flight initialization await the
    /// same outcome.
    pub async fn initialize(&self) -> LumenResult<()> {
        self.runtime
            .get_or_try_init(|| async {
                let config = self.config.clone();
                let runtime = match &self.transport {
                    Some(transport) => {
                        LumenRuntime::with_transport(config, Arc::clone(transport))?
                    }
                    None => LumenRuntime::with_config(config)?,
                };
                Ok(Arc::new(runtime))
            })
            .await
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.initialized()
    }

    fn runtime(&self) -> LumenResult<&Arc<LumenRuntime>> {
        self.runtime.get().ok_or(LumenError::NotInitialized)
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    pub fn register_model(&self, model: ModelInfo) -> LumenResult<()> {
        self.runtime()?.register_model(model);
        Ok(())
    }

    pub fn register_adapter(&self, adapter: Arc<dyn FrameworkAdapter>) -> LumenResult<()> {
        self.runtime()?.register_adapter(adapter);
        Ok(())
    }

    pub fn register_download_strategy(
        &self,
        strategy: Arc<dyn DownloadStrategy>,
    ) -> LumenResult<()> {
        self.runtime()?.register_download_strategy(strategy);
        Ok(())
    }

    pub fn list_available_models(&self) -> LumenResult<Vec<ModelInfo>> {
        Ok(self.runtime()?.list_available_models())
    }

    /// Mark a model as wrapping reasoning output in `tags`; tagged spans
    /// are filtered from generation output. `None` clears the flag.
    pub fn set_thinking_support(
        &self,
        model_id: &str,
        tags: Option<(String, String)>,
    ) -> LumenResult<()> {
        self.runtime()?.set_thinking_support(model_id, tags)
    }

    pub async fn load_model(&self, model_id: &str) -> LumenResult<ModelInfo> {
        self.runtime()?.load_model(model_id).await
    }

    pub async fn unload_model(&self) -> LumenResult<()> {
        self.runtime()?.unload_model().await;
        Ok(())
    }

    pub fn download_model(&self, model_id: &str) -> LumenResult<DownloadTask> {
        self.runtime()?.download_model(model_id)
    }

    pub async fn delete_model(&self, model_id: &str) -> LumenResult<()> {
        self.runtime()?.delete_model(model_id).await
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    pub async fn generate(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> LumenResult<GenerationResult> {
        self.runtime()?.generate(prompt, options).await
    }

    pub async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> LumenResult<GenerationStream> {
        self.runtime()?.generate_stream(prompt, options).await
    }

    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> LumenResult<T> {
        self.runtime()?.generate_structured(prompt, options).await
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn generation_defaults(&self) -> LumenResult<GenerationDefaults> {
        Ok(self.runtime()?.generation_defaults())
    }

    /// Persist new generation defaults and mirror them to the gateway when
    /// remote sync is enabled. The mirror is fire-and-forget.
    pub fn set_generation_defaults(&self, defaults: GenerationDefaults) -> LumenResult<()> {
        self.runtime()?.set_generation_defaults(defaults.clone());
        if self.sync.is_enabled() {
            let sync = self.sync.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || sync.push(&defaults));
                }
                Err(_) => sync.push(&defaults),
            }
        }
        Ok(())
    }
}

//! Runtime configuration.
//!
//! All tunables live here rather than as constants scattered through the
//! runtime: the routing safety margin, the generation timeout, the cloud
//! gateway endpoint, and the data directory layout.

use crate::routing::{ResourceThresholds, RoutingPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cloud gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// OpenAI-compatible gateway base URL.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Bearer key; falls back to `LUMEN_API_KEY` at request time.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Provider label recorded in routing decisions.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model sent to the gateway when the loaded model has no cloud alias.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Gateway request timeout in milliseconds.
    #[serde(default = "default_cloud_timeout_ms")]
    pub timeout_ms: u32,
}

fn default_gateway_url() -> String {
    "https://gateway.lumen.dev/v1".to_string()
}

fn default_provider() -> String {
    "lumen-gateway".to_string()
}

fn default_cloud_timeout_ms() -> u32 {
    30_000
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            api_key: None,
            provider: default_provider(),
            default_model: None,
            timeout_ms: default_cloud_timeout_ms(),
        }
    }
}

impl CloudConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("LUMEN_API_KEY").ok())
    }
}

/// Configuration for a [`LumenRuntime`](crate::orchestrator::LumenRuntime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory for the catalog, settings, and model artifacts.
    pub data_dir: PathBuf,
    /// Routing policy applied when a request carries no explicit target.
    pub routing_policy: RoutingPolicy,
    /// Resource-sufficiency thresholds for automatic routing.
    pub thresholds: ResourceThresholds,
    /// Ceiling for a single generation call; the backend race loser is
    /// cancelled, not abandoned.
    pub generation_timeout: Duration,
    /// Whether to ingest generation analytics.
    pub analytics_enabled: bool,
    /// Cloud gateway settings.
    pub cloud: CloudConfig,
    /// Cloud baseline price used to estimate cost saved on-device.
    pub cloud_cost_per_1k_tokens: f64,
    /// Device share of a hybrid split.
    pub hybrid_device_portion: f32,
    /// Artifact download timeout.
    pub download_timeout: Duration,
}

impl RuntimeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            routing_policy: RoutingPolicy::Automatic,
            thresholds: ResourceThresholds::default(),
            generation_timeout: Duration::from_secs(60),
            analytics_enabled: true,
            cloud: CloudConfig::default(),
            cloud_cost_per_1k_tokens: 0.002,
            hybrid_device_portion: 0.5,
            download_timeout: Duration::from_secs(300),
        }
    }

    /// Directory holding downloaded model artifacts.
    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Path of the persisted generation settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(default_data_dir())
    }
}

/// `~/.lumen`, falling back to the system temp dir when no home directory
/// can be resolved (containers, stripped-down CI).
pub fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| Path::new(&home).join(".lumen"))
        .unwrap_or_else(|| std::env::temp_dir().join("lumen"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::new("/tmp/lumen-test");
        assert_eq!(config.generation_timeout, Duration::from_secs(60));
        assert!(config.analytics_enabled);
        assert_eq!(config.models_dir(), PathBuf::from("/tmp/lumen-test/models"));
    }

    #[test]
    fn cloud_config_deserializes_with_defaults() {
        let config: CloudConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.provider, "lumen-gateway");
        assert_eq!(config.timeout_ms, 30_000);
    }
}

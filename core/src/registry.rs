//! Model registry: the catalog of known models.
//!
//! The registry is the single owner of `ModelInfo` entries. All mutations
//! (registration, download completion, last-used timestamps, thinking-mode
//! flags) funnel through it; readers get clones, never references into the
//! map, so a reader may see a slightly stale snapshot but never a torn
//! entry.
//!
//! The catalog persists to `catalog.json` under the runtime data directory
//! and merges with models discovered on disk at startup.

use crate::adapter::Framework;
use crate::device::HardwareRequirements;
use crate::error::{LumenError, LumenResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-model metadata file written next to downloaded artifacts. Discovery
/// scans for these to rebuild catalog entries after reinstall.
pub const MODEL_MANIFEST_FILE: &str = "model.json";

/// On-disk format of a model artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelFormat {
    /// Single-file quantized weights (llama.cpp).
    Gguf,
    /// Core ML directory package (.mlpackage).
    MlPackage,
    /// Single-file ONNX graph.
    Onnx,
    /// Single-file TensorFlow Lite model.
    TfLite,
    /// Multi-file speech model bundle (Whisper-style).
    WhisperBundle,
}

impl ModelFormat {
    /// Directory-package formats are distributed as multiple files under a
    /// shared root rather than one binary artifact.
    pub fn is_directory(&self) -> bool {
        matches!(self, ModelFormat::MlPackage | ModelFormat::WhisperBundle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Gguf => "gguf",
            ModelFormat::MlPackage => "mlPackage",
            ModelFormat::Onnx => "onnx",
            ModelFormat::TfLite => "tfLite",
            ModelFormat::WhisperBundle => "whisperBundle",
        }
    }
}

/// Free-form catalog metadata carried on a model entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelExtras {
    #[serde(default)]
    pub author: Option<String>,
    /// Quantization level label (e.g. "Q4_K_M").
    #[serde(default)]
    pub quantization: Option<String>,
    /// Whether the model wraps reasoning tokens in delimiter tags.
    #[serde(default)]
    pub supports_thinking: bool,
    /// Opening/closing delimiter pair for thinking output.
    #[serde(default)]
    pub thinking_tags: Option<(String, String)>,
    /// Last time this model served a request (ms since epoch).
    #[serde(default)]
    pub last_used_ms: Option<u64>,
}

/// Catalog entry for a known model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Stable identifier (e.g. "phi-3-mini").
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// On-disk artifact format.
    pub format: ModelFormat,
    /// Primary remote download URL.
    #[serde(default)]
    pub download_url: Option<String>,
    /// Fallback URLs tried in order when the primary fails.
    #[serde(default)]
    pub alternate_urls: Vec<String>,
    /// Set once the artifact is on disk and validated.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Estimated in-memory footprint in bytes.
    pub estimated_memory: u64,
    /// Context window limit, if known.
    #[serde(default)]
    pub context_length: Option<u32>,
    /// Hex-encoded SHA-256 of the single-file artifact.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Frameworks that can execute this model.
    pub compatible_frameworks: Vec<Framework>,
    /// Framework preferred when several are compatible.
    pub preferred_framework: Framework,
    #[serde(default)]
    pub hardware_requirements: Option<HardwareRequirements>,
    #[serde(default)]
    pub tokenizer_format: Option<String>,
    #[serde(default)]
    pub metadata: ModelExtras,
}

impl ModelInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        format: ModelFormat,
        framework: Framework,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            format,
            download_url: None,
            alternate_urls: Vec::new(),
            local_path: None,
            estimated_memory: 0,
            context_length: None,
            checksum: None,
            compatible_frameworks: vec![framework],
            preferred_framework: framework,
            hardware_requirements: None,
            tokenizer_format: None,
            metadata: ModelExtras::default(),
        }
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    pub fn with_estimated_memory(mut self, bytes: u64) -> Self {
        self.estimated_memory = bytes;
        self
    }

    pub fn with_checksum(mut self, hex_sha256: impl Into<String>) -> Self {
        self.checksum = Some(hex_sha256.into());
        self
    }

    /// A model with no compatible frameworks can never be loaded.
    pub fn is_loadable(&self) -> bool {
        !self.compatible_frameworks.is_empty()
    }

    /// Whether the artifact is on disk (and, per the catalog invariant,
    /// validated).
    pub fn is_downloaded(&self) -> bool {
        self.local_path.as_deref().is_some_and(Path::exists)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared, mutable model catalog with serialized writes.
pub struct ModelRegistry {
    entries: RwLock<HashMap<String, ModelInfo>>,
    catalog_path: Option<PathBuf>,
}

impl ModelRegistry {
    /// In-memory registry without persistence.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            catalog_path: None,
        }
    }

    /// Registry persisting to `catalog.json` under `data_dir`. Loads any
    /// existing catalog eagerly.
    pub fn with_data_dir(data_dir: &Path) -> LumenResult<Self> {
        fs::create_dir_all(data_dir)?;
        let catalog_path = data_dir.join("catalog.json");
        let mut entries = HashMap::new();
        if catalog_path.exists() {
            let raw = fs::read_to_string(&catalog_path)?;
            let list: Vec<ModelInfo> = serde_json::from_str(&raw)
                .map_err(|e| LumenError::Serialization(format!("catalog.json: {}", e)))?;
            for model in list {
                entries.insert(model.id.clone(), model);
            }
            log::info!("loaded {} catalog entries", entries.len());
        }
        Ok(Self {
            entries: RwLock::new(entries),
            catalog_path: Some(catalog_path),
        })
    }

    /// Register or replace a model entry.
    pub fn register(&self, model: ModelInfo) {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        entries.insert(model.id.clone(), model);
    }

    /// Snapshot of a single entry.
    pub fn get(&self, id: &str) -> Option<ModelInfo> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshot of all entries, sorted by id for stable output.
    pub fn all(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(id)
    }

    /// Record a validated artifact location. Upholds the invariant that
    /// `local_path` is only ever set after validation passed.
    pub fn set_local_path(&self, id: &str, path: PathBuf) -> LumenResult<()> {
        self.mutate(id, |m| m.local_path = Some(path))
    }

    /// Clear the artifact location (after deletion).
    pub fn clear_local_path(&self, id: &str) -> LumenResult<()> {
        self.mutate(id, |m| m.local_path = None)
    }

    pub fn touch_last_used(&self, id: &str) -> LumenResult<()> {
        self.mutate(id, |m| m.metadata.last_used_ms = Some(now_ms()))
    }

    pub fn set_thinking_support(
        &self,
        id: &str,
        tags: Option<(String, String)>,
    ) -> LumenResult<()> {
        self.mutate(id, |m| {
            m.metadata.supports_thinking = tags.is_some();
            m.metadata.thinking_tags = tags;
        })
    }

    fn mutate(&self, id: &str, f: impl FnOnce(&mut ModelInfo)) -> LumenResult<()> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let model = entries
            .get_mut(id)
            .ok_or_else(|| LumenError::ModelNotFound(id.to_string()))?;
        f(model);
        Ok(())
    }

    /// Write the catalog to disk. No-op for in-memory registries.
    pub fn persist(&self) -> LumenResult<()> {
        let Some(path) = &self.catalog_path else {
            return Ok(());
        };
        let models = self.all();
        let raw = serde_json::to_string_pretty(&models)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Scan `models_dir` for model manifests and merge them into the
    /// catalog. Already-registered ids keep their catalog entry but pick up
    /// a discovered `local_path` when the catalog has none.
    pub fn discover(&self, models_dir: &Path) -> LumenResult<usize> {
        if !models_dir.exists() {
            return Ok(0);
        }
        let mut discovered = 0;
        for entry in fs::read_dir(models_dir)? {
            let entry = entry?;
            let manifest = entry.path().join(MODEL_MANIFEST_FILE);
            if !manifest.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&manifest)?;
            let model: ModelInfo = match serde_json::from_str(&raw) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("skipping malformed manifest {:?}: {}", manifest, e);
                    continue;
                }
            };
            let mut entries = self.entries.write().expect("registry lock poisoned");
            match entries.get_mut(&model.id) {
                Some(existing) => {
                    if existing.local_path.is_none() {
                        existing.local_path = model.local_path.clone();
                    }
                }
                None => {
                    entries.insert(model.id.clone(), model);
                    discovered += 1;
                }
            }
        }
        if discovered > 0 {
            log::info!("discovered {} models on disk", discovered);
        }
        Ok(discovered)
    }

    /// Write the per-model manifest next to a downloaded artifact so the
    /// model survives catalog loss.
    pub fn write_model_manifest(&self, id: &str, model_dir: &Path) -> LumenResult<()> {
        let model = self
            .get(id)
            .ok_or_else(|| LumenError::ModelNotFound(id.to_string()))?;
        fs::create_dir_all(model_dir)?;
        let raw = serde_json::to_string_pretty(&model)?;
        fs::write(model_dir.join(MODEL_MANIFEST_FILE), raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(id: &str) -> ModelInfo {
        ModelInfo::new(id, id, ModelFormat::Gguf, Framework::LlamaCpp)
            .with_estimated_memory(1_000_000)
    }

    #[test]
    fn readers_get_clones_not_references() {
        let registry = ModelRegistry::in_memory();
        registry.register(sample("phi-3-mini"));

        let mut copy = registry.get("phi-3-mini").unwrap();
        copy.name = "mutated".into();
        assert_eq!(registry.get("phi-3-mini").unwrap().name, "phi-3-mini");
    }

    #[test]
    fn catalog_round_trips_through_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let registry = ModelRegistry::with_data_dir(dir.path()).unwrap();
            registry.register(sample("phi-3-mini"));
            registry.register(sample("qwen-0.5b"));
            registry.persist().unwrap();
        }
        let reloaded = ModelRegistry::with_data_dir(dir.path()).unwrap();
        assert_eq!(reloaded.all().len(), 2);
        assert!(reloaded.contains("qwen-0.5b"));
    }

    #[test]
    fn discover_merges_and_dedupes_by_id() {
        let dir = TempDir::new().unwrap();
        let models_dir = dir.path().join("models");

        let registry = ModelRegistry::in_memory();
        registry.register(sample("phi-3-mini"));

        // One manifest for a known id, one for a new id.
        let mut known = sample("phi-3-mini");
        known.local_path = Some(models_dir.join("phi-3-mini"));
        let fresh = sample("tinyllama");
        for model in [&known, &fresh] {
            let d = models_dir.join(&model.id);
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(
                d.join(MODEL_MANIFEST_FILE),
                serde_json::to_string(model).unwrap(),
            )
            .unwrap();
        }

        let discovered = registry.discover(&models_dir).unwrap();
        assert_eq!(discovered, 1);
        assert_eq!(registry.all().len(), 2);
        // Known entry picked up the discovered local path.
        assert!(registry.get("phi-3-mini").unwrap().local_path.is_some());
    }

    #[test]
    fn unloadable_without_compatible_frameworks() {
        let mut model = sample("m");
        model.compatible_frameworks.clear();
        assert!(!model.is_loadable());
    }
}

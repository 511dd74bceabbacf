//! Download strategies for directory-package models.
//!
//! A strategy derives the per-file manifest (relative paths under the remote
//! root) for models that ship as multiple files. Custom strategies register
//! through the orchestrator and are consulted in registration order before
//! the built-in defaults.

use crate::registry::{ModelFormat, ModelInfo};

/// Derives the file manifest for a directory-package model.
pub trait DownloadStrategy: Send + Sync {
    /// Whether this strategy knows how to enumerate the model's files.
    fn applies_to(&self, model: &ModelInfo) -> bool;

    /// Relative file paths to fetch under the remote root. Entries that the
    /// server answers 404 for are treated as optional and skipped.
    fn manifest(&self, model: &ModelInfo) -> Vec<String>;

    /// Remote root URL for the package. Defaults to the model's download
    /// URL with the canonical path mapping applied: when the URL's last
    /// segment is the model's short id and a canonical directory is known,
    /// the segment is substituted.
    fn remote_root(&self, model: &ModelInfo) -> Option<String> {
        let base = model.download_url.clone()?;
        let base = base.trim_end_matches('/');
        if let Some((parent, last)) = base.rsplit_once('/') {
            if last == model.id {
                if let Some(dir) = canonical_remote_dir(&model.id) {
                    return Some(format!("{}/{}", parent, dir));
                }
            }
        }
        Some(base.to_string())
    }
}

/// Exact short-name to canonical remote directory mapping, with a substring
/// fallback for names the table does not know. Best effort by design: an
/// unknown model name may resolve to a wrong path and fail at fetch time.
pub fn canonical_remote_dir(model_id: &str) -> Option<&'static str> {
    const MAPPING: &[(&str, &str)] = &[
        ("whisper-tiny", "openai_whisper-tiny"),
        ("whisper-base", "openai_whisper-base"),
        ("whisper-small", "openai_whisper-small"),
        ("whisper-large-v3", "openai_whisper-large-v3"),
        ("phi-3-mini", "phi-3-mini-4k-instruct"),
    ];

    if let Some((_, dir)) = MAPPING.iter().find(|(short, _)| *short == model_id) {
        return Some(dir);
    }
    // Fallback heuristic: first entry whose short name overlaps the id.
    MAPPING
        .iter()
        .find(|(short, _)| model_id.contains(short) || short.contains(model_id))
        .map(|(_, dir)| *dir)
}

/// Built-in manifest for Whisper-style speech bundles.
pub struct WhisperBundleStrategy;

impl DownloadStrategy for WhisperBundleStrategy {
    fn applies_to(&self, model: &ModelInfo) -> bool {
        model.format == ModelFormat::WhisperBundle
    }

    fn manifest(&self, _model: &ModelInfo) -> Vec<String> {
        // tokenizer and generation config legitimately do not exist for
        // every variant; 404s on them are skipped.
        vec![
            "config.json".into(),
            "model.safetensors".into(),
            "tokenizer.json".into(),
            "generation_config.json".into(),
            "preprocessor_config.json".into(),
        ]
    }
}

/// Built-in manifest for Core ML directory packages.
pub struct MlPackageStrategy;

impl DownloadStrategy for MlPackageStrategy {
    fn applies_to(&self, model: &ModelInfo) -> bool {
        model.format == ModelFormat::MlPackage
    }

    fn manifest(&self, _model: &ModelInfo) -> Vec<String> {
        vec![
            "Manifest.json".into(),
            "Data/com.apple.CoreML/model.mlmodel".into(),
            "Data/com.apple.CoreML/weights/weight.bin".into(),
            "Metadata.json".into(),
        ]
    }
}

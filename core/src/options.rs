//! Generation options and persisted defaults.
//!
//! Callers pass a sparse [`GenerationOptions`]; the orchestrator merges it
//! over the persisted [`GenerationDefaults`] so that explicit per-call values
//! always win and unset fields fall back to defaults rather than hard-coded
//! literals.

use crate::routing::ExecutionTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What to do when a token budget would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BudgetFallback {
    /// Fail the request.
    Stop,
    /// Re-route to on-device execution instead of paying for cloud.
    SwitchToDevice,
    /// Cap max tokens to what the budget affords.
    Truncate,
}

/// Per-request token/cost ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudget {
    pub max_tokens: u32,
    #[serde(default)]
    pub max_cost: Option<f64>,
    pub fallback_behavior: BudgetFallback,
}

/// Caller-supplied generation options. Every field is optional; unset fields
/// fall back to the persisted defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    /// Sampling temperature, 0-2.
    pub temperature: Option<f32>,
    /// Nucleus sampling mass, 0-1.
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    /// Seed for reproducible sampling.
    pub seed: Option<u64>,
    pub streaming_enabled: bool,
    pub token_budget: Option<TokenBudget>,
    /// Explicit execution target override; always honored verbatim.
    pub preferred_execution_target: Option<ExecutionTarget>,
    /// Per-backend tuning knobs, passed through opaquely.
    pub framework_options: Option<HashMap<String, serde_json::Value>>,
}

impl GenerationOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = Some(stop);
        self
    }

    pub fn with_target(mut self, target: ExecutionTarget) -> Self {
        self.preferred_execution_target = Some(target);
        self
    }
}

/// Persisted default generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

fn default_max_tokens() -> u32 {
    100
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            stop_sequences: Vec::new(),
        }
    }
}

/// Options after merging a call's sparse options over the defaults.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub seed: Option<u64>,
    pub token_budget: Option<TokenBudget>,
    pub preferred_execution_target: Option<ExecutionTarget>,
    pub framework_options: HashMap<String, serde_json::Value>,
}

/// Merge sparse options over defaults. Explicit values win; unset fields
/// take the default.
pub fn resolve(options: &GenerationOptions, defaults: &GenerationDefaults) -> ResolvedOptions {
    ResolvedOptions {
        max_tokens: options.max_tokens.unwrap_or(defaults.max_tokens),
        temperature: options.temperature.unwrap_or(defaults.temperature),
        top_p: options.top_p.unwrap_or(defaults.top_p),
        top_k: options.top_k.or(defaults.top_k),
        stop_sequences: options
            .stop_sequences
            .clone()
            .unwrap_or_else(|| defaults.stop_sequences.clone()),
        seed: options.seed,
        token_budget: options.token_budget.clone(),
        preferred_execution_target: options.preferred_execution_target,
        framework_options: options.framework_options.clone().unwrap_or_default(),
    }
}

//! Routing engine: decides where each generation request executes.
//!
//! Routing is a pure function of its inputs (explicit override, configured
//! policy, model info, resource snapshot). No hidden randomness, no clock
//! dependence in the decision itself, so identical inputs always produce the
//! same decision and tests are reproducible.
//!
//! Priority order:
//! 1. Explicit per-request execution-target override, honored verbatim.
//! 2. Configured policy (`PreferDevice`, `PreferCloud`, `Custom`).
//! 3. `Automatic`: live resource check. If the device can fit the model
//!    within the safety margin, run on-device (cheapest); otherwise cloud.

use crate::adapter::Framework;
use crate::device::DeviceSnapshot;
use crate::registry::ModelInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Caller-facing execution target preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionTarget {
    OnDevice,
    Cloud,
    Hybrid,
}

/// Resolved execution target for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RouteTarget {
    /// Run on the device with the given framework.
    OnDevice { framework: Framework },
    /// Run against a cloud provider.
    Cloud { provider: String },
    /// Split execution: `device_portion` of the work stays on-device.
    Hybrid {
        device_portion: f32,
        framework: Framework,
    },
}

impl RouteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteTarget::OnDevice { .. } => "onDevice",
            RouteTarget::Cloud { .. } => "cloud",
            RouteTarget::Hybrid { .. } => "hybrid",
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::OnDevice { framework } => write!(f, "onDevice:{}", framework),
            RouteTarget::Cloud { provider } => write!(f, "cloud:{}", provider),
            RouteTarget::Hybrid {
                device_portion,
                framework,
            } => write!(f, "hybrid:{:.2}:{}", device_portion, framework),
        }
    }
}

/// Why the router picked its target. Preserved into result metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoutingReason {
    UserPreference,
    CostOptimization,
    PerformanceOptimization,
    ResourceConstraint,
    PolicyDriven,
    Fallback,
    Experimental,
}

impl RoutingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingReason::UserPreference => "userPreference",
            RoutingReason::CostOptimization => "costOptimization",
            RoutingReason::PerformanceOptimization => "performanceOptimization",
            RoutingReason::ResourceConstraint => "resourceConstraint",
            RoutingReason::PolicyDriven => "policyDriven",
            RoutingReason::Fallback => "fallback",
            RoutingReason::Experimental => "experimental",
        }
    }
}

/// Routing decision for a single request. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub reason: RoutingReason,
    /// Human-readable detail for logs.
    pub detail: String,
    /// When the decision was taken (ms since epoch, diagnostics only).
    pub timestamp_ms: u64,
}

impl RoutingDecision {
    fn new(target: RouteTarget, reason: RoutingReason, detail: impl Into<String>) -> Self {
        Self {
            target,
            reason,
            detail: detail.into(),
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Custom routing hook for the `Custom` policy.
pub trait CustomRouter: Send + Sync {
    fn route(&self, model: &ModelInfo, snapshot: &DeviceSnapshot) -> RouteTarget;
}

/// Configured routing policy.
#[derive(Clone)]
pub enum RoutingPolicy {
    PreferDevice,
    PreferCloud,
    Automatic,
    Custom(Arc<dyn CustomRouter>),
}

impl fmt::Debug for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingPolicy::PreferDevice => write!(f, "PreferDevice"),
            RoutingPolicy::PreferCloud => write!(f, "PreferCloud"),
            RoutingPolicy::Automatic => write!(f, "Automatic"),
            RoutingPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        RoutingPolicy::Automatic
    }
}

/// Configurable resource-sufficiency thresholds.
///
/// The exact margin is deliberately configuration, not a constant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Fraction of available memory the model may occupy (0-1).
    pub memory_safety_margin: f64,
    /// Refuse on-device execution when the model requires an accelerator
    /// the device lacks.
    pub respect_accelerator_requirements: bool,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_safety_margin: 0.8,
            respect_accelerator_requirements: true,
        }
    }
}

/// The routing engine. Holds configuration only; `decide` is pure.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    thresholds: ResourceThresholds,
    cloud_provider: String,
    hybrid_device_portion: f32,
}

impl RoutingEngine {
    pub fn new(
        thresholds: ResourceThresholds,
        cloud_provider: impl Into<String>,
        hybrid_device_portion: f32,
    ) -> Self {
        Self {
            thresholds,
            cloud_provider: cloud_provider.into(),
            hybrid_device_portion,
        }
    }

    /// Decide the execution target for a request.
    pub fn decide(
        &self,
        preference: Option<ExecutionTarget>,
        model: &ModelInfo,
        policy: &RoutingPolicy,
        snapshot: &DeviceSnapshot,
    ) -> RoutingDecision {
        let decision = self.decide_inner(preference, model, policy, snapshot);
        log::debug!(
            "routed {} -> {} ({}, load={})",
            model.id,
            decision.target,
            decision.reason.as_str(),
            snapshot.load_band().as_str()
        );
        decision
    }

    fn decide_inner(
        &self,
        preference: Option<ExecutionTarget>,
        model: &ModelInfo,
        policy: &RoutingPolicy,
        snapshot: &DeviceSnapshot,
    ) -> RoutingDecision {
        // Explicit per-request override wins over everything.
        if let Some(target) = preference {
            let target = self.materialize(target, model);
            return RoutingDecision::new(
                target,
                RoutingReason::UserPreference,
                "explicit per-request execution target",
            );
        }

        match policy {
            RoutingPolicy::PreferDevice => RoutingDecision::new(
                RouteTarget::OnDevice {
                    framework: model.preferred_framework,
                },
                RoutingReason::PolicyDriven,
                "policy prefers on-device execution",
            ),
            RoutingPolicy::PreferCloud => RoutingDecision::new(
                RouteTarget::Cloud {
                    provider: self.cloud_provider.clone(),
                },
                RoutingReason::PolicyDriven,
                "policy prefers cloud execution",
            ),
            RoutingPolicy::Custom(router) => RoutingDecision::new(
                router.route(model, snapshot),
                RoutingReason::Experimental,
                "custom routing hook",
            ),
            RoutingPolicy::Automatic => {
                if let Err(shortfall) = self.check_resources(model, snapshot) {
                    RoutingDecision::new(
                        RouteTarget::Cloud {
                            provider: self.cloud_provider.clone(),
                        },
                        RoutingReason::ResourceConstraint,
                        shortfall,
                    )
                } else {
                    RoutingDecision::new(
                        RouteTarget::OnDevice {
                            framework: model.preferred_framework,
                        },
                        RoutingReason::CostOptimization,
                        "device resources sufficient, avoiding cloud cost",
                    )
                }
            }
        }
    }

    /// Sufficiency check: model must fit within the safety margin of the
    /// currently available memory and satisfy any accelerator requirement.
    fn check_resources(&self, model: &ModelInfo, snapshot: &DeviceSnapshot) -> Result<(), String> {
        let budget = snapshot.available_memory as f64 * self.thresholds.memory_safety_margin;
        if model.estimated_memory as f64 > budget {
            return Err(format!(
                "insufficient memory: need {} bytes, budget {:.0} bytes",
                model.estimated_memory, budget
            ));
        }
        if let Some(reqs) = &model.hardware_requirements {
            if reqs.min_memory > snapshot.total_memory {
                return Err(format!(
                    "device RAM below model minimum ({} > {})",
                    reqs.min_memory, snapshot.total_memory
                ));
            }
            if self.thresholds.respect_accelerator_requirements {
                if let Some(required) = reqs.accelerator {
                    if !snapshot.accelerator.satisfies(required) {
                        return Err(format!(
                            "accelerator {} below required {}",
                            snapshot.accelerator.as_str(),
                            required.as_str()
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Turn a caller preference into a concrete target.
    fn materialize(&self, preference: ExecutionTarget, model: &ModelInfo) -> RouteTarget {
        match preference {
            ExecutionTarget::OnDevice => RouteTarget::OnDevice {
                framework: model.preferred_framework,
            },
            ExecutionTarget::Cloud => RouteTarget::Cloud {
                provider: self.cloud_provider.clone(),
            },
            ExecutionTarget::Hybrid => RouteTarget::Hybrid {
                device_portion: self.hybrid_device_portion,
                framework: model.preferred_framework,
            },
        }
    }
}

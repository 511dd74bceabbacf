//! Model lifecycle state machine.
//!
//! Each tracked model instance moves through a strict state table:
//!
//! ```text
//! Discovered → Downloading → Downloaded → Validating → Validated
//!   → Initializing → Initialized → Loading → Loaded → Ready
//! ```
//!
//! From `Ready` the model enters `Executing` and returns to `Ready` on
//! success. Any state may fall into `Error`; recovery re-enters the table at
//! a defined point (`Validating` for checksum mismatches, `Downloading` for
//! missing artifacts) and never jumps straight back to `Ready`.
//!
//! The machine itself does not lock anything. Serialization of transitions
//! is enforced by the orchestrator, which holds a per-model async mutex
//! around the machine while driving it.

use std::fmt;
use thiserror::Error;

/// Finite lifecycle states for a tracked model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelLifecycleState {
    Discovered,
    Downloading,
    Downloaded,
    Validating,
    Validated,
    Initializing,
    Initialized,
    Loading,
    Loaded,
    Ready,
    Executing,
    Error,
}

impl ModelLifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelLifecycleState::Discovered => "discovered",
            ModelLifecycleState::Downloading => "downloading",
            ModelLifecycleState::Downloaded => "downloaded",
            ModelLifecycleState::Validating => "validating",
            ModelLifecycleState::Validated => "validated",
            ModelLifecycleState::Initializing => "initializing",
            ModelLifecycleState::Initialized => "initialized",
            ModelLifecycleState::Loading => "loading",
            ModelLifecycleState::Loaded => "loaded",
            ModelLifecycleState::Ready => "ready",
            ModelLifecycleState::Executing => "executing",
            ModelLifecycleState::Error => "error",
        }
    }

    /// Legal successor states. `Error` is reachable from everywhere and is
    /// therefore not listed here; `transition_to` special-cases it.
    fn successors(&self) -> &'static [ModelLifecycleState] {
        use ModelLifecycleState::*;
        match self {
            Discovered => &[Downloading, Downloaded],
            Downloading => &[Downloaded],
            Downloaded => &[Validating],
            Validating => &[Validated],
            Validated => &[Initializing],
            Initializing => &[Initialized],
            Initialized => &[Loading],
            Loading => &[Loaded],
            Loaded => &[Ready],
            Ready => &[Executing],
            Executing => &[Ready],
            // Re-entry points only; recovery never jumps to Ready.
            Error => &[Downloading, Validating, Initializing],
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: ModelLifecycleState) -> bool {
        next == ModelLifecycleState::Error || self.successors().contains(&next)
    }
}

impl fmt::Display for ModelLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error type for lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        from: ModelLifecycleState,
        to: ModelLifecycleState,
    },
}

/// Classified cause of a lifecycle failure, used to pick the re-entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleFault {
    /// Artifact present but failed checksum validation.
    ChecksumMismatch(String),
    /// Expected artifact missing from disk.
    ArtifactMissing(String),
    /// Backend failed to initialize or load the model.
    BackendFailure(String),
    /// Anything else.
    Other(String),
}

impl LifecycleFault {
    pub fn detail(&self) -> &str {
        match self {
            LifecycleFault::ChecksumMismatch(d)
            | LifecycleFault::ArtifactMissing(d)
            | LifecycleFault::BackendFailure(d)
            | LifecycleFault::Other(d) => d,
        }
    }

    /// Where the lifecycle re-enters the table after this fault.
    pub fn recovery_state(&self) -> ModelLifecycleState {
        match self {
            LifecycleFault::ChecksumMismatch(_) => ModelLifecycleState::Validating,
            LifecycleFault::ArtifactMissing(_) => ModelLifecycleState::Downloading,
            LifecycleFault::BackendFailure(_) => ModelLifecycleState::Initializing,
            LifecycleFault::Other(_) => ModelLifecycleState::Validating,
        }
    }
}

/// Observer invoked synchronously on every successful transition.
pub type LifecycleObserver =
    Box<dyn Fn(&str, ModelLifecycleState, ModelLifecycleState) + Send + Sync>;

/// Per-model lifecycle state machine.
pub struct LifecycleMachine {
    model_id: String,
    state: ModelLifecycleState,
    last_fault: Option<LifecycleFault>,
    observers: Vec<LifecycleObserver>,
}

impl LifecycleMachine {
    pub fn new(model_id: impl Into<String>, initial: ModelLifecycleState) -> Self {
        Self {
            model_id: model_id.into(),
            state: initial,
            last_fault: None,
            observers: Vec::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn state(&self) -> ModelLifecycleState {
        self.state
    }

    /// Cause stored by the most recent `handle_error`, for diagnostics.
    pub fn last_fault(&self) -> Option<&LifecycleFault> {
        self.last_fault.as_ref()
    }

    /// Register an observer. Notifications are fire-and-forget; observer
    /// panics are the observer's problem, not the machine's contract.
    pub fn add_observer(&mut self, observer: LifecycleObserver) {
        self.observers.push(observer);
    }

    /// Attempt a transition. Illegal transitions fail without mutating state.
    pub fn transition_to(&mut self, next: ModelLifecycleState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        let from = self.state;
        self.state = next;
        if next != ModelLifecycleState::Error {
            self.last_fault = None;
        }
        log::debug!("model {}: {} -> {}", self.model_id, from, next);
        for observer in &self.observers {
            observer(&self.model_id, from, next);
        }
        Ok(())
    }

    /// Force a transition to `Error`, storing the classified cause. Does not
    /// auto-recover; callers consult [`recovery_state`](Self::recovery_state)
    /// and drive the re-entry themselves.
    pub fn handle_error(&mut self, fault: LifecycleFault) {
        let from = self.state;
        self.state = ModelLifecycleState::Error;
        log::warn!(
            "model {}: {} -> error ({})",
            self.model_id,
            from,
            fault.detail()
        );
        self.last_fault = Some(fault);
        for observer in &self.observers {
            observer(&self.model_id, from, ModelLifecycleState::Error);
        }
    }

    /// The re-entry point appropriate for the stored fault, if any.
    pub fn recovery_state(&self) -> Option<ModelLifecycleState> {
        self.last_fault.as_ref().map(|f| f.recovery_state())
    }
}

//! Unified error types for the lumen-core public API.
//!
//! This module provides the canonical error type for all public API methods.
//! Internal modules may use their own error types, but convert to `LumenError`
//! at module boundaries.
//!
//! # Error Hierarchy
//!
//! ```text
//! LumenError
//! ├── NotInitialized               -- runtime used before initialize()
//! ├── ModelNotFound(id)            -- no catalog entry / nothing loaded
//! ├── LoadingFailed(reason)        -- lifecycle could not reach Ready
//! ├── GenerationFailed(reason)     -- backend execution failures
//! ├── FrameworkNotAvailable(fw)    -- no registered adapter handles the model
//! ├── DownloadFailed(reason)       -- artifact fetch failures
//! ├── ValidationFailed(detail)     -- checksum / artifact validation
//! ├── RoutingFailed(reason)        -- no viable execution target
//! ├── ExtractionFailed(reason)     -- structured output never parsed
//! ├── NotImplemented(what)         -- declared but unsupported operation
//! ├── Lifecycle(LifecycleError)    -- illegal state transition
//! ├── Io(std::io::Error)           -- I/O errors
//! └── Serialization(String)        -- JSON parsing errors
//! ```

use crate::adapter::Framework;
use crate::lifecycle::LifecycleError;
use thiserror::Error;

/// The canonical error type for the lumen-core public API.
#[derive(Error, Debug)]
pub enum LumenError {
    /// The runtime was used before `initialize()` completed.
    #[error("runtime not initialized")]
    NotInitialized,

    /// No model with this identifier is known, or no model is loaded.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The model lifecycle could not reach the ready state.
    #[error("model loading failed: {0}")]
    LoadingFailed(String),

    /// Backend execution failed or timed out.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// No registered adapter can handle the requested framework.
    #[error("framework not available: {0}")]
    FrameworkNotAvailable(Framework),

    /// Artifact download failed (network, HTTP status, cancellation).
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Downloaded artifact failed checksum or structural validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The routing engine could not produce a viable target.
    #[error("routing failed: {0}")]
    RoutingFailed(String),

    /// Structured output could not be parsed after bounded retries.
    #[error("structured extraction failed: {0}")]
    ExtractionFailed(String),

    /// Declared but unsupported operation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Illegal lifecycle state transition.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LumenError {
    /// Whether this error is a caller mistake (fix the call) as opposed to an
    /// infrastructure failure (retry or surface to the user).
    ///
    /// UI layers use this to decide between automatic retry and a prompt.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LumenError::NotInitialized
                | LumenError::ModelNotFound(_)
                | LumenError::NotImplemented(_)
                | LumenError::Lifecycle(_)
        )
    }
}

impl From<serde_json::Error> for LumenError {
    fn from(err: serde_json::Error) -> Self {
        LumenError::Serialization(err.to_string())
    }
}

/// Result type for lumen-core public API operations.
pub type LumenResult<T> = Result<T, LumenError>;

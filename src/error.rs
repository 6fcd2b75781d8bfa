//! Error types for Famulus
//!
//! This module defines all error types used throughout the agent. Uses
//! `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use thiserror::Error;

// ============================================================================
// Backend Error Classification
// ============================================================================

/// Structured inference-backend error classification.
///
/// Every provider translates its own wire-level failures into one of these
/// variants at the backend boundary, so the loop engine and the scheduler can
/// make degrade/compact/halt decisions without string matching.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Generic provider failure. The caller degrades gracefully,
    /// typically by sending an apology to the user.
    #[error("backend error: {0}")]
    Api(String),

    /// The request exceeded the model's context window. The caller should
    /// compact the conversation and retry, or abort the turn.
    #[error("context too large: {0}")]
    ContextTooLarge(String),

    /// Authentication or permission failure. Fatal: credentials will not
    /// self-heal, so this must propagate to the process supervisor.
    #[error("backend auth error: {0}")]
    Auth(String),
}

impl BackendError {
    /// Returns `true` if this error must propagate and halt the scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Auth(_))
    }

    /// Returns `true` if compacting the conversation may make the request fit.
    pub fn is_context_too_large(&self) -> bool {
        matches!(self, BackendError::ContextTooLarge(_))
    }
}

impl From<BackendError> for FamulusError {
    fn from(err: BackendError) -> Self {
        FamulusError::Backend(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for Famulus operations.
#[derive(Error, Debug)]
pub enum FamulusError {
    /// Configuration-related errors (invalid config, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Classified inference backend error.
    #[error("Backend error: {0}")]
    Backend(BackendError),

    /// Chat transport errors (connection failures, send failures, etc.)
    #[error("Chat error: {0}")]
    Chat(String),

    /// Tool registry errors (used internally by the registry; tool failures
    /// surface to the model as result text, never as this variant).
    #[error("Tool error: {0}")]
    Tool(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Message bus channel closed unexpectedly
    #[error("Bus error: channel closed")]
    BusClosed,
}

impl FamulusError {
    /// Returns `true` if this error must terminate the scheduler.
    ///
    /// Only authentication failures qualify; everything else is logged and
    /// the message loop continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FamulusError::Backend(b) if b.is_fatal())
    }
}

/// A specialized `Result` type for Famulus operations.
pub type Result<T> = std::result::Result<T, FamulusError>;

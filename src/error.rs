//! Top-level error types for slackgpt.

use std::sync::Arc;
use std::time::Duration;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Render this error as a chat reply, prefixed with the reserved error marker.
    pub fn render(&self, marker: &str) -> String {
        match self {
            Error::Llm(error) => error.render(marker),
            other => format!("{marker} {other:#}"),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<config::ConfigError>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Failure category of a completion backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    RateLimited,
    MalformedRequest,
    BackendUnavailable,
    Unknown,
    AssistantUnresolved,
    AssistantTimeout,
    AssistantTerminalFailure,
    Cancelled,
}

/// Completion backend and dispatch errors.
///
/// Every variant is recoverable at the process level: the relay renders it
/// into a reply instead of propagating it.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by the model backend: {message}")]
    RateLimited { message: String },

    #[error("the model backend rejected the request: {message}")]
    MalformedRequest { message: String },

    #[error("model backend unavailable: {message}")]
    BackendUnavailable { message: String, diagnostics: String },

    #[error("unexpected model backend failure: {message}")]
    Unknown { message: String, diagnostics: String },

    #[error("no assistant matches the topic or purpose of channel {channel_id}")]
    AssistantUnresolved { channel_id: String },

    #[error("assistant run {run_id} timed out after {}s", elapsed.as_secs())]
    AssistantTimeout { run_id: String, elapsed: Duration },

    #[error("assistant run ended with status: {status}")]
    AssistantTerminalFailure { status: String },

    #[error("request cancelled before the model replied")]
    Cancelled,
}

impl LlmError {
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            LlmError::RateLimited { .. } => LlmErrorKind::RateLimited,
            LlmError::MalformedRequest { .. } => LlmErrorKind::MalformedRequest,
            LlmError::BackendUnavailable { .. } => LlmErrorKind::BackendUnavailable,
            LlmError::Unknown { .. } => LlmErrorKind::Unknown,
            LlmError::AssistantUnresolved { .. } => LlmErrorKind::AssistantUnresolved,
            LlmError::AssistantTimeout { .. } => LlmErrorKind::AssistantTimeout,
            LlmError::AssistantTerminalFailure { .. } => LlmErrorKind::AssistantTerminalFailure,
            LlmError::Cancelled => LlmErrorKind::Cancelled,
        }
    }

    /// Build an `Unknown` error from any error value, keeping its full source chain.
    pub fn unknown(error: impl Into<anyhow::Error>) -> Self {
        let error = error.into();
        LlmError::Unknown {
            message: error.to_string(),
            diagnostics: format!("{error:?}"),
        }
    }

    /// Render as user-facing reply text.
    ///
    /// Rate limits and rejected requests get a short line; unavailable and
    /// unknown failures carry their diagnostic detail in a code block.
    pub fn render(&self, marker: &str) -> String {
        match self {
            LlmError::BackendUnavailable { diagnostics, .. } | LlmError::Unknown { diagnostics, .. } => {
                format!("{marker} {self}\n```\n{diagnostics}\n```")
            }
            _ => format!("{marker} {self}"),
        }
    }
}

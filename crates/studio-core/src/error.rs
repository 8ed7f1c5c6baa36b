//! Error types for the studio client

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StudioError>;

/// Coarse classification of a [`StudioError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ServerUnavailable,
    NoModelsLoaded,
    NetworkError,
    Timeout,
    InvalidRequest,
    ModelError,
    RateLimited,
    Unauthorized,
    SerializationError,
    ToolExecutionError,
    Cancelled,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::ServerUnavailable => "server_unavailable",
            ErrorKind::NoModelsLoaded => "no_models_loaded",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ModelError => "model_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::SerializationError => "serialization_error",
            ErrorKind::ToolExecutionError => "tool_execution_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum StudioError {
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("No models are loaded on the server")]
    NoModelsLoaded,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl StudioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StudioError::ServerUnavailable(_) => ErrorKind::ServerUnavailable,
            StudioError::NoModelsLoaded => ErrorKind::NoModelsLoaded,
            StudioError::Network(_) => ErrorKind::NetworkError,
            StudioError::Timeout(_) => ErrorKind::Timeout,
            StudioError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            StudioError::Model(_) => ErrorKind::ModelError,
            StudioError::RateLimited(_) => ErrorKind::RateLimited,
            StudioError::Unauthorized(_) => ErrorKind::Unauthorized,
            StudioError::Serialization(_) => ErrorKind::SerializationError,
            StudioError::ToolExecution { .. } => ErrorKind::ToolExecutionError,
            StudioError::Cancelled => ErrorKind::Cancelled,
            StudioError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NetworkError
                | ErrorKind::RateLimited
                | ErrorKind::SerializationError
                | ErrorKind::Unknown
        )
    }

    /// Remedial hint to show alongside the message
    pub fn suggestion(&self) -> Option<&'static str> {
        match self.kind() {
            ErrorKind::ServerUnavailable => {
                Some("Start the local model server and enable its HTTP API")
            }
            ErrorKind::NoModelsLoaded => Some("Load a model in the server before sending requests"),
            ErrorKind::NetworkError => Some("Check the base URL and your network connection"),
            ErrorKind::Timeout => Some("Increase the request timeout or use a smaller model"),
            ErrorKind::InvalidRequest => Some("Check the request parameters"),
            ErrorKind::ModelError => Some("Verify the model id with `studio models`"),
            ErrorKind::RateLimited => Some("Wait a moment and try again"),
            ErrorKind::Unauthorized => Some("Check the configured API key"),
            ErrorKind::SerializationError => Some("The server sent an unexpected response, retry"),
            ErrorKind::ToolExecutionError => Some("Inspect the tool arguments and handler"),
            ErrorKind::Cancelled | ErrorKind::Unknown => None,
        }
    }

    /// Map a transport failure from reqwest
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: std::time::Duration) -> Self {
        if err.is_timeout() {
            StudioError::Timeout(timeout)
        } else if err.is_connect() {
            if is_resolve_failure(&err) {
                StudioError::Network(err.to_string())
            } else {
                StudioError::ServerUnavailable(err.to_string())
            }
        } else if err.is_decode() {
            StudioError::Serialization(err.to_string())
        } else if let Some(status) = err.status() {
            StudioError::from_status(status, err.to_string())
        } else {
            StudioError::Network(err.to_string())
        }
    }

    /// Map a non-success HTTP status and its body
    pub(crate) fn from_status(status: StatusCode, body: String) -> Self {
        let message = if body.trim().is_empty() {
            format!("request failed with status {}", status)
        } else {
            format!("request failed ({}): {}", status, body.trim())
        };

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return StudioError::Unauthorized(message);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return StudioError::RateLimited(message);
        }
        if status.is_server_error() {
            return StudioError::ServerUnavailable(message);
        }

        let mentions_model = body.to_lowercase().contains("model");
        match status {
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY
                if mentions_model =>
            {
                StudioError::Model(message)
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                StudioError::InvalidRequest(message)
            }
            _ => StudioError::Unknown(message),
        }
    }
}

/// Whether a connect failure happened while resolving the host name
///
/// Refused or unreachable connections mean the server is down; a failed
/// lookup is a network problem that may clear up on its own.
fn is_resolve_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) {
                return false;
            }
        }
        let text = e.to_string().to_lowercase();
        if text.contains("dns error")
            || text.contains("failed to lookup address")
            || text.contains("name or service not known")
            || text.contains("no such host")
        {
            return true;
        }
        source = e.source();
    }
    false
}

impl From<serde_json::Error> for StudioError {
    fn from(err: serde_json::Error) -> Self {
        StudioError::Serialization(err.to_string())
    }
}

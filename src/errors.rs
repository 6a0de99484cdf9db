// src/errors.rs

use thiserror::Error;

/// Every failure the client can surface.
#[derive(Debug, Error)]
pub enum PalaverError {
    /// Transport failure or a non-2xx response.
    #[error("network error{}: {message}", status_suffix(.status))]
    Network {
        status: Option<u16>,
        message: String,
    },

    /// A single malformed `data:` frame. Recovered inside the decoder.
    #[error("malformed stream frame '{line}': {message}")]
    Parse { line: String, message: String },

    /// Structured error payload returned by the backend.
    #[error("backend error: {message}")]
    Backend { message: String },

    /// The user stopped the stream. `content` is what had arrived by then.
    #[error("request cancelled")]
    Cancelled { content: String },

    #[error("another request is already in flight")]
    Busy,

    #[error("message '{id}' not found")]
    MessageNotFound { id: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PalaverError {
    pub fn network_error(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Network {
            status,
            message: message.into(),
        }
    }

    pub fn backend_error(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn parse_error(line: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            line: line.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for PalaverError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

pub type PalaverResult<T> = Result<T, PalaverError>;

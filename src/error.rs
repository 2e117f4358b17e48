//! Error types shared by the delivery, stream and configuration layers.

use thiserror::Error;

/// Failure of a single delivery attempt against the ingestion endpoint.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Connection refused, reset, timed out, DNS failure...
    #[error("transport error: {0}")]
    Transport(String),

    /// 5xx (or 429) answer: the endpoint may accept the same payload later.
    #[error("server error: HTTP {0}")]
    Server(u16),

    /// Well-formed 4xx answer: the payload will never be accepted.
    #[error("payload rejected: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl DeliveryError {
    /// Classify an HTTP status code that is not a success.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        if status == 429 || status >= 500 {
            DeliveryError::Server(status)
        } else {
            DeliveryError::Rejected {
                status,
                body: body.into(),
            }
        }
    }

    /// HTTP status of the answer, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Transport(_) => None,
            DeliveryError::Server(status) | DeliveryError::Rejected { status, .. } => Some(*status),
        }
    }

    /// Whether another attempt with the same payload could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transport(_) | DeliveryError::Server(_))
    }
}

/// Stream-level failures. Every variant makes the connection manager
/// tear the subscription down and reconnect.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream refused credentials: HTTP {0}")]
    Unauthorized(u16),

    #[error("stream answered HTTP {0}")]
    Status(u16),

    #[error("read failed: {0}")]
    Read(String),
}

/// Start-up configuration problems. These are the only fatal errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("config file {path}: {reason}")]
    File { path: String, reason: String },
}

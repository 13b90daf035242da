use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("method {method} not allowed")]
    MethodNotAllowed { method: String },

    #[error("upstream credential is not configured ({env_var})")]
    MissingCredential { env_var: String },

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("request body too large: {size} bytes (max: {max} bytes)")]
    RequestTooLarge { size: usize, max: usize },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Returns a user-friendly suggestion for how to resolve this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::MethodNotAllowed { .. } => Some("Send the conversation with POST"),
            Error::RequestTooLarge { .. } => Some("Trim the conversation history and retry"),
            Error::Timeout(_) => Some("Check that the upstream API is reachable"),
            _ => None,
        }
    }

    /// Upstream failure built from a transport-level error message.
    pub fn upstream_unreachable(message: impl Into<String>) -> Self {
        Error::Upstream {
            status: 502,
            body: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

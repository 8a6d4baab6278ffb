use thiserror::Error;

/// Inference failure taxonomy.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Connection-level failure. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// No response within the configured timeout. Retryable.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Rejected credentials. Fatal.
    #[error("authentication failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// Non-success status from the provider.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body could not be interpreted as a model turn.
    #[error("malformed response: {0}")]
    Parse(String),

    /// The request was rejected locally before being sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// Whether a fresh attempt with the same transcript may succeed.
    ///
    /// `Parse` is handled separately by the retry policy (at most one retry).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Auth { .. } | Self::Parse(_) | Self::InvalidRequest(_) => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    pub(crate) fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => Self::Auth { status, message },
            _ => Self::Api { status, message },
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

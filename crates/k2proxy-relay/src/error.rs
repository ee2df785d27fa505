use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Upstream rejected the bearer token (HTTP 401/403 or a well-known
    /// auth tag in the body). Consumed by the dispatch loop for failure
    /// accounting; never surfaced to clients.
    #[error("upstream rejected token (HTTP {status})")]
    TokenRejected { status: u16 },

    #[error("upstream API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("upstream response parse error: {0}")]
    Parse(String),

    #[error("upstream request timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, RelayError>;

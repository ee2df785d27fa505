use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("token index {index} out of range (pool has {len} entries)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("login failed for {email}: {reason}")]
    Login { email: String, reason: String },

    #[error("refresh produced no tokens: {0}")]
    NoTokens(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

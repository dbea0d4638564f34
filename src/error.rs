//! Error taxonomy for the cache core, dispatcher, and client.
use crate::key::Key;

#[derive(thiserror::Error, Debug, Clone)]
pub enum CacheError {
    #[error("key not found: {0}")]
    NotFound(Key),

    #[error("requested size {claim} exceeds budget {max}")]
    OverBudget { claim: usize, max: usize },

    #[error("failed to load {key}: {message}")]
    LoadError { key: Key, message: String },

    #[error("failed to write {key}: {message}")]
    WriteError { key: Key, message: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    /// A failure envelope received from the server, carrying whatever
    /// message the remote side reported — the client has no way to
    /// recover the original error's kind across the wire.
    #[error("remote error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

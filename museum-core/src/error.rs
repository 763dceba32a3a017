//! Error types shared by every store.
//!
//! `StoreError` is `Clone` because one failed batch fans out to every caller
//! waiting on it.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the caching and persistence layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The request never produced a response (connect, timeout, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response or stored blob could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The persistent key/value medium failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A configuration value was rejected.
    #[error("invalid config value for {field}: {reason}")]
    Config { field: &'static str, reason: String },

    /// Background work could not be run or was lost.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl StoreError {
    /// Whether retrying the same request could succeed.
    pub fn is_network(&self) -> bool {
        matches!(self, StoreError::Http { .. } | StoreError::Transport(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        match (err.status(), err.url()) {
            (Some(status), Some(url)) => StoreError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            },
            _ if err.is_decode() => StoreError::Decode(err.to_string()),
            _ => StoreError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Config {
            field: "<toml>",
            reason: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Runtime(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_classified() {
        assert!(StoreError::Http {
            status: 500,
            url: "http://localhost/api/".into()
        }
        .is_network());
        assert!(StoreError::Transport("refused".into()).is_network());
        assert!(!StoreError::Decode("bad".into()).is_network());
    }

    #[test]
    fn json_errors_become_decode_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::Decode(_)));
    }
}

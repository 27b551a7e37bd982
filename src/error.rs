//! Error types for the reconciliation engine
//!
//! Errors are classified by transience:
//! - Transient: store reads/writes and subscription hiccups; callers keep
//!   their last-known state and retry on the next tick or change event.
//! - Configuration: bad timezone or config file; surfaced to the caller.
//!
//! Nothing in this crate is fatal to the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    // Transient errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Subscription channel closed")]
    ChannelClosed,

    // Configuration errors
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to decode document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(String),
}

impl EngineError {
    /// Returns true if the caller should keep previous state and retry on
    /// the next tick or subscription event.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::ChannelClosed)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_transient() {
        assert!(EngineError::Store("offline".into()).is_transient());
        assert!(EngineError::ChannelClosed.is_transient());
    }

    #[test]
    fn test_config_errors_are_not_transient() {
        assert!(!EngineError::InvalidTimezone("Mars/Olympus".into()).is_transient());
        assert!(!EngineError::Configuration("bad".into()).is_transient());
    }
}

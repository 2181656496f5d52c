//! Error handling for the production line
//!
//! This module defines the crate-level error type and a Result alias used by
//! configuration, control and registry operations. Failures inside the running
//! pipeline (channel timeouts, policy faults) never surface here; they are
//! converted into events at the station boundary.

use thiserror::Error;

/// Main error type for production line operations
#[derive(Error, Debug)]
pub enum LineError {
    /// Errors related to configuration loading/saving/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A station name that does not belong to the fixed topology
    #[error("Unknown station: {0}")]
    UnknownStation(String),

    /// A worker name that is not registered
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    /// A setting value outside its permitted range
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LineError>,
    },
}

impl LineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for production line operations
pub type Result<T> = std::result::Result<T, LineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LineError::UnknownStation("Painting".to_string());
        assert_eq!(err.to_string(), "Unknown station: Painting");
    }

    #[test]
    fn test_error_with_context() {
        let err = LineError::InvalidSetting("failure_rate = 1.5".to_string());
        let with_ctx = err.with_context("Failed to configure Assembler");
        assert!(with_ctx.to_string().contains("Failed to configure Assembler"));
        assert!(with_ctx.to_string().contains("failure_rate = 1.5"));
    }

    #[test]
    fn test_result_ext_context() {
        let result: Result<()> = Err(LineError::Config("missing field".to_string()));
        let err = result.context("Loading line.toml").unwrap_err();
        assert!(matches!(err, LineError::WithContext { .. }));
    }
}

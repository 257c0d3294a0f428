//! Error types for continual-tune-rs.
//!
//! Only conditions that abort an operation live here. Missing weights or
//! unregistered adapter modules are logged and treated as pass-through, and
//! per-item import failures are reported through
//! [`ImportOutcome`](crate::ingest::ImportOutcome) instead.
//!
//! # Example
//!
//! ```rust
//! use continual_tune_rs::{ContinualConfig, ContinualError};
//!
//! # fn main() {
//! match ContinualConfig::from_preset("does-not-exist") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(ContinualError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for continual-tune-rs operations.
pub type Result<T> = std::result::Result<T, ContinualError>;

/// Errors that can occur in continual-tune-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ContinualError {
    /// Configuration error. Fatal at engine construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// State (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A buffer handed across a collaborator boundary has the wrong size.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Expected element count.
        expected: usize,
        /// Actual element count.
        actual: usize,
    },

    /// Checkpoint save/load error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Compute backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Import error for a whole source (per-item failures are not errors).
    #[error("import error: {0}")]
    Import(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[cfg(feature = "candle")]
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl ContinualError {
    /// Shorthand for a [`ContinualError::ShapeMismatch`].
    pub fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}

/// Returns a shape error unless `actual == expected`.
pub(crate) fn ensure_len(context: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ContinualError::shape(context, expected, actual))
    }
}

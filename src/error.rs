//! Unified error types for swpll
//!
//! Every variant here is a startup-time failure. Once streaming has begun
//! nothing in the control loop or the frame exchange returns an error.

use thiserror::Error;

/// Main error type for swpll operations
#[derive(Error, Debug)]
pub enum PllError {
    /// Configuration rejected before streaming
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Application PLL register settings outside the datasheet limits
    #[error("Invalid PLL settings: {0}")]
    InvalidPllSettings(String),

    /// Divider table that cannot be used safely
    #[error("Malformed divider table: {0}")]
    MalformedTable(String),

    /// Table index outside the table
    #[error("Table index {index} out of range (table has {len} entries)")]
    IndexOutOfRange { index: usize, len: usize },

    /// Engine used before `initialize`
    #[error("Streaming engine not initialized")]
    NotInitialized,

    /// Engine initialized twice
    #[error("Streaming engine already initialized")]
    AlreadyInitialized,

    /// Session configuration returned by the callbacks does not match the link
    #[error("Stream configuration mismatch - expected: {expected}, actual: {actual}")]
    StreamMismatch { expected: String, actual: String },

    /// Configuration file could not be loaded
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Result type alias for swpll operations
pub type Result<T> = std::result::Result<T, PllError>;

impl PllError {
    /// Create a malformed-table error with context
    pub fn malformed_table(message: impl Into<String>) -> Self {
        Self::MalformedTable(message.into())
    }

    /// Create an invalid-configuration error with context
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the error stems from configuration-time data
    ///
    /// These are reported once and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PllError::InvalidConfig(_)
                | PllError::InvalidPllSettings(_)
                | PllError::MalformedTable(_)
                | PllError::IndexOutOfRange { .. }
                | PllError::Config(_)
        )
    }
}

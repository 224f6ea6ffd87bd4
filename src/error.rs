//! Error types for Inferir
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Inferir operations
pub type Result<T> = std::result::Result<T, InferirError>;

/// Error type for all Inferir operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferirError {
    /// Shape mismatch between buffers
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Invalid shape specification
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Reason for invalidity
        reason: String,
    },

    /// Unsupported head configuration (query heads must be a multiple of KV heads)
    #[error("Unsupported head configuration: {q_heads} query heads, {kv_heads} KV heads")]
    UnsupportedHeadConfig {
        /// Number of query heads
        q_heads: usize,
        /// Number of key/value heads
        kv_heads: usize,
    },

    /// Operation not supported for this configuration
    #[error("Operation '{operation}' not supported: {reason}")]
    UnsupportedOperation {
        /// Operation name
        operation: String,
        /// Reason it's not supported
        reason: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

//! Unified error types for FerroDB
//!
//! This module provides a centralized error hierarchy that all components
//! can use, enabling consistent error handling across the codebase. The
//! query engine maps these variants onto the single-line wire error payload.

use thiserror::Error;

/// Result type alias for FerroDB operations
pub type Result<T> = std::result::Result<T, DbError>;

/// Main error type for FerroDB operations
#[derive(Debug, Error)]
pub enum DbError {
    /// Malformed frame, unknown command type, missing required field
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Authentication failed
    #[error("authentication failed")]
    Unauthorized,

    /// Authenticated user lacks the required role or permission
    #[error("{0}")]
    Forbidden(String),

    /// Unknown space, key, user, or vector id
    #[error("{0}")]
    NotFound(String),

    /// Space or user already exists
    #[error("{0}")]
    Conflict(String),

    /// Data-file record does not match index expectation; fatal for the session
    #[error("data integrity violation: {0}")]
    InvariantViolation(String),

    /// Connection rejected by the capacity governor
    #[error("server at maximum capacity ({limit} connections)")]
    Capacity { limit: usize },

    /// Operation invoked after shutdown
    #[error("engine is closed")]
    EngineClosed,

    /// Dimension mismatch, invalid k/radius, unsupported descriptor or metric
    #[error("{0}")]
    Validation(String),

    /// Underlying filesystem or network error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure on a persisted artifact
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Create a bad request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// True when the session must terminate after reporting this error
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

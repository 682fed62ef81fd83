//! Error types for the calculator protocol.
//!
//! Every failure in this crate is delivered as the terminal resolution of a
//! [`Value`](crate::Value). A single failed value may be observed by many
//! readers and may be shipped to a peer, so `CalcError` is `Clone` and
//! serializable and carries messages rather than source errors.

use crate::capability::CapabilityId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for calculator operations.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum CalcError {
    // Definition and invocation errors
    #[error("Invalid arity: parameter count {param_count} is negative")]
    InvalidArity { param_count: i64 },

    #[error("Arity mismatch: expected {expected} parameters but got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("Parameter index {index} out of range for a frame of {param_count} parameters")]
    ParameterIndexOutOfRange { index: u32, param_count: usize },

    #[error("Parameter referenced outside of a function body")]
    NoActiveFrame,

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Cyclic capability reference: function {function} invoked from its own body")]
    CyclicCapability { function: CapabilityId },

    #[error("Call depth exceeded maximum of {max_depth}")]
    CallDepthExceeded { max_depth: usize },

    #[error("Invalid operator ordinal: {ordinal}")]
    InvalidOperator { ordinal: u16 },

    // Capability lifetime errors
    #[error("Capability released: {id}")]
    CapabilityReleased { id: CapabilityId },

    // Remote errors
    #[error("Remote dispatch failed: {message}")]
    RemoteDispatchFailure { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // Transport and serialization errors
    #[error("IO error: {message}")]
    Io { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for calculator operations.
pub type Result<T> = std::result::Result<T, CalcError>;

impl From<std::io::Error> for CalcError {
    fn from(err: std::io::Error) -> Self {
        CalcError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CalcError {
    fn from(err: serde_json::Error) -> Self {
        CalcError::Json {
            message: err.to_string(),
        }
    }
}

impl CalcError {
    /// Shorthand for a [`CalcError::RemoteDispatchFailure`].
    pub fn remote(message: impl Into<String>) -> Self {
        CalcError::RemoteDispatchFailure {
            message: message.into(),
        }
    }

    /// Shorthand for a [`CalcError::Protocol`] error.
    pub fn protocol(message: impl Into<String>) -> Self {
        CalcError::Protocol {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Remote dispatch / transport failure
    /// - -32001: Arity error
    /// - -32002: Parameter or frame error
    /// - -32003: Arithmetic error
    /// - -32004: Capability released
    /// - -32005: Validation error
    /// - -32006: Cyclic capability or call depth
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            CalcError::RemoteDispatchFailure { .. }
            | CalcError::Timeout(_)
            | CalcError::Io { .. } => -32000,

            CalcError::InvalidArity { .. } | CalcError::ArityMismatch { .. } => -32001,

            CalcError::ParameterIndexOutOfRange { .. } | CalcError::NoActiveFrame => -32002,

            CalcError::DivisionByZero => -32003,

            CalcError::CapabilityReleased { .. } => -32004,

            CalcError::Validation { .. } | CalcError::InvalidOperator { .. } => -32005,

            CalcError::CyclicCapability { .. } | CalcError::CallDepthExceeded { .. } => -32006,

            CalcError::Protocol { .. } => -32600,

            CalcError::Json { .. } => -32700,

            CalcError::Other(_) => -32603,
        }
    }

    /// Check if this error is a transport fault a caller might retry.
    ///
    /// The protocol layer itself never retries; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CalcError::RemoteDispatchFailure { .. } | CalcError::Timeout(_) | CalcError::Io { .. }
        )
    }
}

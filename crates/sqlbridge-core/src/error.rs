// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for sqlbridge
//!
//! Every I/O boundary (framing, decoding, connecting, spawning the server)
//! maps its failures onto this enum so callers see one taxonomy regardless
//! of where the failure happened.
//!
//! "Not ready yet" is deliberately absent: a read that finds no bytes at a
//! frame boundary is reported as [`crate::frame::FrameRead::Pending`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all engine operations
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Read failed: {message}")]
    ReadFailure { message: String },

    #[error("Malformed result payload: {message}")]
    DecodeFailure { message: String },

    #[error("No response after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Failed to start query server: {message}")]
    SpawnFailed { message: String },

    #[error("Port lookup tool not found: {tool}")]
    DiscoveryToolMissing { tool: String },

    #[error("Port lookup failed: {message}")]
    DiscoveryFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn read_failure(msg: impl Into<String>) -> Self {
        Self::ReadFailure { message: msg.into() }
    }

    pub fn decode_failure(msg: impl Into<String>) -> Self {
        Self::DecodeFailure { message: msg.into() }
    }

    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed { message: msg.into() }
    }

    pub fn discovery_tool_missing(tool: impl Into<String>) -> Self {
        Self::DiscoveryToolMissing { tool: tool.into() }
    }

    pub fn discovery_failed(msg: impl Into<String>) -> Self {
        Self::DiscoveryFailed { message: msg.into() }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::ConfigurationError { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// True for errors that abort only the in-flight request.
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            Self::ReadFailure { .. } | Self::DecodeFailure { .. } | Self::Timeout { .. }
        )
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

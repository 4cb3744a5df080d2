//! Engine-level types
//!
//! Wire types (results, vendors) come from `sqlbridge-core`; this module adds
//! what only the engine needs: request identity, callbacks and connection
//! state.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use sqlbridge_core::types::{QueryResult, Row, Vendor};

use crate::engine::error::EngineResult;

/// Unique identifier for a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receives a request's outcome: every statement result in execution order,
/// or the error that aborted the request. Invoked at most once.
pub type ResultCallback = Box<dyn FnOnce(EngineResult<Vec<QueryResult>>) + Send + 'static>;

/// Observable state of a [`crate::engine::Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Idle,
    AwaitingResponse,
}

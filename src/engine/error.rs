// SPDX-License-Identifier: Apache-2.0

//! Engine error types
//!
//! The taxonomy lives in `sqlbridge-core` so the wire layer and the engine
//! report failures identically.

pub use sqlbridge_core::error::{EngineError, EngineResult};

// SPDX-License-Identifier: Apache-2.0

//! sqlbridge-core
//!
//! Wire layer shared by the sqlbridge engine: the error taxonomy, result
//! schema, response framing, batch splitting and request encoding. Nothing
//! here touches a socket or a runtime.

pub mod batch;
pub mod decode;
pub mod error;
pub mod frame;
pub mod types;
pub mod wire;

pub use batch::{split_batches, split_script};
pub use decode::{decode_result, encode_result};
pub use error::{EngineError, EngineResult};
pub use frame::{FrameRead, FrameReader};
pub use types::{QueryResult, Row, Vendor};

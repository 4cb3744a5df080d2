// SPDX-License-Identifier: Apache-2.0

//! Result payload decoding
//!
//! Each non-terminator frame carries one protobuf-encoded [`QueryResult`].

use prost::Message;

use crate::error::{EngineError, EngineResult};
use crate::types::QueryResult;

/// Decodes one frame payload into a `QueryResult`.
pub fn decode_result(payload: &[u8]) -> EngineResult<QueryResult> {
    QueryResult::decode(payload).map_err(|e| EngineError::decode_failure(e.to_string()))
}

/// Encodes a `QueryResult` the way the server does.
pub fn encode_result(result: &QueryResult) -> Vec<u8> {
    result.encode_to_vec()
}

// SPDX-License-Identifier: Apache-2.0

//! Request-side wire encoding
//!
//! - handshake: one JSON line, sent once per socket
//! - query request: `<sql>\n<GS>\n`
//! - script request: wrapped batches concatenated into one write

use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::frame::TERMINATOR;
use crate::types::Vendor;

/// Placeholder replaced by the target database name in connection strings
pub const DATABASE_PLACEHOLDER: &str = "{DATABASE}";

#[derive(Debug, Serialize)]
struct Handshake<'a> {
    dbtype: &'a str,
    connstring: &'a str,
}

/// Encodes the handshake line.
pub fn handshake(vendor: Vendor, connstring: &str) -> EngineResult<Vec<u8>> {
    let mut line = serde_json::to_vec(&Handshake {
        dbtype: vendor.tag(),
        connstring,
    })
    .map_err(|e| EngineError::internal(format!("Failed to encode handshake: {e}")))?;
    line.push(b'\n');
    Ok(line)
}

/// Encodes a "run and expect tabular results" request.
pub fn query_request(sql: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(sql.len() + 3);
    buf.extend_from_slice(sql.as_bytes());
    buf.push(b'\n');
    buf.push(TERMINATOR);
    buf.push(b'\n');
    buf
}

/// Encodes a script request from already wrapped batches.
pub fn script_request<S: AsRef<str>>(batches: &[S]) -> Vec<u8> {
    batches
        .iter()
        .flat_map(|batch| batch.as_ref().as_bytes().iter().copied())
        .collect()
}

/// Substitutes the target database into a connection-string template.
pub fn substitute_database(template: &str, database: &str) -> String {
    template.replace(DATABASE_PLACEHOLDER, database)
}

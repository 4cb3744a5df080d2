//! Port-to-process lookup
//!
//! Uses `lsof` (or a configured replacement that accepts the same flags) to
//! find the process listening on the server port.

use std::env;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::engine::error::{EngineError, EngineResult};

/// Resolves `tool` against `PATH`. A value containing a path separator is
/// checked as-is.
pub fn find_in_path(tool: &str) -> Option<PathBuf> {
    let candidate = Path::new(tool);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|path| path.is_file())
}

/// Returns the pid listening on TCP `port`, if any.
pub async fn listening_pid(tool: &Path, port: u16) -> EngineResult<Option<u32>> {
    let output = Command::new(tool)
        .arg("-nP")
        .arg("-t")
        .arg(format!("-iTCP:{port}"))
        .arg("-sTCP:LISTEN")
        .output()
        .await
        .map_err(|e| {
            EngineError::discovery_failed(format!("Failed to run {}: {}", tool.display(), e))
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let pids = parse_pids(&stdout);
    debug!(port, status = ?output.status.code(), ?pids, "port lookup finished");

    if output.status.success() {
        return Ok(pids.first().copied());
    }

    // lsof exits 1 with no output when nothing matches.
    let stderr = String::from_utf8_lossy(&output.stderr);
    if pids.is_empty() && stderr.trim().is_empty() {
        Ok(None)
    } else {
        Err(EngineError::discovery_failed(format!(
            "{} exited with {}: {}",
            tool.display(),
            output.status,
            stderr.trim()
        )))
    }
}

/// Parses `lsof -t` output: one pid per line.
pub(crate) fn parse_pids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

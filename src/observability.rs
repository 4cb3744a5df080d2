//! Engine logging
//!
//! The engine only emits `tracing` events. A host that has no subscriber of
//! its own calls [`init_tracing`] once to get daily JSON files in the
//! configured log directory, next to the spawned server's output.

pub mod sensitive;

pub use sensitive::Sensitive;

use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::engine::error::{EngineError, EngineResult};

/// Prefix of the engine's own files; the appender adds `.<date>`
const LOG_FILE_PREFIX: &str = "sqlbridge.log";

/// Installs the JSON file subscriber and returns the log directory.
///
/// `RUST_LOG` wins over the configured filter. When another subscriber is
/// already installed it is left alone, and so is the panic hook.
pub fn init_tracing(config: &LoggingConfig) -> EngineResult<PathBuf> {
    let log_dir = config.directory();
    fs::create_dir_all(&log_dir).map_err(|e| {
        EngineError::configuration(format!(
            "Failed to create log directory {}: {}",
            log_dir.display(),
            e
        ))
    })?;
    let pruned = prune_rotated_logs(&log_dir, config.retention());

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.env_filter()?,
    };
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX))
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_thread_names(true)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .try_init()
        .is_ok();

    if !installed {
        debug!("a tracing subscriber is already installed");
        return Ok(log_dir);
    }

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(
            target: "panic",
            location = %location,
            message = %panic_message(panic_info.payload()),
            "engine panicked"
        );
        previous_hook(panic_info);
    }));

    match pruned {
        Ok(0) => {}
        Ok(count) => info!(count, "removed expired log files"),
        Err(e) => warn!(error = %e, "could not prune old log files"),
    }
    info!(directory = %log_dir.display(), "logging to file");
    Ok(log_dir)
}

/// Default directory for the engine's logs and the server log.
pub fn log_directory() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_default()
        .join("sqlbridge")
        .join("logs")
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    }
}

/// Deletes the engine's rotated files last modified before `retention`
/// ago. Other files in the directory are never touched.
fn prune_rotated_logs(log_dir: &Path, retention: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let rotated = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !rotated {
            continue;
        }

        let expired = fs::metadata(&path)
            .and_then(|metadata| metadata.modified())
            .is_ok_and(|modified| modified < cutoff);
        if expired && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

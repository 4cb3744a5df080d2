//! Progress reporting hook
//!
//! The host (an editor status line, a spinner) implements
//! [`ProgressIndicator`] to show that a connection is working through its
//! queue. `start` fires for every dispatched request and `stop` once the
//! queue drains, so implementations must tolerate repeated `start` calls.

use tracing::debug;

pub trait ProgressIndicator: Send + Sync {
    fn start(&self, connection: &str);
    fn stop(&self, connection: &str);
}

/// Default indicator: trace events only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressIndicator for LogProgress {
    fn start(&self, connection: &str) {
        debug!(connection, "request started");
    }

    fn stop(&self, connection: &str) {
        debug!(connection, "queue drained");
    }
}

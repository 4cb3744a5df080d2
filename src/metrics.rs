//! Request accounting for one client.
//!
//! Every connection of a [`Client`](crate::Client) reports into the same
//! [`RequestMetrics`]. Time is split in two: how long a request sat in its
//! connection's queue, and how long the server took once it was written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{QueryResult, Vendor};

/// Where a finished request spent its time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestTiming {
    /// Submission until the request was written (or failed to be)
    pub queued: Duration,
    /// Write until the last frame or the failure
    pub served: Duration,
}

#[derive(Debug, Default)]
pub struct RequestMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
    statement_errors: AtomicU64,
    queued_us: AtomicU64,
    served_us: AtomicU64,
    slowest_us: AtomicU64,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for a request whose callback is about to fire.
    pub fn record_outcome(
        &self,
        vendor: Vendor,
        outcome: &EngineResult<Vec<QueryResult>>,
        timing: RequestTiming,
    ) {
        match outcome {
            Ok(results) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                let failures = results.iter().filter(|r| r.is_failure(vendor)).count();
                self.statement_errors
                    .fetch_add(failures as u64, Ordering::Relaxed);
            }
            Err(EngineError::Timeout { .. }) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let queued = micros(timing.queued);
        let served = micros(timing.served);
        self.queued_us.fetch_add(queued, Ordering::Relaxed);
        self.served_us.fetch_add(served, Ordering::Relaxed);
        self.slowest_us
            .fetch_max(queued.saturating_add(served), Ordering::Relaxed);
    }

    /// Accounts for requests discarded by a disconnect without a callback.
    pub fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let timed_out = self.timed_out.load(Ordering::Relaxed);
        let finished = completed + failed + timed_out;

        let mean_ms = |total_us: u64| (finished > 0).then(|| total_us as f64 / finished as f64 / 1000.0);
        let slowest_us = self.slowest_us.load(Ordering::Relaxed);

        MetricsSnapshot {
            completed,
            failed,
            timed_out,
            dropped: self.dropped.load(Ordering::Relaxed),
            statement_errors: self.statement_errors.load(Ordering::Relaxed),
            mean_queued_ms: mean_ms(self.queued_us.load(Ordering::Relaxed)),
            mean_served_ms: mean_ms(self.served_us.load(Ordering::Relaxed)),
            slowest_ms: (finished > 0).then(|| slowest_us as f64 / 1000.0),
        }
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Point-in-time copy of a client's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests answered by the server, including statement-level errors
    pub completed: u64,
    /// Requests aborted by a connect, write, read or decode failure
    pub failed: u64,
    pub timed_out: u64,
    /// Requests discarded by a disconnect or reset
    pub dropped: u64,
    /// Results the vendor reported as failed inside completed requests
    pub statement_errors: u64,
    pub mean_queued_ms: Option<f64>,
    pub mean_served_ms: Option<f64>,
    pub slowest_ms: Option<f64>,
}

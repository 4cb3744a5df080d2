//! Timer-driven poller
//!
//! A poller is a task that calls a step function on a fixed interval until
//! the step says stop or the poller is cancelled. Nothing in a step may
//! block: it performs at most one non-blocking read attempt.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What the poller does after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollControl {
    /// Nothing available; wait for the next tick
    Wait,
    /// Made progress; re-arm the timer immediately
    Again,
    /// Request finished or aborted; end the task
    Stop,
}

/// Handle to a running poller task
#[derive(Debug)]
pub(crate) struct Poller {
    cancel: CancellationToken,
}

impl Poller {
    pub(crate) fn spawn<F>(runtime: &Handle, period: Duration, mut step: F) -> Self
    where
        F: FnMut() -> PollControl + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match step() {
                        PollControl::Wait => {}
                        PollControl::Again => ticker.reset_immediately(),
                        PollControl::Stop => break,
                    },
                }
            }
        });

        Self { cancel }
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

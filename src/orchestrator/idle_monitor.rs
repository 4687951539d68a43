//! Per-session idle monitor.
//!
//! While a session is running, an [`IdleMonitor`] ticks at a fixed
//! interval and asks the controller to evaluate inactivity. The check
//! itself runs inside the controller's operation gate, so an idle stop
//! can never interleave with a concurrent start or destroy.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Result of one idle evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// Session still within its idle threshold; keep ticking.
    Active,
    /// Session was stopped for inactivity; the monitor exits.
    Stopped,
    /// Session is no longer running (or gone); the monitor exits.
    Disarmed,
}

/// Builder for a per-session idle monitor.
///
/// Call [`spawn`](Self::spawn) to start the background task.
pub struct IdleMonitor {
    session_id: String,
    check_interval: Duration,
    cancel: CancellationToken,
}

impl IdleMonitor {
    /// Construct a monitor (does not start ticking yet).
    #[must_use]
    pub fn new(session_id: String, check_interval: Duration) -> Self {
        Self {
            session_id,
            check_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the ticking task. `check` is invoked once per interval until
    /// it returns something other than [`IdleVerdict::Active`] or the
    /// monitor is disarmed.
    #[must_use]
    pub fn spawn<F, Fut>(self, check: F) -> IdleMonitorHandle
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = IdleVerdict> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let join_handle = tokio::spawn(
            Self::run(self.session_id.clone(), self.check_interval, self.cancel, check)
                .instrument(info_span!("idle_monitor")),
        );

        IdleMonitorHandle {
            session_id: self.session_id,
            cancel,
            join_handle: Some(join_handle),
        }
    }

    async fn run<F, Fut>(
        session_id: String,
        check_interval: Duration,
        cancel: CancellationToken,
        check: F,
    ) where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = IdleVerdict> + Send + 'static,
    {
        let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(session_id, "idle monitor disarmed");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match check().await {
                IdleVerdict::Active => {}
                IdleVerdict::Stopped => {
                    info!(session_id, "idle monitor stopped session");
                    return;
                }
                IdleVerdict::Disarmed => {
                    debug!(session_id, "session no longer running, idle monitor exiting");
                    return;
                }
            }
        }
    }
}

/// Control handle for a running idle monitor. Dropping it disarms the monitor.
pub struct IdleMonitorHandle {
    session_id: String,
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl IdleMonitorHandle {
    /// Stop ticking. Does not wait for an in-flight check to finish, so it
    /// is safe to call from inside the check itself.
    pub fn disarm(&self) {
        debug!(session_id = %self.session_id, "disarming idle monitor");
        self.cancel.cancel();
    }

    /// Whether the monitor task is still alive.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .join_handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for IdleMonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Detach; the task exits on its own once it observes the cancellation.
        drop(self.join_handle.take());
    }
}

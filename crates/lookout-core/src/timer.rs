use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A cancellable fixed-period trigger.
///
/// The first tick fires one full period after [`start`](Self::start).
/// Stopping is idempotent and dropping the task stops it, so a toggled-off
/// or torn-down owner never leaks a running timer.
#[derive(Debug)]
pub struct RepeatingTask {
    handle: Option<JoinHandle<()>>,
    period: Duration,
}

impl RepeatingTask {
    /// Spawn the timer on the current tokio runtime.
    pub fn start<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let first = Instant::now() + period;
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick();
            }
        });
        tracing::debug!(period_ms = period.as_millis() as u64, "repeating task started");
        Self {
            handle: Some(handle),
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("repeating task stopped");
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.stop();
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type RecurringTask = Arc<dyn Fn() + Send + Sync>;

/// Cancels the recurring task when dropped.
pub struct RecurringHandle {
    cancel: CancellationToken,
    interval: Duration,
}

impl RecurringHandle {
    pub fn new(cancel: CancellationToken, interval: Duration) -> Self {
        RecurringHandle { cancel, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for RecurringHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Platform seam for keeping the process alive while tracking and for timers
/// that must keep firing when the app is backgrounded. The tracker never
/// branches on platform, each target ships an implementation of this.
pub trait BackgroundExecutionPolicy: Send + Sync {
    fn acquire_keep_alive(&self) -> anyhow::Result<()>;

    fn release(&self);

    fn is_keep_alive_held(&self) -> bool;

    /// Run `task` every `interval`, first run one interval from now.
    fn schedule_recurring(&self, interval: Duration, task: RecurringTask) -> RecurringHandle;
}

/// Timers on the tokio runtime, keep-alive is bookkeeping only. Fits desktop
/// and server hosts where the process is not suspended.
#[derive(Default)]
pub struct TokioBackgroundPolicy {
    keep_alive: AtomicBool,
}

impl TokioBackgroundPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackgroundExecutionPolicy for TokioBackgroundPolicy {
    fn acquire_keep_alive(&self) -> anyhow::Result<()> {
        if !self.keep_alive.swap(true, Ordering::SeqCst) {
            debug!("[background] keep-alive acquired");
        }
        Ok(())
    }

    fn release(&self) {
        if self.keep_alive.swap(false, Ordering::SeqCst) {
            debug!("[background] keep-alive released");
        }
    }

    fn is_keep_alive_held(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }

    fn schedule_recurring(&self, interval: Duration, task: RecurringTask) -> RecurringHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let start = Instant::now() + interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => task(),
                }
            }
        });
        RecurringHandle::new(cancel, interval)
    }
}

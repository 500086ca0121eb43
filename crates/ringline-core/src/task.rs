//! Slot holding a service's background task.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Shortest period a background task ticks at.
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Interval for a periodic task. A zero period is raised to [`MIN_PERIOD`]
/// so a misconfigured timer cannot panic the runtime.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(MIN_PERIOD));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Owns at most one background task; replacing or stopping aborts it.
#[derive(Debug, Default)]
pub(crate) struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    fn guard(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a task, aborting the one it replaces.
    pub(crate) fn replace(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.guard().replace(handle) {
            previous.abort();
        }
    }

    /// Abort the running task, if any.
    pub(crate) fn abort(&self) {
        if let Some(handle) = self.guard().take() {
            handle.abort();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.guard().as_ref().is_some_and(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_ticks() {
        let mut interval = ticker(Duration::ZERO);
        assert_eq!(interval.period(), MIN_PERIOD);
        interval.tick().await;
        interval.tick().await;
    }
}

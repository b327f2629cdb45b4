//! Wakeup timers.
//!
//! A [`WakeupTimer`] holds at most one pending request. Arming a new time
//! replaces whatever was armed before; the timeout event carries the time
//! that was armed so late deliveries can be recognized.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::datetime::DateTime;

pub trait WakeupTimer: Send + Sync {
    /// Arm the timer for `when`, replacing any earlier request.
    fn set_wakeup_time(&self, when: DateTime);

    /// Disarm the pending request, if any.
    fn cancel(&self);

    /// Timeout notifications, carrying the armed time.
    fn subscribe(&self) -> broadcast::Receiver<DateTime>;
}

/// Longest single sleep; the clock is re-read after each slice so a
/// changed wall clock is noticed.
const MAX_SLICE: Duration = Duration::from_secs(60);

/// Software wakeup timer driven by tokio sleeps against a [`Clock`].
pub struct TokioWakeupTimer {
    clock: Arc<dyn Clock>,
    pending: Mutex<Option<JoinHandle<()>>>,
    timeouts: broadcast::Sender<DateTime>,
}

impl TokioWakeupTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (timeouts, _) = broadcast::channel(16);
        TokioWakeupTimer {
            clock,
            pending: Mutex::new(None),
            timeouts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WakeupTimer for TokioWakeupTimer {
    fn set_wakeup_time(&self, when: DateTime) {
        let clock = Arc::clone(&self.clock);
        let timeouts = self.timeouts.clone();
        let task = tokio::spawn(async move {
            loop {
                let now = clock.localtime();
                if now >= when {
                    break;
                }
                let remaining = now.until(&when).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(remaining.min(MAX_SLICE)).await;
            }
            debug!(at = %when, "wakeup timer fired");
            let _ = timeouts.send(when);
        });

        if let Some(previous) = self.lock().replace(task) {
            previous.abort();
        }
    }

    fn cancel(&self) {
        if let Some(previous) = self.lock().take() {
            previous.abort();
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<DateTime> {
        self.timeouts.subscribe()
    }
}

impl Drop for TokioWakeupTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A timer that records what it was asked to do and fires on demand.
pub struct MockWakeupTimer {
    armed: Mutex<Option<DateTime>>,
    history: Mutex<Vec<DateTime>>,
    timeouts: broadcast::Sender<DateTime>,
}

impl MockWakeupTimer {
    pub fn new() -> Self {
        let (timeouts, _) = broadcast::channel(16);
        MockWakeupTimer {
            armed: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            timeouts,
        }
    }

    /// The currently armed time.
    pub fn armed(&self) -> Option<DateTime> {
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every time the timer was armed, oldest first.
    pub fn history(&self) -> Vec<DateTime> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Deliver the timeout for the armed time, disarming the timer.
    pub fn fire(&self) -> Option<DateTime> {
        let armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(when) = armed {
            let _ = self.timeouts.send(when);
        }
        armed
    }
}

impl Default for MockWakeupTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeupTimer for MockWakeupTimer {
    fn set_wakeup_time(&self, when: DateTime) {
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = Some(when);
        self.history.lock().unwrap_or_else(PoisonError::into_inner).push(when);
    }

    fn cancel(&self) {
        *self.armed.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn subscribe(&self) -> broadcast::Receiver<DateTime> {
        self.timeouts.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use chrono_tz::UTC;

    fn at(h: u32, m: u32) -> DateTime {
        DateTime::new(UTC, 2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_mock_timer_keeps_one_request() {
        let timer = MockWakeupTimer::new();
        let mut rx = timer.subscribe();

        timer.set_wakeup_time(at(9, 0));
        timer.set_wakeup_time(at(10, 0));
        assert_eq!(timer.armed(), Some(at(10, 0)));
        assert_eq!(timer.history(), vec![at(9, 0), at(10, 0)]);

        assert_eq!(timer.fire(), Some(at(10, 0)));
        assert_eq!(rx.try_recv().unwrap(), at(10, 0));
        assert_eq!(timer.armed(), None);
        assert_eq!(timer.fire(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_fires_once_clock_reaches_target() {
        let clock = Arc::new(MockClock::new(at(9, 0)));
        let timer = TokioWakeupTimer::new(clock.clone());
        let mut rx = timer.subscribe();

        timer.set_wakeup_time(at(9, 2));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(rx.try_recv().is_err());

        clock.set_localtime(at(9, 2));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(rx.try_recv().unwrap(), at(9, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_rearm_replaces_request() {
        let clock = Arc::new(MockClock::new(at(9, 0)));
        let timer = TokioWakeupTimer::new(clock.clone());
        let mut rx = timer.subscribe();

        timer.set_wakeup_time(at(9, 1));
        timer.set_wakeup_time(at(9, 5));
        clock.set_localtime(at(9, 1));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());

        timer.cancel();
        clock.set_localtime(at(9, 5));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }
}

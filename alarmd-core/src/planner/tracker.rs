//! Keeps a planner's window in step with the clock.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PlannerCommand, RangePlanner};
use crate::clock::{Clock, ClockEvent};
use crate::datetime::DateTime;
use crate::error::AlarmResult;
use crate::window::Window;

/// Longest upcoming window accepted from config, roughly ten years.
pub const MAX_UPCOMING_DAYS: u32 = 3660;

fn default_days() -> u32 {
    14
}

fn deserialize_days<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let days = u32::deserialize(deserializer)?;
    if days == 0 || days > MAX_UPCOMING_DAYS {
        return Err(serde::de::Error::custom(format!(
            "days must be between 1 and {MAX_UPCOMING_DAYS}, got {days}"
        )));
    }
    Ok(days)
}

/// How the tracked window is derived from "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowPolicy {
    /// The calendar month containing today
    Month,
    /// Today plus the following days
    Upcoming {
        #[serde(default = "default_days", deserialize_with = "deserialize_days")]
        days: u32,
    },
}

impl Default for WindowPolicy {
    fn default() -> Self {
        WindowPolicy::Upcoming {
            days: default_days(),
        }
    }
}

impl WindowPolicy {
    pub fn window_for(&self, now: &DateTime) -> AlarmResult<Window> {
        match self {
            WindowPolicy::Month => Ok(Window::month_of(now)),
            WindowPolicy::Upcoming { days } => Window::upcoming(now, *days),
        }
    }
}

/// Background task moving the planner's window as days pass.
///
/// The window is recomputed on every date change and every skew event.
/// Stops when dropped or when the planner goes away.
pub struct WindowTracker {
    task: JoinHandle<()>,
}

impl WindowTracker {
    /// Fails if the policy yields no window for the current time.
    pub fn spawn(
        planner: &RangePlanner,
        clock: Arc<dyn Clock>,
        policy: WindowPolicy,
    ) -> AlarmResult<Self> {
        let commands = planner.command_sender();
        let mut events = clock.subscribe();

        let mut current = policy.window_for(&clock.localtime())?;
        planner.set_window(current);

        let task = tokio::spawn(async move {
            loop {
                let forced = match events.recv().await {
                    Ok(ClockEvent::SkewDetected) | Err(RecvError::Lagged(_)) => true,
                    Ok(ClockEvent::DateChanged) => false,
                    Ok(ClockEvent::MinuteChanged) => continue,
                    Err(RecvError::Closed) => break,
                };

                let window = match policy.window_for(&clock.localtime()) {
                    Ok(window) => window,
                    Err(e) => {
                        warn!(error = %e, "keeping the previous window");
                        continue;
                    }
                };
                if !forced && window == current {
                    continue;
                }
                debug!(window = %window, forced, "tracked window moved");
                current = window;
                if commands.send(PlannerCommand::SetRange(window)).is_err() {
                    break;
                }
            }
        });

        Ok(WindowTracker { task })
    }
}

impl Drop for WindowTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono_tz::UTC;

    use super::*;
    use crate::clock::MockClock;
    use crate::debounce::DebounceSettings;
    use crate::engine::Engine;

    fn at(mo: u32, d: u32, h: u32, mi: u32) -> DateTime {
        DateTime::new(UTC, 2024, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_policy_windows() {
        let now = at(6, 15, 13, 30);

        let month = WindowPolicy::Month.window_for(&now).unwrap();
        assert_eq!(*month.begin(), at(6, 1, 0, 0));
        assert_eq!(*month.end(), at(7, 1, 0, 0));

        let upcoming = WindowPolicy::Upcoming { days: 3 }.window_for(&now).unwrap();
        assert_eq!(*upcoming.begin(), at(6, 15, 0, 0));
        assert_eq!(*upcoming.end(), at(6, 18, 0, 0));
    }

    #[test]
    fn test_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            window: WindowPolicy,
        }

        let month: Wrapper = toml::from_str("[window]\nkind = \"month\"\n").unwrap();
        assert_eq!(month.window, WindowPolicy::Month);

        let upcoming: Wrapper = toml::from_str("[window]\nkind = \"upcoming\"\n").unwrap();
        assert_eq!(upcoming.window, WindowPolicy::Upcoming { days: 14 });

        let week: Wrapper = toml::from_str("[window]\nkind = \"upcoming\"\ndays = 7\n").unwrap();
        assert_eq!(week.window, WindowPolicy::Upcoming { days: 7 });

        for days in ["0", "4000000000"] {
            let toml = format!("[window]\nkind = \"upcoming\"\ndays = {days}\n");
            assert!(toml::from_str::<Wrapper>(&toml).is_err(), "days = {days}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_follows_date_change() {
        let clock = Arc::new(MockClock::new(at(6, 30, 23, 59)));
        let planner = RangePlanner::new(Engine::new(DebounceSettings::default()), UTC);
        let _tracker = WindowTracker::spawn(&planner, clock.clone(), WindowPolicy::Month).unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(planner.range(), Some(Window::month_of(&at(6, 1, 0, 0))));

        clock.advance(chrono::Duration::minutes(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(planner.range(), Some(Window::month_of(&at(7, 1, 0, 0))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skew_moves_window() {
        let clock = Arc::new(MockClock::new(at(6, 10, 9, 0)));
        let planner = RangePlanner::new(Engine::new(DebounceSettings::default()), UTC);
        let policy = WindowPolicy::Upcoming { days: 1 };
        let _tracker = WindowTracker::spawn(&planner, clock.clone(), policy).unwrap();

        clock.jump_to(at(6, 20, 9, 0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(planner.range(), Some(policy.window_for(&at(6, 20, 0, 0)).unwrap()));
    }
}

//! Wall-clock access, minute ticks and skew detection.
//!
//! Intervals computed in wall-clock terms ("seconds until the next
//! minute") are only valid until the next discontinuity: suspend/resume,
//! a manual clock change, an NTP step, a timezone change. [`LiveClock`]
//! samples the wall clock and reports such jumps as
//! [`ClockEvent::SkewDetected`]; consumers treat that as "recompute
//! everything now".

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::duration_str;
use crate::datetime::DateTime;

pub const DEFAULT_SKEW_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SKEW_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// The wall clock crossed the top of a minute
    MinuteChanged,
    /// The calendar day changed
    DateChanged,
    /// Time jumped, or the timezone changed
    SkewDetected,
}

/// Source of "now".
pub trait Clock: Send + Sync {
    fn localtime(&self) -> DateTime;

    fn timezone(&self) -> Tz {
        self.localtime().timezone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClockEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSettings {
    #[serde(with = "duration_str", default = "default_skew_interval")]
    pub skew_interval: Duration,
    #[serde(with = "duration_str", default = "default_skew_slack")]
    pub skew_slack: Duration,
}

fn default_skew_interval() -> Duration {
    DEFAULT_SKEW_INTERVAL
}

fn default_skew_slack() -> Duration {
    DEFAULT_SKEW_SLACK
}

impl Default for ClockSettings {
    fn default() -> Self {
        ClockSettings {
            skew_interval: DEFAULT_SKEW_INTERVAL,
            skew_slack: DEFAULT_SKEW_SLACK,
        }
    }
}

/// Compares successive wall-clock samples taken `interval` apart.
///
/// A sample is skewed when the wall clock moved more than `slack` away
/// from the expected `interval`, in either direction.
#[derive(Debug)]
pub struct SkewDetector {
    interval: chrono::Duration,
    slack: chrono::Duration,
    last: Option<DateTime>,
}

impl SkewDetector {
    pub fn new(interval: Duration, slack: Duration) -> Self {
        SkewDetector {
            interval: chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(10)),
            slack: chrono::Duration::from_std(slack).unwrap_or(chrono::Duration::seconds(2)),
            last: None,
        }
    }

    /// Record a sample; returns whether it is discontinuous with the previous one.
    pub fn sample(&mut self, now: DateTime) -> bool {
        let skewed = match self.last {
            Some(previous) => (previous.until(&now) - self.interval).abs() > self.slack,
            None => false,
        };
        self.last = Some(now);
        skewed
    }
}

/// Where a [`LiveClock`] reads the current UTC time from.
pub type WallTime = Arc<dyn Fn() -> chrono::DateTime<Utc> + Send + Sync>;

struct LiveClockInner {
    tz: RwLock<Tz>,
    wall: WallTime,
    events: broadcast::Sender<ClockEvent>,
    resync: Notify,
}

impl LiveClockInner {
    fn localtime(&self) -> DateTime {
        let tz = *self.tz.read().unwrap_or_else(PoisonError::into_inner);
        DateTime::from_utc((self.wall)(), tz)
    }

    fn emit(&self, event: ClockEvent) {
        let _ = self.events.send(event);
    }

    fn skewed(&self) {
        self.emit(ClockEvent::SkewDetected);
        self.resync.notify_one();
    }
}

/// The system wall clock.
///
/// Runs two background tasks: a ticker aligned to the top of every minute
/// and a sampler that watches for jumps. Must be created inside a tokio
/// runtime; both tasks stop when the clock is dropped.
pub struct LiveClock {
    inner: Arc<LiveClockInner>,
    shutdown: CancellationToken,
}

impl LiveClock {
    pub fn new(tz: Tz, settings: ClockSettings) -> Self {
        Self::with_wall_time(tz, settings, Arc::new(Utc::now))
    }

    /// A live clock reading `wall` instead of the system time.
    pub fn with_wall_time(tz: Tz, settings: ClockSettings, wall: WallTime) -> Self {
        let (events, _) = broadcast::channel(32);
        let inner = Arc::new(LiveClockInner {
            tz: RwLock::new(tz),
            wall,
            events,
            resync: Notify::new(),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(run_minute_ticker(Arc::clone(&inner), shutdown.clone()));
        tokio::spawn(run_skew_sampler(Arc::clone(&inner), settings, shutdown.clone()));

        LiveClock { inner, shutdown }
    }

    /// Switch zones. Reported to subscribers as skew.
    pub fn set_timezone(&self, tz: Tz) {
        let changed = {
            let mut current = self.inner.tz.write().unwrap_or_else(PoisonError::into_inner);
            let changed = *current != tz;
            *current = tz;
            changed
        };
        if changed {
            info!(timezone = %tz, "timezone changed");
            self.inner.skewed();
        }
    }
}

impl Drop for LiveClock {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Clock for LiveClock {
    fn localtime(&self) -> DateTime {
        self.inner.localtime()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.inner.events.subscribe()
    }
}

async fn run_minute_ticker(inner: Arc<LiveClockInner>, shutdown: CancellationToken) {
    // Land just past the boundary so the reading is in the new minute
    const PAST_BOUNDARY: Duration = Duration::from_millis(5);

    let mut last = inner.localtime();
    loop {
        let now = inner.localtime();
        let next_minute = now.start_of_minute().add_minutes(1);
        let wait = now.until(&next_minute).to_std().unwrap_or(Duration::ZERO) + PAST_BOUNDARY;

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = inner.resync.notified() => {
                debug!("minute ticker resynchronizing");
                last = inner.localtime();
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let now = inner.localtime();
        inner.emit(ClockEvent::MinuteChanged);
        if !now.is_same_day(&last) {
            inner.emit(ClockEvent::DateChanged);
        }
        last = now;
    }
}

async fn run_skew_sampler(
    inner: Arc<LiveClockInner>,
    settings: ClockSettings,
    shutdown: CancellationToken,
) {
    let mut detector = SkewDetector::new(settings.skew_interval, settings.skew_slack);
    let mut ticker = tokio::time::interval(settings.skew_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let now = inner.localtime();
        if detector.sample(now) {
            info!(now = %now, "clock skew detected");
            inner.skewed();
        }
    }
}

/// A clock that only moves when told to.
pub struct MockClock {
    now: Mutex<DateTime>,
    events: broadcast::Sender<ClockEvent>,
}

impl MockClock {
    pub fn new(now: DateTime) -> Self {
        let (events, _) = broadcast::channel(256);
        MockClock {
            now: Mutex::new(now),
            events,
        }
    }

    /// Move to `now`, emitting minute and date changes as a running clock
    /// would.
    pub fn set_localtime(&self, now: DateTime) {
        let previous = self.replace(now);
        if !previous.is_same_minute(&now) {
            self.emit(ClockEvent::MinuteChanged);
        }
        if !previous.is_same_day(&now) {
            self.emit(ClockEvent::DateChanged);
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let now = self.localtime().add(by);
        self.set_localtime(now);
    }

    /// Move to `now` discontinuously, as after a resume from suspend.
    pub fn jump_to(&self, now: DateTime) {
        let previous = self.replace(now);
        if !previous.is_same_day(&now) {
            self.emit(ClockEvent::DateChanged);
        }
        self.emit(ClockEvent::SkewDetected);
    }

    /// Move to `now` without telling anyone, as a suspended system would.
    pub fn resume_at(&self, now: DateTime) {
        self.replace(now);
    }

    fn replace(&self, now: DateTime) -> DateTime {
        let mut current = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, now)
    }

    fn emit(&self, event: ClockEvent) {
        let _ = self.events.send(event);
    }
}

impl Clock for MockClock {
    fn localtime(&self) -> DateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.events.subscribe()
    }
}

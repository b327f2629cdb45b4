//! The calendar backend capability.
//!
//! A backend is anything that can answer "which components overlap this
//! window?" and tell us when its answer may have changed. Sources expand
//! their own recurrences: every [`RawComponent`] they return is a single
//! occurrence.

mod memory;

pub use memory::MemorySource;

use std::fmt;

use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::datetime::DateTime;
use crate::window::Window;

/// Opaque, stable identifier of a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: &str) -> Self {
        SourceId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notifications a source pushes to the engine.
///
/// Sources become known to the engine through `Engine::add_source`; this
/// stream carries everything that happens afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    /// Components were added, removed or modified
    Changed,
    /// The source is reachable again
    Enabled,
    /// The source went away temporarily
    Disabled,
    /// The source is gone for good
    Removed,
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Malformed component: {0}")]
    Malformed(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentStatus {
    None,
    Tentative,
    Confirmed,
    Cancelled,
    NeedsAction,
    InProcess,
    Completed,
}

impl ComponentStatus {
    pub fn from_ics_str(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "TENTATIVE" => ComponentStatus::Tentative,
            "CONFIRMED" => ComponentStatus::Confirmed,
            "CANCELLED" => ComponentStatus::Cancelled,
            "NEEDS-ACTION" => ComponentStatus::NeedsAction,
            "IN-PROCESS" => ComponentStatus::InProcess,
            "COMPLETED" => ComponentStatus::Completed,
            _ => ComponentStatus::None,
        }
    }

    /// Cancelled and completed items never make it into the model.
    pub fn is_finished(&self) -> bool {
        matches!(self, ComponentStatus::Cancelled | ComponentStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// The parts of a recurrence rule the engine looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub interval: u32,
}

impl Recurrence {
    pub fn is_daily(&self) -> bool {
        self.frequency == Frequency::Daily && self.interval == 1
    }
}

/// When a reminder fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmTrigger {
    /// Offset from the occurrence start (negative = before)
    Start(Duration),
    /// Offset from the occurrence end
    End(Duration),
    Absolute(DateTime),
}

/// A reminder as the backend describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAlarm {
    pub trigger: AlarmTrigger,
    pub text: Option<String>,
    pub audio_url: Option<String>,
    /// Additional repetitions after the first
    pub repeat: u32,
    pub repeat_interval: Duration,
}

impl RawAlarm {
    pub fn new(trigger: AlarmTrigger) -> Self {
        RawAlarm {
            trigger,
            text: None,
            audio_url: None,
            repeat: 0,
            repeat_interval: Duration::zero(),
        }
    }

    /// Resolve the trigger against one occurrence. `None` when the offset
    /// pushes it out of the representable range.
    pub fn fire_time(&self, begin: &DateTime, end: &DateTime) -> Option<DateTime> {
        match self.trigger {
            AlarmTrigger::Start(offset) => begin.checked_add(offset),
            AlarmTrigger::End(offset) => end.checked_add(offset),
            AlarmTrigger::Absolute(at) => Some(at),
        }
    }

    /// Total span covered by the reminder and its repetitions, or `None`
    /// if it does not fit in a `Duration`.
    pub fn duration(&self) -> Option<Duration> {
        let repeat = i32::try_from(self.repeat).ok()?;
        self.repeat_interval.checked_mul(repeat)
    }
}

/// One occurrence of a backend component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawComponent {
    pub uid: String,
    pub summary: String,
    pub begin: DateTime,
    pub end: DateTime,
    pub status: ComponentStatus,
    pub categories: Vec<String>,
    /// Recurrence rule of the master component, if any
    pub recurrence: Option<Recurrence>,
    pub url: Option<String>,
    pub alarms: Vec<RawAlarm>,
}

impl RawComponent {
    pub fn new(uid: &str, summary: &str, begin: DateTime, end: DateTime) -> Self {
        RawComponent {
            uid: uid.to_string(),
            summary: summary.to_string(),
            begin,
            end,
            status: ComponentStatus::None,
            categories: Vec::new(),
            recurrence: None,
            url: None,
            alarms: Vec::new(),
        }
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories
            .iter()
            .any(|c| c.trim().eq_ignore_ascii_case(category))
    }
}

/// A calendar backend.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    fn id(&self) -> &SourceId;

    /// Color hint applied to every appointment from this source.
    fn color(&self) -> Option<String> {
        None
    }

    /// All occurrences overlapping `window`.
    async fn query(&self, window: &Window) -> Result<Vec<RawComponent>, SourceError>;

    /// Stream of change notifications.
    fn subscribe(&self) -> broadcast::Receiver<SourceEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;

    #[test]
    fn test_status_parsing() {
        assert_eq!(ComponentStatus::from_ics_str("cancelled"), ComponentStatus::Cancelled);
        assert!(ComponentStatus::from_ics_str("COMPLETED").is_finished());
        assert!(!ComponentStatus::from_ics_str("TENTATIVE").is_finished());
        assert_eq!(ComponentStatus::from_ics_str("bogus"), ComponentStatus::None);
    }

    #[test]
    fn test_fire_time_and_duration() {
        let begin = DateTime::new(UTC, 2024, 6, 1, 9, 0, 0).unwrap();
        let end = begin.add_hours(1);

        let before = RawAlarm::new(AlarmTrigger::Start(Duration::minutes(-15)));
        assert_eq!(before.fire_time(&begin, &end), Some(begin.add_minutes(-15)));

        let after_end = RawAlarm {
            repeat: 3,
            repeat_interval: Duration::minutes(5),
            ..RawAlarm::new(AlarmTrigger::End(Duration::zero()))
        };
        assert_eq!(after_end.fire_time(&begin, &end), Some(end));
        assert_eq!(after_end.duration(), Some(Duration::minutes(15)));
    }

    #[test]
    fn test_out_of_range_reminders() {
        let begin = DateTime::new(UTC, 2024, 6, 1, 9, 0, 0).unwrap();

        let runaway = RawAlarm {
            repeat: 2_000_000_000,
            repeat_interval: Duration::days(100_000),
            ..RawAlarm::new(AlarmTrigger::Start(Duration::zero()))
        };
        assert_eq!(runaway.duration(), None);

        let huge_repeat = RawAlarm {
            repeat: u32::MAX,
            repeat_interval: Duration::seconds(1),
            ..RawAlarm::new(AlarmTrigger::Start(Duration::zero()))
        };
        assert_eq!(huge_repeat.duration(), None);

        let far = RawAlarm::new(AlarmTrigger::Start(Duration::days(99_999_999)));
        assert_eq!(far.fire_time(&begin, &begin), None);
    }

    #[test]
    fn test_daily_detection() {
        let daily = Recurrence { frequency: Frequency::Daily, interval: 1 };
        let every_other = Recurrence { frequency: Frequency::Daily, interval: 2 };
        let weekly = Recurrence { frequency: Frequency::Weekly, interval: 1 };
        assert!(daily.is_daily());
        assert!(!every_other.is_daily());
        assert!(!weekly.is_daily());
    }
}

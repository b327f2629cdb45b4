//! Normalized appointment and alarm types.
//!
//! These are the values every consumer sees. Sources hand the engine raw
//! components; the engine turns them into `Appointment`s, which are
//! rebuilt wholesale on every recompute and never mutated in place.

use std::cmp::Ordering;

use chrono::Duration;
use serde::{Serialize, Serializer};

use crate::datetime::DateTime;
use crate::source::SourceId;

/// A single reminder attached to an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alarm {
    /// Display text (may be empty)
    pub text: String,
    /// Sound to play, if any
    pub audio_url: Option<String>,
    /// When the reminder fires
    pub time: DateTime,
    /// How long the reminder window lasts (zero if unspecified)
    #[serde(serialize_with = "serialize_seconds")]
    pub duration: Duration,
}

impl Alarm {
    pub fn at(time: DateTime) -> Self {
        Alarm {
            text: String::new(),
            audio_url: None,
            time,
            duration: Duration::zero(),
        }
    }

    /// Fold another reminder for the same instant into this one.
    ///
    /// The first non-empty text, the first sound and the first non-zero
    /// duration win.
    pub fn merge(&mut self, other: Alarm) {
        if self.text.is_empty() {
            self.text = other.text;
        }
        if self.audio_url.is_none() {
            self.audio_url = other.audio_url;
        }
        if self.duration.is_zero() {
            self.duration = other.duration;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentKind {
    Event,
    UbuntuAlarm,
}

/// A normalized calendar item covering `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Appointment {
    pub uid: String,
    pub summary: String,
    /// Color hint from the owning source
    pub color: Option<String>,
    pub kind: AppointmentKind,
    pub begin: DateTime,
    pub end: DateTime,
    /// Recurs once per day (daily, interval 1)
    pub is_daily: bool,
    /// Deep link that opens the item
    pub activation_url: Option<String>,
    /// Reminders, sorted by time
    pub alarms: Vec<Alarm>,

    // Provenance, used only to break ordering ties
    pub source: SourceId,
    pub source_position: usize,
}

impl Appointment {
    /// An event with no alarms; the remaining fields can be filled in with
    /// struct update syntax.
    pub fn new(source: SourceId, uid: &str, summary: &str, begin: DateTime, end: DateTime) -> Self {
        Appointment {
            uid: uid.to_string(),
            summary: summary.to_string(),
            color: None,
            kind: AppointmentKind::Event,
            begin,
            end,
            is_daily: false,
            activation_url: None,
            alarms: Vec::new(),
            source,
            source_position: 0,
        }
    }

    pub fn is_ubuntu_alarm(&self) -> bool {
        self.kind == AppointmentKind::UbuntuAlarm
    }
}

/// The canonical appointment order: `begin`, then `summary`, then the
/// order the sources reported them in.
pub fn canonical_cmp(a: &Appointment, b: &Appointment) -> Ordering {
    a.begin
        .cmp(&b.begin)
        .then_with(|| a.summary.cmp(&b.summary))
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.source_position.cmp(&b.source_position))
}

/// Sort into canonical order and drop repeated `(uid, begin)` pairs,
/// keeping the first.
pub fn sort_appointments(appointments: &mut Vec<Appointment>) {
    appointments.sort_by(canonical_cmp);

    let mut seen = std::collections::HashSet::new();
    appointments.retain(|a| seen.insert((a.uid.clone(), a.begin)));
}

fn serialize_seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(duration.num_seconds())
}

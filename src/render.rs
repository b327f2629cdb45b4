//! Terminal rendering for alarmd types.
//!
//! Extension traits that add colored output to alarmd-core types using
//! owo_colors.

use alarmd_core::{AlarmReached, Appointment, DateTime};
use owo_colors::OwoColorize;

pub trait Render {
    fn render(&self) -> String;
}

impl Render for Appointment {
    fn render(&self) -> String {
        let time = if self.begin == self.begin.start_of_day() && self.end == self.begin.add_days(1) {
            format!("{:>7}", "all-day")
        } else {
            format!("{:>7}", self.begin.format("%H:%M"))
        };

        let mut line = format!("  {} {}", time, self.summary);
        if self.is_ubuntu_alarm() {
            line.push_str(&format!(" {}", "⏰".yellow()));
        }
        if let Some(alarm) = self.alarms.first() {
            line.push_str(&format!(" {}", format!("(alarm {})", alarm.time.format("%H:%M")).cyan()));
        }
        line.push_str(&format!(" {}", format!("[{}]", self.source).dimmed()));
        line
    }
}

impl Render for AlarmReached {
    fn render(&self) -> String {
        let text = if self.alarm.text.is_empty() {
            &self.appointment.summary
        } else {
            &self.alarm.text
        };

        format!(
            "{} {} {}",
            self.alarm.time.format("%H:%M").bold(),
            text.green(),
            format!("[{}]", self.appointment.source).dimmed()
        )
    }
}

/// A date as a human-readable label (e.g. "Today", "Tomorrow", "Wed Feb 25")
pub fn date_label(dt: &DateTime, today: &DateTime) -> String {
    let diff = (dt.naive_local().date() - today.naive_local().date()).num_days();
    match diff {
        0 => "Today".to_string(),
        1 => "Tomorrow".to_string(),
        _ => dt.format("%a %b %-d"),
    }
}

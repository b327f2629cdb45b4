//! Turning raw backend occurrences into appointments.

use std::collections::BTreeMap;

use chrono_tz::Tz;
use tracing::debug;

use crate::appointment::{Alarm, Appointment, AppointmentKind};
use crate::datetime::DateTime;
use crate::source::{RawAlarm, RawComponent, SourceId};
use crate::window::Window;

/// Category marking a component as a user-facing alarm.
pub const ALARM_CATEGORY: &str = "x-canonical-alarm";
/// Category marking a component as switched off.
pub const DISABLED_CATEGORY: &str = "x-canonical-disabled";

/// Normalize every occurrence one source returned for `window`.
///
/// Components that are malformed, finished or disabled are dropped
/// individually; the rest keep the order the source gave them.
pub fn normalize_components(
    source: &SourceId,
    color: Option<&str>,
    components: Vec<RawComponent>,
    window: &Window,
    tz: Tz,
) -> Vec<Appointment> {
    components
        .into_iter()
        .enumerate()
        .filter_map(|(position, component)| {
            normalize_component(source, color, position, component, window, tz)
        })
        .collect()
}

fn normalize_component(
    source: &SourceId,
    color: Option<&str>,
    position: usize,
    component: RawComponent,
    window: &Window,
    tz: Tz,
) -> Option<Appointment> {
    if component.uid.trim().is_empty() {
        debug!(source = %source, summary = %component.summary, "skipping component without uid");
        return None;
    }
    if component.end < component.begin {
        debug!(source = %source, uid = %component.uid, "skipping component that ends before it begins");
        return None;
    }
    if component.status.is_finished() {
        return None;
    }
    if component.has_category(DISABLED_CATEGORY) {
        return None;
    }

    let kind = if component.has_category(ALARM_CATEGORY) {
        AppointmentKind::UbuntuAlarm
    } else {
        AppointmentKind::Event
    };

    let begin = component.begin.to_timezone(tz);
    let end = component.end.to_timezone(tz);
    let Some(mut alarms) = expand_alarms(&component.alarms, &begin, &end, window, tz) else {
        debug!(source = %source, uid = %component.uid, "skipping component with out-of-range reminder");
        return None;
    };

    if alarms.is_empty() && kind == AppointmentKind::UbuntuAlarm {
        alarms.push(synthesize_alarm(&component.alarms, begin));
    }

    Some(Appointment {
        uid: component.uid,
        summary: component.summary,
        color: color.map(str::to_string),
        kind,
        begin,
        end,
        is_daily: component.recurrence.is_some_and(|r| r.is_daily()),
        activation_url: component.url.filter(|u| !u.is_empty()),
        alarms,
        source: source.clone(),
        source_position: position,
    })
}

/// Resolve reminders against one occurrence, keeping those that fire
/// inside `window`. Reminders landing on the same instant are merged.
/// `None` if any reminder cannot be resolved.
fn expand_alarms(
    raw: &[RawAlarm],
    begin: &DateTime,
    end: &DateTime,
    window: &Window,
    tz: Tz,
) -> Option<Vec<Alarm>> {
    let mut by_time: BTreeMap<DateTime, Alarm> = BTreeMap::new();

    for raw_alarm in raw {
        let time = raw_alarm.fire_time(begin, end)?.to_timezone(tz);
        let duration = raw_alarm.duration()?;
        if !window.contains(&time) {
            continue;
        }
        let alarm = Alarm {
            text: raw_alarm.text.clone().unwrap_or_default(),
            audio_url: raw_alarm.audio_url.clone().filter(|u| !u.is_empty()),
            time,
            duration,
        };
        match by_time.get_mut(&time) {
            Some(existing) => existing.merge(alarm),
            None => {
                by_time.insert(time, alarm);
            }
        }
    }

    Some(by_time.into_values().collect())
}

/// The reminder a user alarm gets when none of its own land in the window.
fn synthesize_alarm(raw: &[RawAlarm], begin: DateTime) -> Alarm {
    let mut alarm = Alarm::at(begin);
    if let Some(first) = raw.first() {
        alarm.text = first.text.clone().unwrap_or_default();
        alarm.audio_url = first.audio_url.clone().filter(|u| !u.is_empty());
    }
    alarm
}

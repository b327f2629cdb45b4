//! RRULE expansion.
//!
//! Expands recurring events into the occurrences overlapping a window,
//! honoring EXDATEs and letting RECURRENCE-ID overrides replace the
//! generated instances they stand for.

use std::collections::{HashMap, HashSet};

use alarmd_core::source::{Frequency, RawComponent, Recurrence};
use alarmd_core::{DateTime, Window};
use chrono::{Duration, Utc};
use rrule::RRuleSet;
use tracing::warn;

use crate::parse::IcsEvent;

/// Upper bound on generated instances per event and query.
const MAX_OCCURRENCES: u16 = 1000;

/// Read FREQ and INTERVAL from an RRULE value.
pub fn parse_recurrence(rrule: &str) -> Option<Recurrence> {
    let mut frequency = None;
    let mut interval = 1;

    for part in rrule.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_uppercase().as_str() {
            "FREQ" => {
                frequency = Some(match value.trim().to_ascii_uppercase().as_str() {
                    "SECONDLY" => Frequency::Secondly,
                    "MINUTELY" => Frequency::Minutely,
                    "HOURLY" => Frequency::Hourly,
                    "DAILY" => Frequency::Daily,
                    "WEEKLY" => Frequency::Weekly,
                    "MONTHLY" => Frequency::Monthly,
                    "YEARLY" => Frequency::Yearly,
                    _ => return None,
                })
            }
            "INTERVAL" => interval = value.trim().parse().ok().filter(|i| *i > 0)?,
            _ => {}
        }
    }

    Some(Recurrence {
        frequency: frequency?,
        interval,
    })
}

/// Build an iCalendar-format rule set for the rrule crate parser.
///
/// DTSTART and EXDATEs are written in the event's own zone so the rule
/// keeps its wall-clock time across DST changes.
fn build_rrule_string(master: &IcsEvent, rrule: &str) -> String {
    let tz = master.begin.timezone();
    let mut lines = vec![
        format!(
            "DTSTART;TZID={}:{}",
            tz.name(),
            master.begin.format("%Y%m%dT%H%M%S")
        ),
        format!("RRULE:{}", rrule),
    ];

    for exdate in &master.exdates {
        lines.push(format!(
            "EXDATE;TZID={}:{}",
            tz.name(),
            exdate.to_timezone(tz).format("%Y%m%dT%H%M%S")
        ));
    }

    lines.join("\n")
}

/// Occurrence `(begin, end)` pairs of `master` overlapping `window`.
pub fn expand(master: &IcsEvent, rrule: &str, window: &Window) -> Result<Vec<(DateTime, DateTime)>, String> {
    let rrule_set: RRuleSet = build_rrule_string(master, rrule)
        .parse()
        .map_err(|e| format!("Failed to parse RRULE for '{}': {}", master.uid, e))?;

    let span = master.begin.until(&master.end);
    let day_span = (master.end.naive_local().date() - master.begin.naive_local().date()).num_days();

    // Widen by the event length so occurrences that started before the
    // window but still run into it are generated too
    let tz: rrule::Tz = Utc.into();
    let after = window
        .begin()
        .to_utc()
        .checked_sub_signed(span + Duration::seconds(1))
        .ok_or_else(|| format!("Event '{}' is too long to expand", master.uid))?
        .with_timezone(&tz);
    let before = window
        .end()
        .to_utc()
        .checked_add_signed(Duration::seconds(1))
        .ok_or_else(|| format!("Window end out of range for '{}'", master.uid))?
        .with_timezone(&tz);

    let result = rrule_set.after(after).before(before).all(MAX_OCCURRENCES);
    if result.limited {
        warn!(uid = %master.uid, "recurrence expansion hit the occurrence limit");
    }

    let zone = master.begin.timezone();
    Ok(result
        .dates
        .iter()
        .filter_map(|occ| {
            let begin = DateTime::from_utc(occ.with_timezone(&Utc), zone);
            let end = if master.all_day {
                begin.checked_add_days(day_span)?
            } else {
                begin.checked_add(span)?
            };
            Some((begin, end))
        })
        .filter(|(begin, end)| window.overlaps(begin, end))
        .collect())
}

/// Turn parsed events into the occurrences overlapping `window`.
pub fn occurrences_in(events: &[IcsEvent], window: &Window) -> Vec<RawComponent> {
    let overridden: HashSet<(&str, DateTime)> = events
        .iter()
        .filter_map(|e| e.recurrence_id.map(|rid| (e.uid.as_str(), rid)))
        .collect();
    let master_rules: HashMap<&str, Option<Recurrence>> = events
        .iter()
        .filter(|e| e.recurrence_id.is_none())
        .filter_map(|e| e.rrule.as_deref().map(|r| (e.uid.as_str(), parse_recurrence(r))))
        .collect();

    let mut components = Vec::new();
    for event in events {
        if event.recurrence_id.is_some() {
            if window.overlaps(&event.begin, &event.end) {
                let recurrence = master_rules.get(event.uid.as_str()).copied().flatten();
                components.push(to_component(event, event.begin, event.end, recurrence));
            }
            continue;
        }

        let Some(rrule) = &event.rrule else {
            if window.overlaps(&event.begin, &event.end) {
                components.push(to_component(event, event.begin, event.end, None));
            }
            continue;
        };

        match expand(event, rrule, window) {
            Ok(instances) => {
                let recurrence = parse_recurrence(rrule);
                for (begin, end) in instances {
                    if overridden.contains(&(event.uid.as_str(), begin)) {
                        continue;
                    }
                    components.push(to_component(event, begin, end, recurrence));
                }
            }
            Err(e) => warn!(uid = %event.uid, error = %e, "skipping unexpandable recurrence"),
        }
    }

    components
}

fn to_component(
    event: &IcsEvent,
    begin: DateTime,
    end: DateTime,
    recurrence: Option<Recurrence>,
) -> RawComponent {
    RawComponent {
        status: event.status,
        categories: event.categories.clone(),
        recurrence,
        url: event.url.clone(),
        alarms: event.alarms.clone(),
        ..RawComponent::new(&event.uid, &event.summary, begin, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_calendar;
    use chrono_tz::{Europe::Berlin, UTC};

    fn events(body: &str) -> Vec<IcsEvent> {
        let ics = format!("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:TEST\r\n{body}END:VCALENDAR\r\n");
        parse_calendar(&ics, Berlin).expect("Should parse")
    }

    fn berlin(mo: u32, d: u32, h: u32, mi: u32) -> DateTime {
        DateTime::new(Berlin, 2024, mo, d, h, mi, 0).unwrap()
    }

    fn window(from: DateTime, to: DateTime) -> Window {
        Window::new(from, to).unwrap()
    }

    #[test]
    fn test_parse_recurrence() {
        assert_eq!(
            parse_recurrence("FREQ=DAILY"),
            Some(Recurrence { frequency: Frequency::Daily, interval: 1 })
        );
        assert!(parse_recurrence("FREQ=DAILY;INTERVAL=1").unwrap().is_daily());
        assert!(!parse_recurrence("FREQ=DAILY;INTERVAL=2").unwrap().is_daily());
        assert_eq!(
            parse_recurrence("INTERVAL=3;FREQ=weekly;BYDAY=MO"),
            Some(Recurrence { frequency: Frequency::Weekly, interval: 3 })
        );
        assert_eq!(parse_recurrence("INTERVAL=2"), None);
        assert_eq!(parse_recurrence("FREQ=SOMETIMES"), None);
    }

    #[test]
    fn test_daily_expansion_keeps_wall_clock_across_dst() {
        let parsed = events(
            "BEGIN:VEVENT\r\n\
UID:wake\r\n\
SUMMARY:Wake up\r\n\
DTSTART;TZID=Europe/Berlin:20240329T070000\r\n\
DTEND;TZID=Europe/Berlin:20240329T071500\r\n\
RRULE:FREQ=DAILY\r\n\
END:VEVENT\r\n",
        );

        let found = occurrences_in(&parsed, &window(berlin(3, 29, 0, 0), berlin(4, 2, 0, 0)));
        let begins: Vec<DateTime> = found.iter().map(|c| c.begin).collect();
        assert_eq!(
            begins,
            vec![berlin(3, 29, 7, 0), berlin(3, 30, 7, 0), berlin(3, 31, 7, 0), berlin(4, 1, 7, 0)]
        );
        assert!(found.iter().all(|c| c.recurrence.is_some_and(|r| r.is_daily())));
        assert_eq!(found[2].end, berlin(3, 31, 7, 15));
    }

    #[test]
    fn test_exdates_and_overrides() {
        let parsed = events(
            "BEGIN:VEVENT\r\n\
UID:standup\r\n\
SUMMARY:Standup\r\n\
DTSTART;TZID=Europe/Berlin:20240603T090000\r\n\
DTEND;TZID=Europe/Berlin:20240603T091500\r\n\
RRULE:FREQ=DAILY;COUNT=5\r\n\
EXDATE;TZID=Europe/Berlin:20240604T090000\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:standup\r\n\
SUMMARY:Standup (moved)\r\n\
RECURRENCE-ID;TZID=Europe/Berlin:20240605T090000\r\n\
DTSTART;TZID=Europe/Berlin:20240605T110000\r\n\
DTEND;TZID=Europe/Berlin:20240605T111500\r\n\
END:VEVENT\r\n",
        );

        let found = occurrences_in(&parsed, &window(berlin(6, 1, 0, 0), berlin(7, 1, 0, 0)));
        let summary: Vec<(DateTime, &str)> = found.iter().map(|c| (c.begin, c.summary.as_str())).collect();
        assert_eq!(summary.len(), 4);
        assert!(summary.contains(&(berlin(6, 3, 9, 0), "Standup")));
        assert!(!summary.iter().any(|(b, _)| *b == berlin(6, 4, 9, 0)));
        assert!(!summary.iter().any(|(b, _)| *b == berlin(6, 5, 9, 0)));
        assert!(summary.contains(&(berlin(6, 5, 11, 0), "Standup (moved)")));
        assert!(summary.contains(&(berlin(6, 7, 9, 0), "Standup")));
    }

    #[test]
    fn test_occurrence_running_into_window_is_included() {
        let parsed = events(
            "BEGIN:VEVENT\r\n\
UID:night\r\n\
DTSTART:20240603T220000Z\r\n\
DTEND:20240604T020000Z\r\n\
RRULE:FREQ=DAILY\r\n\
END:VEVENT\r\n",
        );
        let utc = |d, h| DateTime::new(UTC, 2024, 6, d, h, 0, 0).unwrap();

        let found = occurrences_in(&parsed, &window(utc(4, 0), utc(4, 12)));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].begin, utc(3, 22));
    }

    #[test]
    fn test_non_recurring_outside_window_is_dropped() {
        let parsed = events(
            "BEGIN:VEVENT\r\nUID:once\r\nDTSTART:20240603T100000Z\r\nDTEND:20240603T110000Z\r\nEND:VEVENT\r\n",
        );
        assert!(occurrences_in(&parsed, &window(berlin(7, 1, 0, 0), berlin(8, 1, 0, 0))).is_empty());
        assert_eq!(occurrences_in(&parsed, &window(berlin(6, 1, 0, 0), berlin(7, 1, 0, 0))).len(), 1);
    }
}

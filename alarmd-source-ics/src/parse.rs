//! .ics parsing using the icalendar crate's parser.

use alarmd_core::DateTime;
use alarmd_core::source::{AlarmTrigger, ComponentStatus, RawAlarm};
use chrono::{Duration, NaiveDateTime, NaiveTime};
use chrono_tz::Tz;
use icalendar::{
    CalendarDateTime, DatePerhapsTime,
    parser::{Component, Property, read_calendar, unfold},
};
use tracing::debug;

/// A VEVENT with every time resolved to an instant.
#[derive(Debug, Clone, PartialEq)]
pub struct IcsEvent {
    pub uid: String,
    pub summary: String,
    pub begin: DateTime,
    pub end: DateTime,
    /// DTSTART was a plain date
    pub all_day: bool,
    pub status: ComponentStatus,
    pub categories: Vec<String>,
    pub url: Option<String>,
    pub rrule: Option<String>,
    pub exdates: Vec<DateTime>,
    pub recurrence_id: Option<DateTime>,
    pub alarms: Vec<RawAlarm>,
}

/// Parse every VEVENT in `content`.
///
/// Dates and floating times are placed in `default_tz`. Events without a
/// UID or DTSTART, or whose end cannot be represented, are skipped.
pub fn parse_calendar(content: &str, default_tz: Tz) -> Result<Vec<IcsEvent>, String> {
    let unfolded = unfold(content);
    let calendar = read_calendar(&unfolded).map_err(|e| e.to_string())?;

    Ok(calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .filter_map(|vevent| {
            let event = parse_event(vevent, default_tz);
            if event.is_none() {
                debug!("skipping VEVENT without UID, DTSTART or a representable end");
            }
            event
        })
        .collect())
}

fn parse_event(vevent: &Component, default_tz: Tz) -> Option<IcsEvent> {
    let uid = vevent.find_prop("UID")?.val.to_string();
    let summary = vevent
        .find_prop("SUMMARY")
        .map(|p| unescape_text(p.val.as_ref()))
        .unwrap_or_default();

    let (begin, all_day) = resolve(
        DatePerhapsTime::try_from(vevent.find_prop("DTSTART")?).ok()?,
        default_tz,
    )?;

    let dtend = vevent
        .find_prop("DTEND")
        .and_then(|p| DatePerhapsTime::try_from(p).ok())
        .and_then(|dpt| resolve(dpt, default_tz))
        .map(|(end, _)| end);
    let duration = vevent
        .find_prop("DURATION")
        .and_then(|p| parse_duration(p.val.as_ref()));
    let end = match (dtend, duration) {
        (Some(end), _) => end,
        (None, Some(duration)) => begin.checked_add(duration)?,
        (None, None) if all_day => begin.checked_add_days(1)?,
        (None, None) => begin,
    };

    let status = vevent
        .find_prop("STATUS")
        .map(|p| ComponentStatus::from_ics_str(p.val.as_ref()))
        .unwrap_or(ComponentStatus::None);

    let categories: Vec<String> = vevent
        .properties
        .iter()
        .filter(|p| p.name == "CATEGORIES")
        .flat_map(|p| {
            p.val
                .as_ref()
                .split(',')
                .map(|c| unescape_text(c.trim()))
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
        })
        .collect();

    let url = vevent
        .find_prop("URL")
        .map(|p| p.val.to_string())
        .filter(|u| !u.is_empty());

    let rrule = vevent.find_prop("RRULE").map(|p| p.val.to_string());
    let exdates: Vec<DateTime> = vevent
        .properties
        .iter()
        .filter(|p| p.name == "EXDATE")
        .flat_map(|p| parse_exdate_property(p, default_tz))
        .collect();

    let recurrence_id = vevent
        .find_prop("RECURRENCE-ID")
        .and_then(|p| DatePerhapsTime::try_from(p).ok())
        .and_then(|dpt| resolve(dpt, default_tz))
        .map(|(at, _)| at);

    let alarms: Vec<RawAlarm> = vevent
        .components
        .iter()
        .filter(|c| c.name == "VALARM")
        .filter_map(|valarm| parse_alarm(valarm, default_tz))
        .filter(|alarm| {
            let usable = alarm.duration().is_some() && alarm.fire_time(&begin, &end).is_some();
            if !usable {
                debug!(uid = %uid, "skipping VALARM that lands out of range");
            }
            usable
        })
        .collect();

    Some(IcsEvent {
        uid,
        summary,
        begin,
        end,
        all_day,
        status,
        categories,
        url,
        rrule,
        exdates,
        recurrence_id,
        alarms,
    })
}

/// Resolve an ICS time to an instant. The flag is set for plain dates.
///
/// UTC times stay in UTC so recurrences expand in UTC. Unknown TZIDs fall
/// back to `default_tz`.
fn resolve(dpt: DatePerhapsTime, default_tz: Tz) -> Option<(DateTime, bool)> {
    match dpt {
        DatePerhapsTime::Date(d) => {
            let midnight = DateTime::from_local(default_tz, d.and_time(NaiveTime::MIN)).ok()?;
            Some((midnight, true))
        }
        DatePerhapsTime::DateTime(cal_dt) => {
            let at = match cal_dt {
                CalendarDateTime::Utc(dt) => DateTime::from_utc(dt, chrono_tz::UTC),
                CalendarDateTime::Floating(naive) => DateTime::from_local(default_tz, naive).ok()?,
                CalendarDateTime::WithTimezone { date_time, tzid } => {
                    DateTime::from_local(zone_or(&tzid, default_tz), date_time).ok()?
                }
            };
            Some((at, false))
        }
    }
}

fn zone_or(tzid: &str, default_tz: Tz) -> Tz {
    tzid.parse().unwrap_or_else(|_| {
        debug!(tzid, "unknown TZID, using default timezone");
        default_tz
    })
}

/// Parse an EXDATE property, which may carry several comma-separated
/// values sharing one TZID or VALUE=DATE parameter.
fn parse_exdate_property(prop: &Property, default_tz: Tz) -> Vec<DateTime> {
    let tz = param(prop, "TZID").map(|tzid| zone_or(tzid, default_tz));
    let is_date = param(prop, "VALUE") == Some("DATE");

    prop.val
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if is_date {
                let date = chrono::NaiveDate::parse_from_str(s, "%Y%m%d").ok()?;
                DateTime::from_local(default_tz, date.and_time(NaiveTime::MIN)).ok()
            } else if let Some(stripped) = s.strip_suffix('Z') {
                let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
                Some(DateTime::from_utc(naive.and_utc(), chrono_tz::UTC))
            } else {
                let naive = NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S").ok()?;
                DateTime::from_local(tz.unwrap_or(default_tz), naive).ok()
            }
        })
        .collect()
}

fn parse_alarm(valarm: &Component, default_tz: Tz) -> Option<RawAlarm> {
    let mut alarm = RawAlarm::new(parse_trigger(valarm.find_prop("TRIGGER")?, default_tz)?);

    alarm.text = valarm
        .find_prop("DESCRIPTION")
        .map(|p| unescape_text(p.val.as_ref()))
        .filter(|t| !t.is_empty());
    alarm.audio_url = valarm
        .find_prop("ATTACH")
        .map(|p| p.val.to_string())
        .filter(|a| !a.is_empty());

    let repeat = valarm
        .find_prop("REPEAT")
        .and_then(|p| p.val.as_ref().trim().parse::<u32>().ok())
        .unwrap_or(0);
    let interval = valarm
        .find_prop("DURATION")
        .and_then(|p| parse_duration(p.val.as_ref()))
        .filter(|d| *d > Duration::zero());

    // REPEAT means nothing without an interval
    if let Some(interval) = interval {
        alarm.repeat = repeat;
        alarm.repeat_interval = interval;
    }

    Some(alarm)
}

/// TRIGGER is either a signed duration relative to the start (or the end,
/// with RELATED=END) or an absolute UTC time with VALUE=DATE-TIME.
fn parse_trigger(prop: &Property, default_tz: Tz) -> Option<AlarmTrigger> {
    let value = prop.val.as_ref().trim();

    if param(prop, "VALUE") == Some("DATE-TIME") {
        let naive = NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y%m%dT%H%M%S").ok()?;
        let at = if value.ends_with('Z') {
            DateTime::from_utc(naive.and_utc(), default_tz)
        } else {
            DateTime::from_local(default_tz, naive).ok()?
        };
        return Some(AlarmTrigger::Absolute(at));
    }

    let offset = parse_duration(value)?;
    if param(prop, "RELATED") == Some("END") {
        Some(AlarmTrigger::End(offset))
    } else {
        Some(AlarmTrigger::Start(offset))
    }
}

/// Parse a signed ISO 8601 duration (-PT15M, +P1D, PT0S).
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, unsigned) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.trim_start_matches('+')),
    };

    let duration: std::time::Duration = iso8601::duration(unsigned).ok()?.into();
    let duration = Duration::from_std(duration).ok()?;
    Some(if negative { -duration } else { duration })
}

fn param<'a>(prop: &'a Property, key: &str) -> Option<&'a str> {
    prop.params
        .iter()
        .find(|p| p.key.as_ref() == key)
        .and_then(|p| p.val.as_ref())
        .map(|v| v.as_ref())
}

/// Undo TEXT escaping (\n, \, \; \\).
fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::{America::New_York, Europe::Berlin, UTC};

    fn wrap(body: &str) -> String {
        format!("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:TEST\r\n{body}END:VCALENDAR\r\n")
    }

    fn parse_one(body: &str) -> IcsEvent {
        let mut events = parse_calendar(&wrap(body), Berlin).expect("Should parse");
        assert_eq!(events.len(), 1);
        events.remove(0)
    }

    #[test]
    fn test_parse_basic_event() {
        let event = parse_one(
            "BEGIN:VEVENT\r\n\
UID:basic-1\r\n\
SUMMARY:Standup\\, daily\r\n\
DTSTART:20240603T070000Z\r\n\
DTEND:20240603T071500Z\r\n\
STATUS:CONFIRMED\r\n\
CATEGORIES:Work,x-canonical-alarm\r\n\
URL:https://example.com/standup\r\n\
END:VEVENT\r\n",
        );

        assert_eq!(event.uid, "basic-1");
        assert_eq!(event.summary, "Standup, daily");
        assert_eq!(event.begin, DateTime::new(UTC, 2024, 6, 3, 7, 0, 0).unwrap());
        assert_eq!(event.end, DateTime::new(UTC, 2024, 6, 3, 7, 15, 0).unwrap());
        assert!(!event.all_day);
        assert_eq!(event.status, ComponentStatus::Confirmed);
        assert_eq!(event.categories, vec!["Work", "x-canonical-alarm"]);
        assert_eq!(event.url.as_deref(), Some("https://example.com/standup"));
        assert!(event.rrule.is_none());
    }

    #[test]
    fn test_missing_uid_is_skipped() {
        let events = parse_calendar(
            &wrap("BEGIN:VEVENT\r\nSUMMARY:No uid\r\nDTSTART:20240603T070000Z\r\nEND:VEVENT\r\n"),
            UTC,
        )
        .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_zoned_floating_and_all_day_times() {
        let zoned = parse_one(
            "BEGIN:VEVENT\r\nUID:z\r\nDTSTART;TZID=America/New_York:20240603T090000\r\nDURATION:PT30M\r\nEND:VEVENT\r\n",
        );
        assert_eq!(zoned.begin, DateTime::new(New_York, 2024, 6, 3, 9, 0, 0).unwrap());
        assert_eq!(zoned.end, DateTime::new(New_York, 2024, 6, 3, 9, 30, 0).unwrap());

        let floating = parse_one("BEGIN:VEVENT\r\nUID:f\r\nDTSTART:20240603T090000\r\nEND:VEVENT\r\n");
        assert_eq!(floating.begin, DateTime::new(Berlin, 2024, 6, 3, 9, 0, 0).unwrap());
        assert_eq!(floating.end, floating.begin);

        let all_day = parse_one("BEGIN:VEVENT\r\nUID:d\r\nDTSTART;VALUE=DATE:20240603\r\nEND:VEVENT\r\n");
        assert!(all_day.all_day);
        assert_eq!(all_day.begin, DateTime::new(Berlin, 2024, 6, 3, 0, 0, 0).unwrap());
        assert_eq!(all_day.end, DateTime::new(Berlin, 2024, 6, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_valarms() {
        let event = parse_one(
            "BEGIN:VEVENT\r\n\
UID:alarms\r\n\
SUMMARY:Dentist\r\n\
DTSTART:20240603T100000Z\r\n\
DTEND:20240603T110000Z\r\n\
BEGIN:VALARM\r\n\
ACTION:DISPLAY\r\n\
TRIGGER:-PT15M\r\n\
DESCRIPTION:Leave now\r\n\
REPEAT:2\r\n\
DURATION:PT5M\r\n\
END:VALARM\r\n\
BEGIN:VALARM\r\n\
ACTION:AUDIO\r\n\
TRIGGER;RELATED=END:PT0S\r\n\
ATTACH:file:///usr/share/sounds/bell.ogg\r\n\
END:VALARM\r\n\
BEGIN:VALARM\r\n\
ACTION:DISPLAY\r\n\
TRIGGER;VALUE=DATE-TIME:20240602T180000Z\r\n\
END:VALARM\r\n\
END:VEVENT\r\n",
        );

        assert_eq!(event.alarms.len(), 3);

        let before = &event.alarms[0];
        assert_eq!(before.trigger, AlarmTrigger::Start(Duration::minutes(-15)));
        assert_eq!(before.text.as_deref(), Some("Leave now"));
        assert_eq!(before.repeat, 2);
        assert_eq!(before.duration(), Some(Duration::minutes(10)));

        let at_end = &event.alarms[1];
        assert_eq!(at_end.trigger, AlarmTrigger::End(Duration::zero()));
        assert_eq!(at_end.audio_url.as_deref(), Some("file:///usr/share/sounds/bell.ogg"));

        assert_eq!(
            event.alarms[2].trigger,
            AlarmTrigger::Absolute(DateTime::new(UTC, 2024, 6, 2, 18, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_out_of_range_values_are_dropped() {
        let events = parse_calendar(
            &wrap(
                "BEGIN:VEVENT\r\n\
UID:endless\r\n\
DTSTART:20240603T100000Z\r\n\
DURATION:P99999999D\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:nagging\r\n\
DTSTART:20240603T100000Z\r\n\
BEGIN:VALARM\r\n\
TRIGGER:-PT5M\r\n\
REPEAT:2000000000\r\n\
DURATION:P100000D\r\n\
END:VALARM\r\n\
BEGIN:VALARM\r\n\
TRIGGER:P99999999D\r\n\
END:VALARM\r\n\
BEGIN:VALARM\r\n\
TRIGGER:-PT10M\r\n\
END:VALARM\r\n\
END:VEVENT\r\n",
            ),
            UTC,
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uid, "nagging");
        assert_eq!(events[0].alarms.len(), 1);
        assert_eq!(events[0].alarms[0].trigger, AlarmTrigger::Start(Duration::minutes(-10)));
    }

    #[test]
    fn test_parse_exdate_with_tzid() {
        let event = parse_one(
            "BEGIN:VEVENT\r\n\
UID:weekly\r\n\
DTSTART;TZID=America/New_York:20240101T100000\r\n\
RRULE:FREQ=WEEKLY;BYDAY=MO\r\n\
EXDATE;TZID=America/New_York:20240108T100000,20240115T100000\r\n\
EXDATE:20240122T150000Z\r\n\
END:VEVENT\r\n",
        );

        assert_eq!(event.rrule.as_deref(), Some("FREQ=WEEKLY;BYDAY=MO"));
        assert_eq!(
            event.exdates,
            vec![
                DateTime::new(New_York, 2024, 1, 8, 10, 0, 0).unwrap(),
                DateTime::new(New_York, 2024, 1, 15, 10, 0, 0).unwrap(),
                DateTime::new(New_York, 2024, 1, 22, 10, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_line_folding_preserves_whitespace() {
        let event = parse_one(
            "BEGIN:VEVENT\r\n\
UID:folded\r\n\
SUMMARY:Hello \r\n world and \r\n more text\r\n\
DTSTART:20240101T100000Z\r\n\
END:VEVENT\r\n",
        );
        assert_eq!(event.summary, "Hello world and more text");
    }

    #[test]
    fn test_signed_durations() {
        assert_eq!(parse_duration("-PT15M"), Some(Duration::minutes(-15)));
        assert_eq!(parse_duration("+P1D"), Some(Duration::days(1)));
        assert_eq!(parse_duration("PT0S"), Some(Duration::zero()));
        assert_eq!(parse_duration("soon"), None);
    }
}

//! Timezone-aware instants.
//!
//! [`DateTime`] wraps a `chrono::DateTime<Tz>`. The attached zone only
//! affects calendar arithmetic and formatting: equality, ordering and
//! hashing all compare the underlying instant, so the same moment seen
//! from two zones is the same `DateTime`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{Datelike, Duration, Months, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Serialize, Serializer};

use crate::error::{AlarmError, AlarmResult};

#[derive(Clone, Copy, Debug)]
pub struct DateTime(chrono::DateTime<Tz>);

impl DateTime {
    pub fn new(
        tz: Tz,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> AlarmResult<Self> {
        let date = chrono::NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
            AlarmError::InvalidTime(format!("{year:04}-{month:02}-{day:02}"))
        })?;
        let time = NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(|| {
            AlarmError::InvalidTime(format!("{hour:02}:{minute:02}:{second:02}"))
        })?;
        Self::from_local(tz, date.and_time(time))
    }

    /// Current wall-clock time, viewed from `tz`.
    pub fn now(tz: Tz) -> Self {
        DateTime(Utc::now().with_timezone(&tz))
    }

    pub fn from_utc(dt: chrono::DateTime<Utc>, tz: Tz) -> Self {
        DateTime(dt.with_timezone(&tz))
    }

    /// Interpret a wall-clock reading in `tz`.
    ///
    /// Readings that fall in a DST gap move forward by an hour; readings
    /// that occur twice resolve to the earlier instant.
    pub fn from_local(tz: Tz, naive: NaiveDateTime) -> AlarmResult<Self> {
        localize(tz, naive)
            .map(DateTime)
            .ok_or_else(|| AlarmError::InvalidTime(format!("{naive} in {tz}")))
    }

    pub fn timezone(&self) -> Tz {
        self.0.timezone()
    }

    pub fn to_timezone(&self, tz: Tz) -> Self {
        DateTime(self.0.with_timezone(&tz))
    }

    pub fn to_utc(&self) -> chrono::DateTime<Utc> {
        self.0.with_timezone(&Utc)
    }

    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    pub fn naive_local(&self) -> NaiveDateTime {
        self.0.naive_local()
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn day(&self) -> u32 {
        self.0.day()
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    pub fn second(&self) -> u32 {
        self.0.second()
    }

    /// Move by whole calendar days, keeping the wall-clock time. `None`
    /// when the result leaves the representable range.
    pub fn checked_add_days(&self, days: i64) -> Option<Self> {
        let naive = self
            .0
            .naive_local()
            .checked_add_signed(Duration::try_days(days)?)?;
        self.checked_shift_local(naive)
    }

    /// Add an absolute duration. `None` when the result leaves the
    /// representable range.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        self.0.checked_add_signed(duration).map(DateTime)
    }

    /// Like [`checked_add_days`](Self::checked_add_days), saturating at
    /// the ends of the representable range.
    pub fn add_days(&self, days: i64) -> Self {
        self.checked_add_days(days)
            .unwrap_or_else(|| self.saturated(days >= 0))
    }

    /// Move by whole calendar months. The day is clamped to the length of
    /// the target month.
    pub fn add_months(&self, months: i32) -> Self {
        let naive = self.0.naive_local();
        let shifted = if months >= 0 {
            naive.checked_add_months(Months::new(months.unsigned_abs()))
        } else {
            naive.checked_sub_months(Months::new(months.unsigned_abs()))
        };
        shifted
            .and_then(|n| self.checked_shift_local(n))
            .unwrap_or_else(|| self.saturated(months >= 0))
    }

    pub fn add_hours(&self, hours: i64) -> Self {
        self.add_delta(Duration::try_hours(hours), hours >= 0)
    }

    pub fn add_minutes(&self, minutes: i64) -> Self {
        self.add_delta(Duration::try_minutes(minutes), minutes >= 0)
    }

    pub fn add_seconds(&self, seconds: i64) -> Self {
        self.add_delta(Duration::try_seconds(seconds), seconds >= 0)
    }

    /// Add an absolute duration, saturating at the ends of the
    /// representable range.
    pub fn add(&self, duration: Duration) -> Self {
        self.add_delta(Some(duration), duration >= Duration::zero())
    }

    fn add_delta(&self, delta: Option<Duration>, forward: bool) -> Self {
        delta
            .and_then(|d| self.checked_add(d))
            .unwrap_or_else(|| self.saturated(forward))
    }

    fn saturated(&self, forward: bool) -> Self {
        let bound = if forward {
            chrono::DateTime::<Utc>::MAX_UTC
        } else {
            chrono::DateTime::<Utc>::MIN_UTC
        };
        DateTime(bound.with_timezone(&self.timezone()))
    }

    /// Signed duration from `self` to `later`.
    pub fn until(&self, later: &DateTime) -> Duration {
        later.0.signed_duration_since(self.0)
    }

    pub fn start_of_minute(&self) -> Self {
        let secs = self.0.timestamp().div_euclid(60) * 60;
        match chrono::DateTime::<Utc>::from_timestamp(secs, 0) {
            Some(dt) => DateTime(dt.with_timezone(&self.timezone())),
            None => *self,
        }
    }

    pub fn start_of_day(&self) -> Self {
        self.shift_local(self.0.date_naive().and_time(NaiveTime::MIN))
    }

    /// Last second of the day.
    pub fn end_of_day(&self) -> Self {
        self.start_of_day().add_days(1).add_seconds(-1)
    }

    pub fn start_of_month(&self) -> Self {
        let date = self.0.date_naive();
        let first = date.with_day(1).unwrap_or(date);
        self.shift_local(first.and_time(NaiveTime::MIN))
    }

    /// Last second of the month.
    pub fn end_of_month(&self) -> Self {
        self.start_of_month().add_months(1).add_seconds(-1)
    }

    /// Whether both instants fall on the same calendar day in `self`'s zone.
    pub fn is_same_day(&self, other: &DateTime) -> bool {
        self.0.date_naive() == other.0.with_timezone(&self.timezone()).date_naive()
    }

    pub fn is_same_minute(&self, other: &DateTime) -> bool {
        self.minute_index() == other.minute_index()
    }

    /// Minutes since the epoch, used as a zone-independent minute key.
    pub fn minute_index(&self) -> i64 {
        self.0.timestamp().div_euclid(60)
    }

    /// strftime-style formatting in the attached zone.
    pub fn format(&self, fmt: &str) -> String {
        self.0.format(fmt).to_string()
    }

    fn shift_local(&self, naive: NaiveDateTime) -> Self {
        self.checked_shift_local(naive).unwrap_or(*self)
    }

    fn checked_shift_local(&self, naive: NaiveDateTime) -> Option<Self> {
        match localize(self.timezone(), naive) {
            Some(dt) => Some(DateTime(dt)),
            None => self
                .0
                .checked_add_signed(naive.signed_duration_since(self.0.naive_local()))
                .map(DateTime),
        }
    }
}

fn localize(tz: Tz, naive: NaiveDateTime) -> Option<chrono::DateTime<Tz>> {
    tz.from_local_datetime(&naive).earliest().or_else(|| {
        let later = naive.checked_add_signed(Duration::hours(1))?;
        tz.from_local_datetime(&later).earliest()
    })
}

impl PartialEq for DateTime {
    fn eq(&self, other: &Self) -> bool {
        self.to_utc() == other.to_utc()
    }
}

impl Eq for DateTime {}

impl PartialOrd for DateTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DateTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_utc().cmp(&other.to_utc())
    }
}

impl Hash for DateTime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_utc().hash(state);
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Serialize for DateTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

//! Half-open time windows.

use std::fmt;

use serde::Serialize;

use crate::datetime::DateTime;
use crate::error::{AlarmError, AlarmResult};

/// A `[begin, end)` range. `begin` is always strictly before `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    begin: DateTime,
    end: DateTime,
}

impl Window {
    pub fn new(begin: DateTime, end: DateTime) -> AlarmResult<Self> {
        if begin >= end {
            return Err(AlarmError::InvalidRange { begin, end });
        }
        Ok(Window { begin, end })
    }

    /// The calendar month containing `dt`.
    pub fn month_of(dt: &DateTime) -> Self {
        let begin = dt.start_of_month();
        Window {
            begin,
            end: begin.add_months(1),
        }
    }

    /// From the start of `dt`'s day through the next `days` days. Fails
    /// when the end cannot be represented.
    pub fn upcoming(dt: &DateTime, days: u32) -> AlarmResult<Self> {
        let begin = dt.start_of_day();
        let end = begin
            .checked_add_days(i64::from(days.max(1)))
            .ok_or_else(|| AlarmError::InvalidTime(format!("{begin} plus {days} days")))?;
        Ok(Window { begin, end })
    }

    pub fn begin(&self) -> &DateTime {
        &self.begin
    }

    pub fn end(&self) -> &DateTime {
        &self.end
    }

    pub fn contains(&self, dt: &DateTime) -> bool {
        self.begin <= *dt && *dt < self.end
    }

    /// Whether `[begin, end]` touches this window. Zero-length spans
    /// sitting exactly on `begin` count as overlapping.
    pub fn overlaps(&self, begin: &DateTime, end: &DateTime) -> bool {
        *begin < self.end && (*end > self.begin || *begin == self.begin)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

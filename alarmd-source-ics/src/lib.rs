//! Calendar source for alarmd backed by a directory of .ics files.
//!
//! Each calendar is one directory, with an optional `.alarmd/config.toml`
//! holding its display name, color and enabled flag.

mod config;
mod parse;
mod recurrence;
mod source;

pub use config::CalendarConfig;
pub use parse::{IcsEvent, parse_calendar};
pub use recurrence::{expand, occurrences_in, parse_recurrence};
pub use source::{IcsSource, discover_sources};

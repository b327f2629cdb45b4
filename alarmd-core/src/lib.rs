//! Core of the alarmd daemon.
//!
//! This crate turns calendar sources into a live appointment list and a
//! stream of alarms:
//! - `engine` fans queries out to every enabled source and merges the results
//! - `planner` keeps a cached list for the window you care about
//! - `alarm_queue` fires alarms as their minute arrives
//! - `clock` and `wakeup` abstract wall time so all of the above can be tested

pub mod alarm_queue;
pub mod appointment;
pub mod clock;
pub mod config;
pub mod datetime;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod planner;
pub mod source;
pub mod wakeup;
pub mod window;

pub use alarm_queue::{AlarmQueue, AlarmReached};
pub use appointment::{Alarm, Appointment, AppointmentKind};
pub use clock::{Clock, ClockEvent, ClockSettings, LiveClock, MockClock, WallTime};
pub use config::AlarmdConfig;
pub use datetime::DateTime;
pub use debounce::DebounceSettings;
pub use engine::Engine;
pub use error::{AlarmError, AlarmResult};
pub use planner::{AppointmentList, RangePlanner, WindowPolicy, WindowTracker};
pub use source::{CalendarSource, SourceError, SourceEvent, SourceId};
pub use wakeup::{MockWakeupTimer, TokioWakeupTimer, WakeupTimer};
pub use window::Window;

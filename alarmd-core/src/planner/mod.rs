//! The range planner: a cached appointment list for one time window.
//!
//! The planner owns its window and its cache and is the only thing that
//! writes either. It re-queries the engine whenever the window changes or
//! the engine says its contents changed. When queries overlap, only the
//! newest one may publish; older ones are aborted and anything they still
//! deliver is dropped.

mod tracker;

pub use tracker::{WindowPolicy, WindowTracker};

use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::appointment::Appointment;
use crate::datetime::DateTime;
use crate::engine::Engine;
use crate::error::AlarmResult;
use crate::window::Window;

#[derive(Debug, Clone, Copy)]
pub(crate) enum PlannerCommand {
    SetRange(Window),
    Refresh,
}

/// Shared, immutable snapshot of the planner's cache.
pub type AppointmentList = Arc<Vec<Appointment>>;

pub struct RangePlanner {
    commands: mpsc::UnboundedSender<PlannerCommand>,
    appointments: watch::Receiver<AppointmentList>,
    range: watch::Receiver<Option<Window>>,
    shutdown: CancellationToken,
}

impl RangePlanner {
    /// Start a planner with no window. Nothing is queried until a range is
    /// set. Must be created inside a tokio runtime.
    pub fn new(engine: Engine, default_tz: Tz) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (appointments_tx, appointments) = watch::channel(Arc::new(Vec::new()));
        let (range_tx, range) = watch::channel(None);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_planner(
            engine,
            default_tz,
            commands_rx,
            appointments_tx,
            range_tx,
            shutdown.clone(),
        ));

        RangePlanner {
            commands,
            appointments,
            range,
            shutdown,
        }
    }

    /// Replace the window with `[begin, end)` and recompute right away.
    pub fn set_range(&self, begin: DateTime, end: DateTime) -> AlarmResult<()> {
        self.set_window(Window::new(begin, end)?);
        Ok(())
    }

    pub fn set_window(&self, window: Window) {
        self.send(PlannerCommand::SetRange(window));
    }

    /// Recompute the current window.
    pub fn refresh(&self) {
        self.send(PlannerCommand::Refresh);
    }

    /// The window most recently set.
    pub fn range(&self) -> Option<Window> {
        *self.range.borrow()
    }

    /// The cached appointments, observable for changes.
    pub fn appointments(&self) -> watch::Receiver<AppointmentList> {
        self.appointments.clone()
    }

    /// Snapshot of the cache.
    pub fn current(&self) -> AppointmentList {
        Arc::clone(&self.appointments.borrow())
    }

    pub(crate) fn command_sender(&self) -> mpsc::UnboundedSender<PlannerCommand> {
        self.commands.clone()
    }

    fn send(&self, command: PlannerCommand) {
        if self.commands.send(command).is_err() {
            warn!("range planner is not running");
        }
    }
}

impl Drop for RangePlanner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_planner(
    engine: Engine,
    tz: Tz,
    mut commands: mpsc::UnboundedReceiver<PlannerCommand>,
    appointments_tx: watch::Sender<AppointmentList>,
    range_tx: watch::Sender<Option<Window>>,
    shutdown: CancellationToken,
) {
    let mut engine_changed = engine.changed();
    let mut engine_open = true;
    let mut window: Option<Window> = None;
    let mut generation: u64 = 0;
    let mut in_flight: JoinSet<(u64, Vec<Appointment>)> = JoinSet::new();

    loop {
        let requery = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(PlannerCommand::SetRange(new_window)) => {
                    debug!(window = %new_window, "planner range set");
                    window = Some(new_window);
                    range_tx.send_replace(window);
                    true
                }
                Some(PlannerCommand::Refresh) => true,
                None => break,
            },
            changed = engine_changed.recv(), if engine_open => match changed {
                Ok(()) | Err(RecvError::Lagged(_)) => true,
                Err(RecvError::Closed) => {
                    engine_open = false;
                    false
                }
            },
            Some(joined) = in_flight.join_next() => {
                match joined {
                    Ok((finished, appointments)) if finished == generation => {
                        debug!(count = appointments.len(), "planner cache updated");
                        appointments_tx.send_replace(Arc::new(appointments));
                    }
                    Ok(_) => debug!("discarding result for a superseded window"),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(error = %e, "planner query panicked, keeping previous appointments"),
                }
                false
            }
        };

        if let (true, Some(window)) = (requery, window) {
            generation += 1;
            in_flight.abort_all();

            let engine = engine.clone();
            let issued = generation;
            in_flight.spawn(async move { (issued, engine.query_window(&window, tz).await) });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono_tz::UTC;
    use tokio::time;

    use super::*;
    use crate::debounce::DebounceSettings;
    use crate::source::{MemorySource, RawComponent};

    fn at(d: u32, h: u32) -> DateTime {
        DateTime::new(UTC, 2024, 6, d, h, 0, 0).unwrap()
    }

    fn day(d: u32) -> Window {
        Window::new(at(d, 0), at(d + 1, 0)).unwrap()
    }

    fn uids(list: &AppointmentList) -> Vec<String> {
        list.iter().map(|a| a.uid.clone()).collect()
    }

    fn source() -> Arc<MemorySource> {
        Arc::new(MemorySource::new("mem").with_components(vec![
            RawComponent::new("d1", "Day one", at(1, 9), at(1, 10)),
            RawComponent::new("d2", "Day two", at(2, 9), at(2, 10)),
        ]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_range_populates_cache() {
        let engine = Engine::new(DebounceSettings::default());
        engine.add_source(source());
        let planner = RangePlanner::new(engine, UTC);
        let mut rx = planner.appointments();

        planner.set_range(at(1, 0), at(2, 0)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(uids(&rx.borrow_and_update()), vec!["d1"]);
        assert_eq!(planner.range(), Some(day(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_range_is_rejected() {
        let engine = Engine::new(DebounceSettings::default());
        let planner = RangePlanner::new(engine, UTC);
        assert!(planner.set_range(at(2, 0), at(1, 0)).is_err());
        assert_eq!(planner.range(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_changes_trigger_recompute() {
        let engine = Engine::new(DebounceSettings::default());
        let mem = source();
        engine.add_source(mem.clone());
        let planner = RangePlanner::new(engine, UTC);
        planner.set_window(day(1));
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(uids(&planner.current()), vec!["d1"]);

        mem.set_components(vec![
            RawComponent::new("d1", "Day one", at(1, 9), at(1, 10)),
            RawComponent::new("d1b", "Day one again", at(1, 11), at(1, 12)),
        ]);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(uids(&planner.current()), vec!["d1", "d1b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_window_wins_over_slower_older_query() {
        let engine = Engine::new(DebounceSettings::default());
        let mem = source();
        mem.set_delay(Some(Duration::from_secs(5)));
        engine.add_source(mem.clone());
        let planner = RangePlanner::new(engine, UTC);
        let mut rx = planner.appointments();

        planner.set_window(day(1));
        time::sleep(Duration::from_secs(1)).await;
        planner.set_window(day(2));

        rx.changed().await.unwrap();
        assert_eq!(uids(&rx.borrow_and_update()), vec!["d2"]);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(uids(&planner.current()), vec!["d2"]);
        assert_eq!(planner.range(), Some(day(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_requeries_same_window() {
        let engine = Engine::new(DebounceSettings::default());
        let mem = source();
        engine.add_source(mem.clone());
        let planner = RangePlanner::new(engine, UTC);
        planner.set_window(day(2));
        time::sleep(Duration::from_millis(100)).await;
        let asked = mem.query_count();

        planner.refresh();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mem.query_count(), asked + 1);
        assert_eq!(uids(&planner.current()), vec!["d2"]);
    }
}

//! The alarm queue.
//!
//! Watches the planner's appointment list and the clock, fires every
//! alarm that falls in the current minute exactly once, and keeps a
//! single wakeup armed for the next one. Alarms whose minute passed while
//! nothing was looking (suspend, a forward clock jump) are not replayed.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::appointment::{Alarm, Appointment};
use crate::clock::Clock;
use crate::datetime::DateTime;
use crate::planner::AppointmentList;
use crate::wakeup::WakeupTimer;

/// Emitted once per alarm when its minute arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmReached {
    pub appointment: Appointment,
    pub alarm: Alarm,
}

/// Appointments whose alarms the queue acts on.
pub fn qualifies(appointment: &Appointment) -> bool {
    appointment.is_ubuntu_alarm() || appointment.activation_url.is_some()
}

pub struct AlarmQueue {
    reached: broadcast::Sender<AlarmReached>,
    next_alarm: watch::Receiver<Option<DateTime>>,
    recheck: mpsc::UnboundedSender<()>,
    shutdown: CancellationToken,
}

impl AlarmQueue {
    /// Start the queue. The first check runs as soon as the runtime polls
    /// the queue's task, so subscribe before yielding.
    pub fn new(
        appointments: watch::Receiver<AppointmentList>,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn WakeupTimer>,
    ) -> Self {
        let (reached, _) = broadcast::channel(256);
        let (next_tx, next_alarm) = watch::channel(None);
        let (recheck, recheck_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let state = QueueState {
            clock,
            timer,
            appointments: Arc::new(Vec::new()),
            fired: HashSet::new(),
            reached: reached.clone(),
            next_alarm: next_tx,
        };
        tokio::spawn(run_queue(state, appointments, recheck_rx, shutdown.clone()));

        AlarmQueue {
            reached,
            next_alarm,
            recheck,
            shutdown,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlarmReached> {
        self.reached.subscribe()
    }

    /// Force a check now.
    pub fn recheck(&self) {
        let _ = self.recheck.send(());
    }

    /// Time of the next alarm the queue is waiting for.
    pub fn next_alarm(&self) -> watch::Receiver<Option<DateTime>> {
        self.next_alarm.clone()
    }
}

impl Drop for AlarmQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type FiredKey = (String, DateTime, DateTime);

struct QueueState {
    clock: Arc<dyn Clock>,
    timer: Arc<dyn WakeupTimer>,
    appointments: AppointmentList,
    fired: HashSet<FiredKey>,
    reached: broadcast::Sender<AlarmReached>,
    next_alarm: watch::Sender<Option<DateTime>>,
}

impl QueueState {
    fn check(&mut self) {
        let now = self.clock.localtime();
        let minute = now.minute_index();

        // Keys stay until their minute is over
        self.fired.retain(|(_, _, time)| time.minute_index() >= minute);

        let mut due: Vec<(&Appointment, &Alarm)> = Vec::new();
        let mut next: Option<DateTime> = None;

        for appointment in self.appointments.iter().filter(|a| qualifies(a)) {
            for alarm in &appointment.alarms {
                let alarm_minute = alarm.time.minute_index();
                if alarm_minute == minute {
                    let key = (appointment.uid.clone(), appointment.begin, alarm.time);
                    if self.fired.insert(key) {
                        due.push((appointment, alarm));
                    }
                } else if alarm_minute > minute && next.is_none_or(|n| alarm.time < n) {
                    next = Some(alarm.time);
                }
            }
        }

        due.sort_by(|a, b| {
            a.1.time
                .cmp(&b.1.time)
                .then_with(|| a.0.uid.cmp(&b.0.uid))
        });
        for (appointment, alarm) in due {
            info!(uid = %appointment.uid, summary = %appointment.summary, at = %alarm.time, "alarm reached");
            let _ = self.reached.send(AlarmReached {
                appointment: appointment.clone(),
                alarm: alarm.clone(),
            });
        }

        self.timer.cancel();
        if let Some(next) = next {
            self.timer.set_wakeup_time(next);
        }
        let moved = self.next_alarm.send_if_modified(|current| {
            let modified = *current != next;
            *current = next;
            modified
        });
        if moved {
            match next {
                Some(at) => info!(at = %at, "wakeup armed"),
                None => info!("no upcoming alarms, wakeup idle"),
            }
        }
    }
}

async fn run_queue(
    mut state: QueueState,
    mut appointments: watch::Receiver<AppointmentList>,
    mut recheck: mpsc::UnboundedReceiver<()>,
    shutdown: CancellationToken,
) {
    let mut clock_events = state.clock.subscribe();
    let mut timeouts = state.timer.subscribe();
    let (mut appointments_open, mut clock_open, mut timer_open) = (true, true, true);

    state.appointments = appointments.borrow_and_update().clone();
    state.check();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = appointments.changed(), if appointments_open => match changed {
                Ok(()) => state.appointments = appointments.borrow_and_update().clone(),
                Err(_) => appointments_open = false,
            },
            event = clock_events.recv(), if clock_open => match event {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => clock_open = false,
            },
            timeout = timeouts.recv(), if timer_open => match timeout {
                Ok(when) => debug!(at = %when, "wakeup timeout"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => timer_open = false,
            },
            request = recheck.recv() => {
                if request.is_none() {
                    break;
                }
            }
        }
        state.check();
    }

    state.timer.cancel();
}

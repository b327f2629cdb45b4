//! Counted fan-in for engine sub-queries.
//!
//! A query owns one [`FanIn`] sized to the number of sub-queries it
//! issued. Each sub-query holds a [`Completion`] and finishes it exactly
//! once, with whatever it managed to collect (possibly nothing). A
//! completion dropped unfinished, as happens when a sub-query panics,
//! counts as an empty one. The completion that takes the counter to zero
//! hands the merged list to the waiting query. With zero sub-queries the
//! result is delivered on construction.

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::appointment::Appointment;

struct FanInState {
    remaining: usize,
    appointments: Vec<Appointment>,
    done: Option<oneshot::Sender<Vec<Appointment>>>,
}

pub(crate) struct FanIn {
    state: Mutex<FanInState>,
}

impl FanIn {
    pub(crate) fn new(expected: usize) -> (Self, oneshot::Receiver<Vec<Appointment>>) {
        let (tx, rx) = oneshot::channel();
        let fan_in = FanIn {
            state: Mutex::new(FanInState {
                remaining: expected,
                appointments: Vec::new(),
                done: Some(tx),
            }),
        };
        if expected == 0 {
            fan_in.deliver(&mut fan_in.state.lock().unwrap_or_else(PoisonError::into_inner));
        }
        (fan_in, rx)
    }

    /// Record one finished sub-query.
    pub(crate) fn complete(&self, appointments: Vec<Appointment>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.remaining == 0 {
            return;
        }
        state.appointments.extend(appointments);
        state.remaining -= 1;
        if state.remaining == 0 {
            self.deliver(&mut state);
        }
    }

    /// Hand out one sub-query's share of the count.
    pub(crate) fn completion(self: &Arc<Self>) -> Completion {
        Completion {
            fan_in: Some(Arc::clone(self)),
        }
    }

    fn deliver(&self, state: &mut FanInState) {
        if let Some(done) = state.done.take() {
            // The query may have been dropped already; nothing to do then
            let _ = done.send(mem::take(&mut state.appointments));
        }
    }
}

pub(crate) struct Completion {
    fan_in: Option<Arc<FanIn>>,
}

impl Completion {
    pub(crate) fn finish(mut self, appointments: Vec<Appointment>) {
        if let Some(fan_in) = self.fan_in.take() {
            fan_in.complete(appointments);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(fan_in) = self.fan_in.take() {
            fan_in.complete(Vec::new());
        }
    }
}

//! In-memory calendar source.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{CalendarSource, RawComponent, SourceError, SourceEvent, SourceId};
use crate::window::Window;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Unavailable,
    Backend,
}

#[derive(Default)]
struct MemoryState {
    components: Vec<RawComponent>,
    failure: Option<Failure>,
    delay: Option<Duration>,
    queries: usize,
}

/// A source backed by a plain list of components.
///
/// Useful for tests and for feeding alarms from code. Queries can be
/// delayed or made to fail to exercise the engine's error paths.
pub struct MemorySource {
    id: SourceId,
    color: Option<String>,
    state: Mutex<MemoryState>,
    events: broadcast::Sender<SourceEvent>,
}

impl MemorySource {
    pub fn new(id: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        MemorySource {
            id: SourceId::new(id),
            color: None,
            state: Mutex::new(MemoryState::default()),
            events,
        }
    }

    pub fn with_color(mut self, color: &str) -> Self {
        self.color = Some(color.to_string());
        self
    }

    pub fn with_components(self, components: Vec<RawComponent>) -> Self {
        self.lock().components = components;
        self
    }

    /// Replace the contents and announce the change.
    pub fn set_components(&self, components: Vec<RawComponent>) {
        self.lock().components = components;
        self.emit(SourceEvent::Changed);
    }

    /// Delay every query by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Make queries fail as if the backend had gone away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().failure = unavailable.then_some(Failure::Unavailable);
    }

    /// Make queries fail with a generic backend error.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failure = failing.then_some(Failure::Backend);
    }

    /// Number of queries answered so far.
    pub fn query_count(&self) -> usize {
        self.lock().queries
    }

    pub fn emit(&self, event: SourceEvent) {
        // No receivers just means nobody is listening yet
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CalendarSource for MemorySource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn color(&self) -> Option<String> {
        self.color.clone()
    }

    async fn query(&self, window: &Window) -> Result<Vec<RawComponent>, SourceError> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.queries += 1;
        match state.failure {
            Some(Failure::Unavailable) => {
                return Err(SourceError::Unavailable(format!("{} is offline", self.id)));
            }
            Some(Failure::Backend) => {
                return Err(SourceError::Backend(format!("{} failed", self.id)));
            }
            None => {}
        }

        Ok(state
            .components
            .iter()
            .filter(|c| window.overlaps(&c.begin, &c.end))
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }
}

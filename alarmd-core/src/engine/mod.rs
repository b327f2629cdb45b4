//! The ingestion engine.
//!
//! Holds the set of calendar sources, answers window queries by fanning
//! out one sub-query per enabled source and merging what comes back, and
//! turns the sources' change chatter into a debounced `changed()` stream.
//!
//! Source failures never fail a query. An unreachable source is treated as
//! absent until it reports itself enabled again; everything else is logged
//! and that source's contribution is simply missing from the result. This
//! includes a sub-query that panics.

mod fan_in;
mod normalize;

pub use normalize::{ALARM_CATEGORY, DISABLED_CATEGORY, normalize_components};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono_tz::Tz;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::appointment::{Appointment, sort_appointments};
use crate::datetime::DateTime;
use crate::debounce::{DebounceSettings, Debouncer};
use crate::error::AlarmResult;
use crate::source::{CalendarSource, SourceError, SourceEvent, SourceId};
use crate::window::Window;

use fan_in::FanIn;

struct SourceEntry {
    source: Arc<dyn CalendarSource>,
    enabled: bool,
    watcher: JoinHandle<()>,
}

struct EngineInner {
    sources: Mutex<BTreeMap<SourceId, SourceEntry>>,
    dirty_tx: mpsc::UnboundedSender<()>,
    changed_tx: broadcast::Sender<()>,
    shutdown: CancellationToken,
}

impl EngineInner {
    fn lock_sources(&self) -> MutexGuard<'_, BTreeMap<SourceId, SourceEntry>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_dirty(&self) {
        // The debounce task only goes away on shutdown
        let _ = self.dirty_tx.send(());
    }

    fn set_enabled(&self, id: &SourceId, enabled: bool) -> bool {
        let mut sources = self.lock_sources();
        match sources.get_mut(id) {
            Some(entry) if entry.enabled != enabled => {
                entry.enabled = enabled;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, id: &SourceId) -> bool {
        let removed = self.lock_sources().remove(id);
        match removed {
            Some(entry) => {
                entry.watcher.abort();
                true
            }
            None => false,
        }
    }

    fn enabled_sources(&self) -> Vec<Arc<dyn CalendarSource>> {
        self.lock_sources()
            .values()
            .filter(|entry| entry.enabled)
            .map(|entry| Arc::clone(&entry.source))
            .collect()
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Aggregates appointments across all calendar sources.
///
/// Cheap to clone; clones share the same sources and change stream.
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(settings: DebounceSettings) -> Self {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let (changed_tx, _) = broadcast::channel(16);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_debounce(
            dirty_rx,
            changed_tx.clone(),
            Debouncer::new(settings),
            shutdown.clone(),
        ));

        Engine {
            inner: Arc::new(EngineInner {
                sources: Mutex::new(BTreeMap::new()),
                dirty_tx,
                changed_tx,
                shutdown,
            }),
        }
    }

    /// Debounced notification that query results may have changed.
    pub fn changed(&self) -> broadcast::Receiver<()> {
        self.inner.changed_tx.subscribe()
    }

    /// Start using `source`. A source with the same id is replaced.
    pub fn add_source(&self, source: Arc<dyn CalendarSource>) {
        let id = source.id().clone();
        let events = source.subscribe();
        let watcher = tokio::spawn(watch_source(
            Arc::downgrade(&self.inner),
            id.clone(),
            events,
            self.inner.shutdown.clone(),
        ));

        let previous = self.inner.lock_sources().insert(
            id.clone(),
            SourceEntry {
                source,
                enabled: true,
                watcher,
            },
        );
        if let Some(previous) = previous {
            previous.watcher.abort();
        }

        info!(source = %id, "calendar source added");
        self.inner.mark_dirty();
    }

    /// Stop using a source. Returns whether it was known.
    pub fn remove_source(&self, id: &SourceId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            info!(source = %id, "calendar source removed");
            self.inner.mark_dirty();
        }
        removed
    }

    /// Known sources and whether each is currently enabled.
    pub fn sources(&self) -> Vec<(SourceId, bool)> {
        self.inner
            .lock_sources()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.enabled))
            .collect()
    }

    /// Appointments overlapping `[begin, end)` across all enabled sources,
    /// in canonical order, with times expressed in `default_tz`.
    ///
    /// Fails only if `begin` is not before `end`.
    pub async fn query(
        &self,
        begin: &DateTime,
        end: &DateTime,
        default_tz: Tz,
    ) -> AlarmResult<Vec<Appointment>> {
        let window = Window::new(*begin, *end)?;
        Ok(self.query_window(&window, default_tz).await)
    }

    /// Like [`Engine::query`] for an already validated window.
    ///
    /// Dropping the returned future cancels every outstanding sub-query.
    pub async fn query_window(&self, window: &Window, default_tz: Tz) -> Vec<Appointment> {
        let sources = self.inner.enabled_sources();
        let cancel = self.inner.shutdown.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let (fan_in, done) = FanIn::new(sources.len());
        let fan_in = Arc::new(fan_in);

        for source in sources {
            let completion = fan_in.completion();
            let cancel = cancel.clone();
            let engine = Arc::downgrade(&self.inner);
            let window = *window;

            tokio::spawn(async move {
                let appointments = tokio::select! {
                    _ = cancel.cancelled() => Vec::new(),
                    result = source.query(&window) => {
                        collect_source_result(&engine, source.as_ref(), result, &window, default_tz)
                    }
                };
                completion.finish(appointments);
            });
        }
        drop(fan_in);

        let mut appointments = done.await.unwrap_or_default();
        sort_appointments(&mut appointments);
        appointments
    }

    /// Cancel in-flight queries and stop watching sources.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

fn collect_source_result(
    engine: &Weak<EngineInner>,
    source: &dyn CalendarSource,
    result: Result<Vec<crate::source::RawComponent>, SourceError>,
    window: &Window,
    tz: Tz,
) -> Vec<Appointment> {
    let id = source.id();
    match result {
        Ok(components) => {
            debug!(source = %id, count = components.len(), "source answered");
            normalize_components(id, source.color().as_deref(), components, window, tz)
        }
        Err(SourceError::Cancelled) => Vec::new(),
        Err(SourceError::Unavailable(reason)) => {
            warn!(source = %id, %reason, "source unavailable, ignoring it until it comes back");
            if let Some(engine) = engine.upgrade() {
                engine.set_enabled(id, false);
            }
            Vec::new()
        }
        Err(e) => {
            warn!(source = %id, error = %e, "source query failed");
            Vec::new()
        }
    }
}

async fn run_debounce(
    mut dirty_rx: mpsc::UnboundedReceiver<()>,
    changed_tx: broadcast::Sender<()>,
    mut debouncer: Debouncer,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            dirty = dirty_rx.recv() => match dirty {
                Some(()) => {
                    debouncer.kick();
                }
                None => break,
            },
            _ = debouncer.fired() => {
                debug!("engine contents changed");
                let _ = changed_tx.send(());
            }
        }
    }
}

async fn watch_source(
    engine: Weak<EngineInner>,
    id: SourceId,
    mut events: broadcast::Receiver<SourceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(engine) = engine.upgrade() else {
            return;
        };

        match event {
            Ok(SourceEvent::Changed) => engine.mark_dirty(),
            Ok(SourceEvent::Enabled) => {
                if engine.set_enabled(&id, true) {
                    info!(source = %id, "calendar source enabled");
                }
                engine.mark_dirty();
            }
            Ok(SourceEvent::Disabled) => {
                if engine.set_enabled(&id, false) {
                    info!(source = %id, "calendar source disabled");
                }
                engine.mark_dirty();
            }
            Ok(SourceEvent::Removed) => {
                info!(source = %id, "calendar source went away");
                engine.remove(&id);
                engine.mark_dirty();
                return;
            }
            Err(RecvError::Lagged(missed)) => {
                debug!(source = %id, missed, "source events lagged");
                engine.mark_dirty();
            }
            Err(RecvError::Closed) => return,
        }
    }
}

//! A calendar backed by a directory of .ics files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use alarmd_core::source::{CalendarSource, RawComponent, SourceError, SourceEvent, SourceId};
use alarmd_core::{AlarmResult, Window};
use async_trait::async_trait;
use chrono_tz::Tz;
use notify::event::{MetadataKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::CalendarConfig;
use crate::parse::parse_calendar;
use crate::recurrence::occurrences_in;

pub struct IcsSource {
    id: SourceId,
    name: String,
    dir: PathBuf,
    default_tz: Tz,
    color: Option<String>,
    events: broadcast::Sender<SourceEvent>,
    available: Arc<AtomicBool>,
    // Cleared whenever the directory goes away, since its watch goes with it
    dir_watched: Arc<AtomicBool>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl IcsSource {
    /// Open `dir` as a calendar. The directory does not have to exist; a
    /// missing one makes queries fail until it shows up.
    pub fn open(dir: &Path, default_tz: Tz) -> AlarmResult<Self> {
        let config = CalendarConfig::load(dir)?;
        let slug = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.display().to_string());

        let (events, _) = broadcast::channel(64);
        let available = Arc::new(AtomicBool::new(dir.is_dir()));
        let dir_watched = Arc::new(AtomicBool::new(false));
        let watcher = start_watcher(
            dir,
            events.clone(),
            Arc::clone(&available),
            Arc::clone(&dir_watched),
        );

        Ok(IcsSource {
            id: SourceId::new(&slug),
            name: config.name.unwrap_or(slug),
            dir: dir.to_path_buf(),
            default_tz,
            color: config.color,
            events,
            available,
            dir_watched,
            watcher: Mutex::new(watcher),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Put a watch on the directory itself if it exists and has none,
    /// which is the case after it was recreated.
    fn ensure_dir_watched(&self) {
        if self.dir_watched.load(Ordering::SeqCst) || !self.dir.is_dir() {
            return;
        }
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(watcher) = watcher.as_mut() else {
            return;
        };
        match watcher.watch(&self.dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                debug!(calendar = %self.id, "watching calendar directory");
                self.dir_watched.store(true, Ordering::SeqCst);
            }
            Err(e) => warn!(path = %self.dir.display(), error = %e, "could not watch calendar directory"),
        }
    }

    fn mark_unavailable(&self) {
        self.dir_watched.store(false, Ordering::SeqCst);
        if self.available.swap(false, Ordering::SeqCst) {
            info!(calendar = %self.id, "calendar directory disappeared");
            let _ = self.events.send(SourceEvent::Disabled);
        }
    }

    /// The .ics files in the directory, by name.
    async fn ics_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.mark_unavailable();
                return Err(SourceError::Unavailable(format!(
                    "{} does not exist",
                    self.dir.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "ics") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl CalendarSource for IcsSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn color(&self) -> Option<String> {
        self.color.clone()
    }

    async fn query(&self, window: &Window) -> Result<Vec<RawComponent>, SourceError> {
        self.ensure_dir_watched();
        let files = self.ics_files().await?;

        let mut events = Vec::new();
        for path in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not read .ics file");
                    continue;
                }
            };
            match parse_calendar(&content, self.default_tz) {
                Ok(parsed) => events.extend(parsed),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed .ics file"),
            }
        }

        let components = occurrences_in(&events, window);
        debug!(calendar = %self.id, count = components.len(), "calendar queried");
        Ok(components)
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }
}

/// Watch the calendar directory for file changes and its parent for the
/// directory itself coming and going. Both watches are non-recursive, so
/// sibling calendars do not wake this one.
fn start_watcher(
    dir: &Path,
    events: broadcast::Sender<SourceEvent>,
    available: Arc<AtomicBool>,
    dir_watched: Arc<AtomicBool>,
) -> Option<RecommendedWatcher> {
    let parent = dir.parent()?.to_path_buf();
    let dir = dir.to_path_buf();
    let watched = dir.clone();
    let handler_watched = Arc::clone(&dir_watched);

    let handler = move |result: notify::Result<Event>| {
        let Ok(event) = result else {
            return;
        };
        // Our own reads show up as access events
        if matches!(
            event.kind,
            EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime))
        ) {
            return;
        }
        if !event.paths.iter().any(|p| p.starts_with(&dir)) {
            return;
        }

        let now_available = dir.is_dir();
        let change = match (available.swap(now_available, Ordering::SeqCst), now_available) {
            (true, true) => SourceEvent::Changed,
            (true, false) => SourceEvent::Disabled,
            (false, true) => SourceEvent::Enabled,
            (false, false) => return,
        };
        if change != SourceEvent::Changed {
            // A vanished or recreated directory has no watch of its own;
            // the next query puts one back
            handler_watched.store(false, Ordering::SeqCst);
        }
        let _ = events.send(change);
    };

    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(error = %e, "could not create file watcher");
            return None;
        }
    };
    if let Err(e) = watcher.watch(&parent, RecursiveMode::NonRecursive) {
        warn!(path = %watched.display(), error = %e, "not watching calendar for changes");
        return None;
    }
    if watched.is_dir() {
        match watcher.watch(&watched, RecursiveMode::NonRecursive) {
            Ok(()) => dir_watched.store(true, Ordering::SeqCst),
            Err(e) => warn!(path = %watched.display(), error = %e, "could not watch calendar directory"),
        }
    }
    Some(watcher)
}

/// Open every enabled calendar under `calendar_dir`, sorted by directory
/// name. Hidden directories are skipped.
pub fn discover_sources(calendar_dir: &Path, default_tz: Tz) -> AlarmResult<Vec<IcsSource>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(calendar_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            !path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'))
        })
        .collect();
    dirs.sort();

    let mut sources = Vec::new();
    for dir in dirs {
        if !CalendarConfig::load(&dir)?.enabled {
            debug!(path = %dir.display(), "calendar disabled in config");
            continue;
        }
        sources.push(IcsSource::open(&dir, default_tz)?);
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use alarmd_core::DateTime;
    use chrono_tz::UTC;
    use tempfile::TempDir;

    fn june() -> Window {
        Window::new(
            DateTime::new(UTC, 2024, 6, 1, 0, 0, 0).unwrap(),
            DateTime::new(UTC, 2024, 7, 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn write_event(dir: &Path, uid: &str, start: &str) {
        let ics = format!(
            "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:TEST\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nSUMMARY:{uid}\r\nDTSTART:{start}\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n"
        );
        std::fs::write(dir.join(format!("{uid}.ics")), ics).unwrap();
    }

    async fn next_event(rx: &mut broadcast::Receiver<SourceEvent>, wanted: SourceEvent) -> bool {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if event == wanted => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap_or(false)
    }

    #[tokio::test]
    async fn test_query_reads_ics_files_in_window() {
        let root = TempDir::new().unwrap();
        let cal = root.path().join("personal");
        std::fs::create_dir(&cal).unwrap();
        write_event(&cal, "in-june", "20240610T090000Z");
        write_event(&cal, "in-july", "20240710T090000Z");
        std::fs::write(cal.join("notes.txt"), "not a calendar").unwrap();
        std::fs::write(cal.join("broken.ics"), "BEGIN:VCALENDAR\r\nnonsense").unwrap();

        let source = IcsSource::open(&cal, UTC).unwrap();
        assert_eq!(source.id().as_str(), "personal");
        assert_eq!(source.name(), "personal");

        let found = source.query(&june()).await.unwrap();
        let uids: Vec<&str> = found.iter().map(|c| c.uid.as_str()).collect();
        assert_eq!(uids, vec!["in-june"]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let root = TempDir::new().unwrap();
        let source = IcsSource::open(&root.path().join("gone"), UTC).unwrap();
        assert!(matches!(
            source.query(&june()).await,
            Err(SourceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_skips_disabled_and_hidden_calendars() {
        let root = TempDir::new().unwrap();
        for name in ["work", "alarms", ".trash", "old"] {
            std::fs::create_dir(root.path().join(name)).unwrap();
        }
        CalendarConfig {
            name: Some("Alarms".into()),
            color: Some("#e95420".into()),
            enabled: true,
        }
        .save(&root.path().join("alarms"))
        .unwrap();
        CalendarConfig {
            enabled: false,
            ..Default::default()
        }
        .save(&root.path().join("old"))
        .unwrap();

        let sources = discover_sources(root.path(), UTC).unwrap();
        let ids: Vec<&str> = sources.iter().map(|s| s.id().as_str()).collect();
        assert_eq!(ids, vec!["alarms", "work"]);
        assert_eq!(sources[0].name(), "Alarms");
        assert_eq!(sources[0].color().as_deref(), Some("#e95420"));
        assert_eq!(sources[1].color(), None);
    }

    #[tokio::test]
    async fn test_file_changes_are_announced() {
        let root = TempDir::new().unwrap();
        let cal = root.path().join("personal");
        std::fs::create_dir(&cal).unwrap();
        let source = IcsSource::open(&cal, UTC).unwrap();
        let mut rx = source.subscribe();

        write_event(&cal, "new", "20240610T090000Z");
        assert!(next_event(&mut rx, SourceEvent::Changed).await);
    }

    #[tokio::test]
    async fn test_sibling_calendars_do_not_wake_each_other() {
        let root = TempDir::new().unwrap();
        let personal = root.path().join("personal");
        let work = root.path().join("work");
        std::fs::create_dir(&personal).unwrap();
        std::fs::create_dir(&work).unwrap();
        let source = IcsSource::open(&personal, UTC).unwrap();
        let mut rx = source.subscribe();

        write_event(&work, "elsewhere", "20240610T090000Z");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        write_event(&personal, "mine", "20240610T090000Z");
        assert!(next_event(&mut rx, SourceEvent::Changed).await);
    }

    #[tokio::test]
    async fn test_recreated_directory_is_watched_again() {
        let root = TempDir::new().unwrap();
        let cal = root.path().join("personal");
        let source = IcsSource::open(&cal, UTC).unwrap();
        let mut rx = source.subscribe();

        std::fs::create_dir(&cal).unwrap();
        assert!(next_event(&mut rx, SourceEvent::Enabled).await);

        // The engine re-queries on Enabled, which re-arms the watch
        assert!(source.query(&june()).await.unwrap().is_empty());
        write_event(&cal, "later", "20240610T090000Z");
        assert!(next_event(&mut rx, SourceEvent::Changed).await);
    }

    #[tokio::test]
    async fn test_directory_coming_and_going_toggles_availability() {
        let root = TempDir::new().unwrap();
        let cal = root.path().join("personal");
        let source = IcsSource::open(&cal, UTC).unwrap();
        let mut rx = source.subscribe();

        std::fs::create_dir(&cal).unwrap();
        assert!(next_event(&mut rx, SourceEvent::Enabled).await);

        std::fs::remove_dir(&cal).unwrap();
        assert!(next_event(&mut rx, SourceEvent::Disabled).await);
    }
}

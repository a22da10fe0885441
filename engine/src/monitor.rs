//! Filesystem monitoring with debounced incremental updates
//!
//! A notify watcher posts raw events over a channel to a debounce thread.
//! Events for the same path within the debounce window collapse to one;
//! drained events update the repository map and then reach an optional
//! user callback. `wait_for_change` temporarily routes the next event
//! into a one-shot channel.

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::mapper::RepoMapper;
use crate::types::{FileEvent, FileEventKind};

/// Quiet period before a batch of events is processed.
const DEBOUNCE_MS: u64 = 500;

/// Callback invoked for each dispatched event
pub type EventCallback = Box<dyn Fn(&FileEvent) + Send + 'static>;

/// Monitoring status snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitorStatus {
    pub is_monitoring: bool,
    pub watched_paths: Vec<String>,
    pub observer_alive: bool,
}

struct WatchState {
    watcher: RecommendedWatcher,
    handle: JoinHandle<()>,
}

/// Watches registered paths and feeds debounced events to the mapper
pub struct FileMonitor {
    mapper: Arc<RepoMapper>,
    state: Mutex<Option<WatchState>>,
    watched: Mutex<HashSet<PathBuf>>,
    callback: Arc<Mutex<Option<EventCallback>>>,
    waiter: Arc<Mutex<Option<mpsc::SyncSender<FileEvent>>>>,
}

impl FileMonitor {
    /// Create a monitor that dispatches into `mapper`.
    pub fn new(mapper: Arc<RepoMapper>) -> Self {
        Self {
            mapper,
            state: Mutex::new(None),
            watched: Mutex::new(HashSet::new()),
            callback: Arc::new(Mutex::new(None)),
            waiter: Arc::new(Mutex::new(None)),
        }
    }

    /// Set (or clear) the callback invoked after each dispatched event.
    pub fn set_callback(&self, callback: Option<EventCallback>) {
        if let Ok(mut guard) = self.callback.lock() {
            *guard = callback;
        }
    }

    /// Start watching `paths` (the repository root when empty). A path
    /// that cannot be watched is logged and skipped; the monitor keeps
    /// running with the rest.
    pub fn start(&self, paths: &[PathBuf], recursive: bool) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| EngineError::Watch {
                path: String::new(),
                message: "monitor state poisoned".to_owned(),
            })?;
        if state.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<notify::Event>();
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|err| EngineError::Watch {
            path: String::new(),
            message: err.to_string(),
        })?;

        let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        let targets: Vec<PathBuf> = if paths.is_empty() {
            vec![self.mapper.root().to_path_buf()]
        } else {
            paths.to_vec()
        };

        let mut watched = self.watched.lock().map_err(|_| EngineError::Watch {
            path: String::new(),
            message: "monitor state poisoned".to_owned(),
        })?;
        for target in targets {
            match watcher.watch(&target, mode) {
                Ok(()) => {
                    watched.insert(target);
                }
                Err(err) => {
                    log::warn!("failed to watch {}: {err}", target.display());
                }
            }
        }
        drop(watched);

        let mapper = Arc::clone(&self.mapper);
        let callback = Arc::clone(&self.callback);
        let waiter = Arc::clone(&self.waiter);
        let handle = std::thread::spawn(move || {
            debounce_loop(rx, mapper, callback, waiter);
        });

        *state = Some(WatchState { watcher, handle });
        Ok(())
    }

    /// Stop watching: drop the watcher (its channel disconnect ends the
    /// debounce thread) and join the thread before returning. A stopped
    /// monitor can be started again with a fresh observer.
    pub fn stop(&self) {
        let taken = self.state.lock().ok().and_then(|mut state| state.take());
        if let Some(state) = taken {
            drop(state.watcher);
            if state.handle.join().is_err() {
                log::warn!("monitor thread panicked during shutdown");
            }
        }
        if let Ok(mut watched) = self.watched.lock() {
            watched.clear();
        }
    }

    /// Add one path to the active watch set.
    pub fn add_path(&self, path: &Path, recursive: bool) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| EngineError::Watch {
            path: path.display().to_string(),
            message: "monitor state poisoned".to_owned(),
        })?;
        let Some(state) = state.as_mut() else {
            return Err(EngineError::Watch {
                path: path.display().to_string(),
                message: "monitor is not running".to_owned(),
            });
        };

        let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        state.watcher.watch(path, mode).map_err(|err| EngineError::Watch {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        if let Ok(mut watched) = self.watched.lock() {
            watched.insert(path.to_path_buf());
        }
        Ok(())
    }

    /// Remove one path from the active watch set.
    pub fn remove_path(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| EngineError::Watch {
            path: path.display().to_string(),
            message: "monitor state poisoned".to_owned(),
        })?;
        if let Some(state) = state.as_mut() {
            state.watcher.unwatch(path).map_err(|err| EngineError::Watch {
                path: path.display().to_string(),
                message: err.to_string(),
            })?;
        }
        if let Ok(mut watched) = self.watched.lock() {
            watched.remove(path);
        }
        Ok(())
    }

    /// Block until the next dispatched event, or `None` on timeout.
    pub fn wait_for_change(&self, timeout: Duration) -> Option<FileEvent> {
        let (tx, rx) = mpsc::sync_channel(1);
        if let Ok(mut waiter) = self.waiter.lock() {
            *waiter = Some(tx);
        }

        let received = rx.recv_timeout(timeout).ok();

        if let Ok(mut waiter) = self.waiter.lock() {
            *waiter = None;
        }
        received
    }

    /// Current monitoring status.
    pub fn status(&self) -> MonitorStatus {
        let running = self
            .state
            .lock()
            .map(|state| {
                state
                    .as_ref()
                    .map(|s| !s.handle.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        let watched_paths = self
            .watched
            .lock()
            .map(|watched| watched.iter().map(|p| p.display().to_string()).collect())
            .unwrap_or_default();
        MonitorStatus {
            is_monitoring: running,
            watched_paths,
            observer_alive: running,
        }
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collect raw events, coalesce per path over the debounce window, and
/// dispatch batches once the window has been quiet.
fn debounce_loop(
    rx: mpsc::Receiver<notify::Event>,
    mapper: Arc<RepoMapper>,
    callback: Arc<Mutex<Option<EventCallback>>>,
    waiter: Arc<Mutex<Option<mpsc::SyncSender<FileEvent>>>>,
) {
    let window = Duration::from_millis(DEBOUNCE_MS);
    let mut pending: HashMap<String, (Instant, FileEvent)> = HashMap::new();

    loop {
        match rx.recv_timeout(window) {
            Ok(raw) => {
                for event in translate(&raw) {
                    queue_event(&mut pending, event);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - window;
                let ready: Vec<String> = pending
                    .iter()
                    .filter(|(_, (at, _))| *at <= cutoff)
                    .map(|(path, _)| path.clone())
                    .collect();
                if ready.is_empty() {
                    continue;
                }

                let mut batch: Vec<FileEvent> = ready
                    .iter()
                    .filter_map(|path| pending.remove(path))
                    .map(|(_, event)| event)
                    .collect();
                batch.sort_by_key(|event| event.timestamp);

                for event in batch {
                    dispatch(&event, &mapper, &callback, &waiter);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Queue an event, collapsing with any pending event for the same path.
/// The latest kind wins, except that a creation followed by writes within
/// the window stays a creation.
fn queue_event(pending: &mut HashMap<String, (Instant, FileEvent)>, mut event: FileEvent) {
    if let Some((_, previous)) = pending.get(&event.path) {
        if previous.kind == FileEventKind::Created && event.kind == FileEventKind::Modified {
            event.kind = FileEventKind::Created;
        }
        if event.old_path.is_none() {
            event.old_path = previous.old_path.clone();
        }
    }
    pending.insert(event.path.clone(), (Instant::now(), event));
}

/// Translate one raw notify event into engine events. Directory events
/// and unknown kinds produce nothing.
fn translate(raw: &notify::Event) -> Vec<FileEvent> {
    let mut events = Vec::new();

    match raw.kind {
        EventKind::Create(_) => {
            for path in &raw.paths {
                if !path.is_dir() {
                    events.push(FileEvent::now(path.to_string_lossy(), FileEventKind::Created));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = raw.paths.as_slice() {
                if !to.is_dir() {
                    let mut event =
                        FileEvent::now(to.to_string_lossy(), FileEventKind::Moved);
                    event.old_path = Some(from.to_string_lossy().to_string());
                    events.push(event);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &raw.paths {
                events.push(FileEvent::now(path.to_string_lossy(), FileEventKind::Deleted));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &raw.paths {
                if !path.is_dir() {
                    events.push(FileEvent::now(path.to_string_lossy(), FileEventKind::Created));
                }
            }
        }
        EventKind::Modify(_) => {
            for path in &raw.paths {
                if !path.is_dir() {
                    events.push(FileEvent::now(path.to_string_lossy(), FileEventKind::Modified));
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &raw.paths {
                events.push(FileEvent::now(path.to_string_lossy(), FileEventKind::Deleted));
            }
        }
        _ => {}
    }

    events
}

/// Apply one debounced event to the map, then notify listeners.
fn dispatch(
    event: &FileEvent,
    mapper: &Arc<RepoMapper>,
    callback: &Arc<Mutex<Option<EventCallback>>>,
    waiter: &Arc<Mutex<Option<mpsc::SyncSender<FileEvent>>>>,
) {
    match event.kind {
        FileEventKind::Created | FileEventKind::Modified => {
            if let Err(err) = mapper.update_on_change(Path::new(&event.path)) {
                log::warn!("incremental update failed for {}: {err}", event.path);
            }
        }
        FileEventKind::Deleted => {
            let rel = mapper.relative_key(&event.path);
            mapper.remove_module(&rel);
        }
        FileEventKind::Moved => {
            if let Some(ref old_path) = event.old_path {
                let old_rel = mapper.relative_key(old_path);
                let new_rel = mapper.relative_key(&event.path);
                mapper.rename_module(&old_rel, &new_rel);
            }
        }
    }

    if let Ok(guard) = callback.lock() {
        if let Some(ref callback) = *guard {
            callback(event);
        }
    }

    let sender = waiter.lock().ok().and_then(|mut guard| guard.take());
    if let Some(sender) = sender {
        let _ = sender.try_send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn wait_for_module(mapper: &RepoMapper, rel: &str, present: bool) -> bool {
        for _ in 0..100 {
            let found = mapper
                .with_map(|map| map.modules.contains_key(rel))
                .unwrap_or(false);
            if found == present {
                return true;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        false
    }

    #[test]
    fn test_create_event_updates_map() {
        let dir = TempDir::new().unwrap();
        let mapper = Arc::new(RepoMapper::new(dir.path()).unwrap());
        mapper.scan(false).unwrap();

        let monitor = FileMonitor::new(Arc::clone(&mapper));
        monitor.start(&[], true).unwrap();

        // Give the watcher a moment to register before writing
        std::thread::sleep(Duration::from_millis(200));
        fs::write(dir.path().join("x.py"), "def fresh():\n    pass\n").unwrap();

        let event = monitor.wait_for_change(Duration::from_secs(5)).expect("event arrives");
        assert!(event.path.ends_with("x.py"));
        assert_eq!(event.kind, FileEventKind::Created);

        assert!(wait_for_module(&mapper, "x.py", true));
        monitor.stop();
    }

    #[test]
    fn test_delete_event_removes_module() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("gone.py"), "x = 1\n").unwrap();
        let mapper = Arc::new(RepoMapper::new(dir.path()).unwrap());
        mapper.scan(false).unwrap();
        assert!(mapper.with_map(|m| m.modules.contains_key("gone.py")).unwrap());

        let monitor = FileMonitor::new(Arc::clone(&mapper));
        monitor.start(&[], true).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        fs::remove_file(dir.path().join("gone.py")).unwrap();
        assert!(wait_for_module(&mapper, "gone.py", false));
        monitor.stop();
    }

    #[test]
    fn test_wait_for_change_times_out() {
        let dir = TempDir::new().unwrap();
        let mapper = Arc::new(RepoMapper::new(dir.path()).unwrap());
        let monitor = FileMonitor::new(mapper);
        monitor.start(&[], true).unwrap();

        let event = monitor.wait_for_change(Duration::from_millis(300));
        assert!(event.is_none());
        monitor.stop();
    }

    #[test]
    fn test_status_and_restart() {
        let dir = TempDir::new().unwrap();
        let mapper = Arc::new(RepoMapper::new(dir.path()).unwrap());
        let monitor = FileMonitor::new(mapper);

        assert!(!monitor.status().is_monitoring);

        monitor.start(&[], true).unwrap();
        let status = monitor.status();
        assert!(status.is_monitoring);
        assert_eq!(status.watched_paths.len(), 1);

        monitor.stop();
        assert!(!monitor.status().is_monitoring);
        assert!(monitor.status().watched_paths.is_empty());

        // A stopped monitor starts again with a fresh observer
        monitor.start(&[], true).unwrap();
        assert!(monitor.status().is_monitoring);
        monitor.stop();
    }

    #[test]
    fn test_callback_receives_events() {
        let dir = TempDir::new().unwrap();
        let mapper = Arc::new(RepoMapper::new(dir.path()).unwrap());
        mapper.scan(false).unwrap();

        let monitor = FileMonitor::new(Arc::clone(&mapper));
        let seen: Arc<Mutex<Vec<FileEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.set_callback(Some(Box::new(move |event| {
            if let Ok(mut events) = sink.lock() {
                events.push(event.clone());
            }
        })));

        monitor.start(&[], true).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        fs::write(dir.path().join("cb.py"), "x = 1\n").unwrap();

        assert!(wait_for_module(&mapper, "cb.py", true));
        // The callback fires after the mapper update
        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert!(seen.lock().unwrap().iter().any(|e| e.path.ends_with("cb.py")));
        monitor.stop();
    }
}

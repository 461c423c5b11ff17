//! Process-wide filesystem watch registry.
//!
//! Watches are taken on the canonicalized parent directory of each
//! subscribed file (non-recursive), so atomic `rename` writes are seen the
//! same way as in-place writes. Directory watches are reference-counted:
//! the last subscriber for a directory tears its watch down, and the
//! underlying `notify` watcher is dropped once nothing is watched.
//!
//! Events travel from the notify thread over a channel to a dispatcher
//! thread, which invokes callbacks outside the registry mutex.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{io_err, SyncError};

/// Invoked with the subscribed path on every create/modify event for it.
pub type WatchCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Handle returned by [`WatchRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    path: PathBuf,
}

impl Subscription {
    /// Canonical path the subscription is keyed by.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Default)]
struct RegistryState {
    watcher: Option<RecommendedWatcher>,
    next_id: u64,
    subscribers: HashMap<PathBuf, Vec<(u64, WatchCallback)>>,
    watched_dirs: HashMap<PathBuf, usize>,
}

#[derive(Clone, Default)]
pub struct WatchRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every [`SharedState`](crate::SharedState) in
    /// this process.
    pub fn global() -> &'static WatchRegistry {
        static GLOBAL: OnceLock<WatchRegistry> = OnceLock::new();
        GLOBAL.get_or_init(WatchRegistry::new)
    }

    /// Subscribe `callback` to changes of the file at `path`.
    ///
    /// The parent directory must exist; the file itself need not.
    pub fn subscribe(
        &self,
        path: &Path,
        callback: WatchCallback,
    ) -> Result<Subscription, SyncError> {
        let key = watch_key(path)?;
        let dir = key
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io_err(&key, std::io::Error::other("watched path has no parent")))?;

        let mut state = self.lock_state();
        if state.watcher.is_none() {
            state.watcher = Some(spawn_watcher(Arc::downgrade(&self.state))?);
        }

        if !state.watched_dirs.contains_key(&dir) {
            let watched = match state.watcher.as_mut() {
                Some(watcher) => watcher.watch(&dir, RecursiveMode::NonRecursive),
                None => Ok(()),
            };
            if let Err(err) = watched {
                if state.watched_dirs.is_empty() {
                    state.watcher = None;
                }
                return Err(err.into());
            }
            tracing::debug!(path = %dir.display(), "watching document directory");
        }
        *state.watched_dirs.entry(dir).or_insert(0) += 1;

        state.next_id += 1;
        let id = state.next_id;
        state
            .subscribers
            .entry(key.clone())
            .or_default()
            .push((id, callback));

        Ok(Subscription { id, path: key })
    }

    /// Detach `subscription`. Unknown or already-removed handles are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut state = self.lock_state();

        let Some(callbacks) = state.subscribers.get_mut(&subscription.path) else {
            return;
        };
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != subscription.id);
        if callbacks.len() == before {
            return;
        }
        if callbacks.is_empty() {
            state.subscribers.remove(&subscription.path);
        }

        let Some(dir) = subscription.path.parent().map(Path::to_path_buf) else {
            return;
        };
        let remaining = match state.watched_dirs.get_mut(&dir) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining > 0 {
            return;
        }

        state.watched_dirs.remove(&dir);
        if let Some(watcher) = state.watcher.as_mut() {
            if let Err(err) = watcher.unwatch(&dir) {
                tracing::debug!(path = %dir.display(), error = %err, "unwatch failed");
            }
        }
        if state.watched_dirs.is_empty() {
            state.watcher = None;
            tracing::debug!("no watched directories left; dropped watcher");
        }
    }

    /// Number of live subscriptions for the file at `path`.
    pub fn subscriber_count(&self, path: &Path) -> usize {
        let Ok(key) = watch_key(path) else {
            return 0;
        };
        self.lock_state()
            .subscribers
            .get(&key)
            .map_or(0, Vec::len)
    }

    /// Number of directories currently under an OS-level watch.
    pub fn watched_directories(&self) -> usize {
        self.lock_state().watched_dirs.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("WatchRegistry")
            .field("paths", &state.subscribers.len())
            .field("watched_dirs", &state.watched_dirs.len())
            .finish()
    }
}

fn spawn_watcher(state: Weak<Mutex<RegistryState>>) -> Result<RecommendedWatcher, SyncError> {
    let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
    let watcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    std::thread::Builder::new()
        .name("jsonshare-watch".to_string())
        .spawn(move || dispatch_events(state, event_rx))
        .map_err(|e| io_err("jsonshare-watch thread", e))?;

    Ok(watcher)
}

// Ends when the watcher (and with it the sender) is dropped.
fn dispatch_events(state: Weak<Mutex<RegistryState>>, events: mpsc::Receiver<notify::Result<Event>>) {
    for event in events {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "watcher event error");
                continue;
            }
        };
        if !is_relevant_event_kind(&event.kind) {
            continue;
        }

        let Some(shared) = state.upgrade() else { break };
        let targets: Vec<(PathBuf, WatchCallback)> = {
            let state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            let targets = event
                .paths
                .iter()
                .filter_map(|path| state.subscribers.get(path).map(|subs| (path, subs)))
                .flat_map(|(path, subs)| {
                    subs.iter()
                        .map(move |(_, callback)| (path.clone(), callback.clone()))
                })
                .collect();
            targets
        };

        for (path, callback) in targets {
            callback(&path);
        }
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

// Event paths arrive as real paths (e.g. /private/var/... on macOS), so key
// subscriptions by the canonical directory joined with the file name.
fn watch_key(path: &Path) -> Result<PathBuf, SyncError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io_err(path, std::io::Error::other("watched path has no file name")))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let dir = fs::canonicalize(dir).map_err(|e| io_err(dir, e))?;
    Ok(dir.join(file_name))
}

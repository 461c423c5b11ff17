//! Shared state: one mirror kept in sync with one document file.
//!
//! ## Flows
//!
//! - **Local change**: a mirror mutation calls the sync listener, which bumps
//!   the request counter and wakes the persist task. The task debounces,
//!   takes the marker lock, writes the whole snapshot and releases the lock.
//! - **External change**: the watch registry forwards file events to the
//!   reload task, which reads the file and replaces the mirror's key set
//!   while the updating-from-file flag is raised, so the replacement does not
//!   schedule a persist.
//!
//! Persist, reload and readiness polling all hold the per-instance I/O gate,
//! so they never overlap within one instance. The gate also remembers the
//! content last written or loaded; a reload that reads exactly that content
//! is this instance's own write echoing back and is skipped, and a persist
//! whose snapshot equals it has nothing to write.
//!
//! Whenever the mirror ends up holding more than the file (seed values at
//! open, or seed values surviving a readiness merge) a persist is scheduled
//! so the file catches up.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch, Notify};

use jsonshare_core::{
    document,
    mirror::Mirror,
    paths::{
        default_directory, document_path_at, DEFAULT_LOCK_TIMEOUT, DEFAULT_PERSIST_DEBOUNCE,
        DEFAULT_READY_MAX_POLLS, DEFAULT_READY_POLL_INTERVAL,
    },
    CoreError, Document, DocumentId, MirrorChange,
};
use jsonshare_lock::{LockOptions, MarkerLock};

use crate::error::SyncError;
use crate::watch::{Subscription, WatchCallback, WatchRegistry};

/// Construction options for [`SharedState`].
#[derive(Debug, Clone)]
pub struct SharedStateOptions {
    /// Directory holding `<id>.json`; `None` means [`default_directory`].
    pub directory: Option<PathBuf>,
    /// Delete the document and lock marker on dispose.
    pub cleanup_on_dispose: bool,
    /// Seed values; keys already present in the file win.
    pub initial: Document,
    pub lock_timeout: Duration,
    /// Quiet period after a change before the write starts.
    pub persist_debounce: Duration,
    pub ready_poll_interval: Duration,
    pub ready_max_polls: u32,
    pub lock: LockOptions,
}

impl Default for SharedStateOptions {
    fn default() -> Self {
        Self {
            directory: None,
            cleanup_on_dispose: true,
            initial: Document::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
            ready_poll_interval: DEFAULT_READY_POLL_INTERVAL,
            ready_max_polls: DEFAULT_READY_MAX_POLLS,
            lock: LockOptions::default(),
        }
    }
}

impl SharedStateOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    #[must_use]
    pub fn with_cleanup_on_dispose(mut self, cleanup: bool) -> Self {
        self.cleanup_on_dispose = cleanup;
        self
    }

    #[must_use]
    pub fn with_initial(mut self, initial: Document) -> Self {
        self.initial = initial;
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_persist_debounce(mut self, debounce: Duration) -> Self {
        self.persist_debounce = debounce;
        self
    }

    #[must_use]
    pub fn with_ready_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.ready_poll_interval = interval;
        self.ready_max_polls = max_polls;
        self
    }

    #[must_use]
    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_directory)
    }
}

#[derive(Debug)]
struct LoopFlags {
    updating_from_file: AtomicBool,
    disposed: AtomicBool,
    initialized: AtomicBool,
    /// Bumped once per persist-worthy mutation.
    requested: AtomicU64,
}

/// Raised while the mirror is being overwritten from the file.
struct UpdatingFromFile<'a>(&'a AtomicBool);

impl<'a> UpdatingFromFile<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for UpdatingFromFile<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistOutcome {
    Written,
    /// The file already holds the mirror's content.
    Unchanged,
    LockTimeout,
    Skipped,
}

/// Result of the latest persist attempt, as reported by `flush()`.
#[derive(Debug, Clone)]
enum PersistStatus {
    Clean,
    LockTimeout,
    Failed(Arc<SyncError>),
}

#[derive(Debug, Clone)]
struct Progress {
    /// Request count covered by the latest attempt.
    through: u64,
    status: PersistStatus,
}

impl Progress {
    fn settled() -> Self {
        Self {
            through: u64::MAX,
            status: PersistStatus::Clean,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadOutcome {
    Reloaded,
    Unchanged,
    Failed,
    Skipped,
}

struct Inner {
    id: DocumentId,
    path: PathBuf,
    lock: MarkerLock,
    options: SharedStateOptions,
    mirror: Mutex<Mirror>,
    flags: Arc<LoopFlags>,
    persist_signal: Arc<Notify>,
    /// Content last written or loaded by this instance.
    io_gate: tokio::sync::Mutex<Option<Document>>,
    progress: watch::Sender<Progress>,
    shutdown: broadcast::Sender<()>,
    registry: WatchRegistry,
    subscription: Mutex<Option<Subscription>>,
}

/// A mirror of one shared JSON document.
///
/// Dropping the handle disposes it.
pub struct SharedState {
    inner: Arc<Inner>,
}

impl SharedState {
    /// Open (or create) the document `id` and start synchronizing.
    ///
    /// Must be called from within a Tokio runtime; the persist and reload
    /// tasks are spawned on it.
    pub fn open(
        id: impl Into<DocumentId>,
        options: SharedStateOptions,
    ) -> Result<Self, SyncError> {
        Self::open_with_registry(id, options, WatchRegistry::global())
    }

    pub fn open_with_registry(
        id: impl Into<DocumentId>,
        options: SharedStateOptions,
        registry: &WatchRegistry,
    ) -> Result<Self, SyncError> {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let id = id.into();
        let path = document_path_at(&options.resolved_directory(), &id)?;

        document::ensure_exists_at(&path)?;
        let loaded = document::load_at(&path);
        let initialized = !loaded.is_empty();
        let seed = document::merge(options.initial.clone(), loaded.clone());
        let seeded_beyond_file = seed != loaded;

        let flags = Arc::new(LoopFlags {
            updating_from_file: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            initialized: AtomicBool::new(initialized),
            requested: AtomicU64::new(0),
        });
        let persist_signal = Arc::new(Notify::new());

        let mut mirror = Mirror::new(seed);
        {
            let flags = flags.clone();
            let signal = persist_signal.clone();
            mirror.subscribe(move |_, _| {
                if flags.disposed.load(Ordering::SeqCst)
                    || flags.updating_from_file.load(Ordering::SeqCst)
                {
                    return;
                }
                flags.requested.fetch_add(1, Ordering::SeqCst);
                signal.notify_one();
            });
        }

        let (progress, _) = watch::channel(Progress {
            through: 0,
            status: PersistStatus::Clean,
        });
        let (shutdown, _) = broadcast::channel(4);
        let lock = MarkerLock::new(&path).with_options(options.lock.clone());

        let inner = Arc::new(Inner {
            id,
            path,
            lock,
            options,
            mirror: Mutex::new(mirror),
            flags,
            persist_signal,
            io_gate: tokio::sync::Mutex::new(Some(loaded)),
            progress,
            shutdown,
            registry: registry.clone(),
            subscription: Mutex::new(None),
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let on_change: WatchCallback = Arc::new(move |_: &Path| {
            let _ = event_tx.send(());
        });
        let subscription = inner.registry.subscribe(&inner.path, on_change)?;
        *lock_unpoisoned(&inner.subscription) = Some(subscription);

        // Seed keys the file lacks are written back so other processes see them.
        if seeded_beyond_file {
            inner.request_persist();
        }

        runtime.spawn(persist_task(inner.clone(), inner.shutdown.subscribe()));
        runtime.spawn(reload_task(
            inner.clone(),
            event_rx,
            inner.shutdown.subscribe(),
        ));

        tracing::debug!(
            id = %inner.id,
            path = %inner.path.display(),
            initialized,
            "opened shared state",
        );
        Ok(Self { inner })
    }

    pub fn id(&self) -> &DocumentId {
        &self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn lock_path(&self) -> &Path {
        self.inner.lock.marker_path()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.flags.initialized.load(Ordering::SeqCst)
    }

    /// Snapshot of the mirror.
    pub fn value(&self) -> Document {
        self.inner.mirror().snapshot()
    }

    /// Replace the whole mirror with `document`.
    pub fn set_value(&self, document: Document) {
        self.inner.mirror().replace(document);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.mirror().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.mirror().set(key, value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.mirror().remove(key)
    }

    /// Edit the mirror in place; at most one persist is scheduled.
    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut Document),
    {
        self.inner.mirror().update(edit);
    }

    /// Register an extra mirror listener.
    ///
    /// Listeners run synchronously under the mirror lock and must not call
    /// back into this `SharedState`.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&MirrorChange, &Document) + Send + Sync + 'static,
    {
        self.inner.mirror().subscribe(listener);
    }

    /// Wait until the mirror has seen nonempty content, or until the polling
    /// bound runs out. Never fails; an empty document is a valid outcome.
    pub async fn ready(&self) -> Document {
        let inner = &self.inner;
        for _ in 0..inner.options.ready_max_polls {
            if inner.flags.initialized.load(Ordering::SeqCst) || inner.is_disposed() {
                break;
            }
            tokio::time::sleep(inner.options.ready_poll_interval).await;
            if inner.poll_for_content().await {
                break;
            }
        }
        inner.flags.initialized.store(true, Ordering::SeqCst);
        self.value()
    }

    /// Wait until every persist scheduled before this call has been
    /// attempted, and report how the latest attempt went.
    ///
    /// Returns [`SyncError::LockTimeout`] when the write was abandoned because
    /// another writer held the lock, and [`SyncError::Persist`] when the lock
    /// or the write itself failed. The mirror keeps the change either way; the
    /// next mutation retries. Returns `Ok` at once after disposal.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Ok(());
        }
        let wanted = inner.flags.requested.load(Ordering::SeqCst);
        let mut progress = inner.progress.subscribe();
        let status = match progress.wait_for(|p| p.through >= wanted).await {
            Ok(latest) => latest.status.clone(),
            Err(_) => return Ok(()),
        };
        match status {
            PersistStatus::Clean => Ok(()),
            PersistStatus::LockTimeout => Err(SyncError::LockTimeout {
                path: inner.lock.marker_path().to_path_buf(),
                timeout: inner.options.lock_timeout,
            }),
            PersistStatus::Failed(err) => Err(SyncError::Persist(err)),
        }
    }

    /// Stop synchronizing. Safe to call repeatedly; later mutations stay in
    /// memory only.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.flags.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = inner.shutdown.send(());
        inner.progress.send_replace(Progress::settled());

        if let Some(subscription) = lock_unpoisoned(&inner.subscription).take() {
            inner.registry.unsubscribe(&subscription);
        }
        if inner.options.cleanup_on_dispose {
            inner.remove_files();
        }
        tracing::debug!(id = %inner.id, "disposed shared state");
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.flags.disposed.load(Ordering::SeqCst)
    }

    fn mirror(&self) -> MutexGuard<'_, Mirror> {
        lock_unpoisoned(&self.mirror)
    }

    fn request_persist(&self) {
        self.flags.requested.fetch_add(1, Ordering::SeqCst);
        self.persist_signal.notify_one();
    }

    /// Mutate the mirror with persists suppressed.
    fn apply_from_file<T>(&self, apply: impl FnOnce(&mut Mirror) -> T) -> T {
        let mut mirror = self.mirror();
        let _updating = UpdatingFromFile::raise(&self.flags.updating_from_file);
        apply(&mut mirror)
    }

    async fn persist(&self) -> Result<PersistOutcome, SyncError> {
        let mut last = self.io_gate.lock().await;
        if self.is_disposed() {
            return Ok(PersistOutcome::Skipped);
        }

        if last.as_ref() == Some(&self.mirror().snapshot()) {
            return Ok(PersistOutcome::Unchanged);
        }

        let Some(guard) = self.lock.guard(self.options.lock_timeout).await? else {
            return Ok(PersistOutcome::LockTimeout);
        };

        let snapshot = self.mirror().snapshot();
        let path = self.path.clone();
        let to_write = snapshot.clone();
        tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
            document::ensure_exists_at(&path)?;
            document::save_at(&path, &to_write)
        })
        .await
        .map_err(|_| SyncError::TaskJoin("persist"))??;
        drop(guard);

        *last = Some(snapshot);
        // dispose() ran while this write was in flight.
        if self.is_disposed() && self.options.cleanup_on_dispose {
            self.remove_files();
        }
        Ok(PersistOutcome::Written)
    }

    async fn reload(&self) -> ReloadOutcome {
        let mut last = self.io_gate.lock().await;
        if self.is_disposed() || self.flags.updating_from_file.load(Ordering::SeqCst) {
            return ReloadOutcome::Skipped;
        }

        let path = self.path.clone();
        let loaded = match tokio::task::spawn_blocking(move || document::read_at(&path)).await {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(CoreError::Empty { .. })) => {
                tracing::debug!(path = %self.path.display(), "document empty; keeping mirror");
                return ReloadOutcome::Failed;
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "reload failed; keeping last known state",
                );
                return ReloadOutcome::Failed;
            }
            Err(err) => {
                tracing::warn!(error = %err, "reload task join failure");
                return ReloadOutcome::Failed;
            }
        };

        if last.as_ref() == Some(&loaded) {
            return ReloadOutcome::Unchanged;
        }

        let changed = self.apply_from_file(|mirror| mirror.replace(loaded.clone()));
        if !loaded.is_empty() {
            self.flags.initialized.store(true, Ordering::SeqCst);
        }
        *last = Some(loaded);

        if changed {
            tracing::debug!(id = %self.id, "reloaded mirror from file");
            ReloadOutcome::Reloaded
        } else {
            ReloadOutcome::Unchanged
        }
    }

    /// One readiness poll. Returns `true` once nonempty content was merged.
    async fn poll_for_content(&self) -> bool {
        let mut last = self.io_gate.lock().await;
        if self.is_disposed() {
            return false;
        }

        let path = self.path.clone();
        let loaded = tokio::task::spawn_blocking(move || document::load_at(&path))
            .await
            .unwrap_or_default();
        if loaded.is_empty() {
            return false;
        }

        let merged = self.apply_from_file(|mirror| {
            mirror.merge(loaded.clone());
            mirror.snapshot()
        });
        self.flags.initialized.store(true, Ordering::SeqCst);
        if merged != loaded {
            self.request_persist();
        }
        *last = Some(loaded);
        true
    }

    fn remove_files(&self) {
        if let Err(err) = document::remove_at(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to remove document");
        }
        if let Err(err) = self.lock.release() {
            tracing::warn!(error = %err, "failed to remove lock marker");
        }
    }
}

async fn persist_task(inner: Arc<Inner>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = inner.persist_signal.notified() => {}
        }
        if !inner.options.persist_debounce.is_zero() {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(inner.options.persist_debounce) => {}
            }
        }
        if inner.is_disposed() {
            break;
        }

        let target = inner.flags.requested.load(Ordering::SeqCst);
        let status = match inner.persist().await {
            Ok(PersistOutcome::Written) => {
                tracing::debug!(id = %inner.id, "persisted mirror");
                PersistStatus::Clean
            }
            Ok(PersistOutcome::Unchanged | PersistOutcome::Skipped) => PersistStatus::Clean,
            Ok(PersistOutcome::LockTimeout) => {
                tracing::warn!(
                    path = %inner.path.display(),
                    timeout_ms = inner.options.lock_timeout.as_millis() as u64,
                    "lock busy; persist abandoned until next change",
                );
                PersistStatus::LockTimeout
            }
            Err(err) => {
                if let SyncError::Lock(lock_err) = &err {
                    tracing::error!(error = %lock_err, "lock fault during persist");
                } else {
                    tracing::warn!(path = %inner.path.display(), error = %err, "persist failed");
                }
                PersistStatus::Failed(Arc::new(err))
            }
        };
        inner.progress.send_replace(Progress {
            through: target,
            status,
        });
    }
    inner.progress.send_replace(Progress::settled());
}

async fn reload_task(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => {
                let Some(()) = event else { break };
                // Everything queued so far is covered by one read.
                while events.try_recv().is_ok() {}
            }
        }
        if inner.is_disposed() {
            break;
        }
        inner.reload().await;
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

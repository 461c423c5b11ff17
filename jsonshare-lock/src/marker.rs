//! Marker-file lock.
//!
//! ## Acquire protocol
//!
//! 1. `create_new` the marker and write the owner pid into it.
//! 2. On `AlreadyExists`, stat the marker; if it is older than
//!    `stale_multiplier × timeout`, unlink it and try step 1 again at once.
//! 3. Give up with `Ok(false)` once the timeout has elapsed, otherwise sleep
//!    `retry_interval` and go back to step 1.
//!
//! Exclusive create is the only correctness mechanism. Retrying and stale
//! reclamation only keep contenders live when an owner crashes.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{io_err, LockError};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_STALE_MULTIPLIER: u32 = 2;

const MARKER_SUFFIX: &str = ".lock";

/// `<document>.lock`
pub fn marker_path_for(document: &Path) -> PathBuf {
    let mut name = document.as_os_str().to_owned();
    name.push(MARKER_SUFFIX);
    PathBuf::from(name)
}

/// Tuning for retry cadence and stale-marker reclamation.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Sleep between creation attempts.
    pub retry_interval: Duration,
    /// Markers older than `stale_multiplier × timeout` are reclaimed.
    /// Values below 2 are raised to 2.
    pub stale_multiplier: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stale_multiplier: DEFAULT_STALE_MULTIPLIER,
        }
    }
}

impl LockOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    #[must_use]
    pub fn with_stale_multiplier(mut self, stale_multiplier: u32) -> Self {
        self.stale_multiplier = stale_multiplier;
        self
    }

    /// Age beyond which a marker acquired with `timeout` counts as abandoned.
    pub fn stale_after(&self, timeout: Duration) -> Duration {
        timeout.saturating_mul(self.stale_multiplier.max(DEFAULT_STALE_MULTIPLIER))
    }
}

/// Diagnostic view of an existing marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerInfo {
    /// Marker content, normally the owner's process id. Never used for
    /// correctness.
    pub owner: String,
    pub modified: SystemTime,
    pub age: Duration,
}

/// Lock over a single document path.
#[derive(Debug, Clone)]
pub struct MarkerLock {
    marker: PathBuf,
    options: LockOptions,
}

impl MarkerLock {
    /// Lock guarding `document`; the marker lives at `<document>.lock`.
    pub fn new(document: impl AsRef<Path>) -> Self {
        Self::for_marker(marker_path_for(document.as_ref()))
    }

    /// Lock whose marker is exactly `marker`.
    pub fn for_marker(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
            options: LockOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Try to take the lock within `timeout`.
    ///
    /// Returns `Ok(false)` on contention. At least one creation attempt is
    /// made even when `timeout` is zero.
    pub async fn acquire(&self, timeout: Duration) -> Result<bool, LockError> {
        let started = Instant::now();
        loop {
            if self.try_create()? {
                return Ok(true);
            }
            if self.reclaim_if_stale(timeout)? && self.try_create()? {
                return Ok(true);
            }
            if started.elapsed() >= timeout {
                tracing::debug!(
                    marker = %self.marker.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "lock acquisition timed out",
                );
                return Ok(false);
            }
            tokio::time::sleep(self.options.retry_interval).await;
        }
    }

    /// Scoped acquisition: the returned guard releases the marker on drop.
    pub async fn guard(&self, timeout: Duration) -> Result<Option<LockGuard<'_>>, LockError> {
        if self.acquire(timeout).await? {
            Ok(Some(LockGuard {
                lock: self,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Remove the marker. Releasing an unheld lock succeeds.
    pub fn release(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.marker) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&self.marker, err)),
        }
    }

    /// Best-effort: `false` on any inspection error.
    pub fn is_locked(&self) -> bool {
        fs::symlink_metadata(&self.marker).is_ok()
    }

    pub fn inspect(&self) -> Option<MarkerInfo> {
        let modified = fs::metadata(&self.marker).and_then(|m| m.modified()).ok()?;
        let owner = fs::read_to_string(&self.marker).unwrap_or_default();
        Some(MarkerInfo {
            owner: owner.trim().to_string(),
            modified,
            age: age_of(modified),
        })
    }

    fn try_create(&self) -> Result<bool, LockError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.marker)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(io_err(&self.marker, err)),
        };

        if let Err(err) = file.write_all(std::process::id().to_string().as_bytes()) {
            let _ = fs::remove_file(&self.marker);
            return Err(io_err(&self.marker, err));
        }
        Ok(true)
    }

    /// Unlink the marker if it is stale. `Ok(true)` means it was removed.
    fn reclaim_if_stale(&self, timeout: Duration) -> Result<bool, LockError> {
        let modified = match fs::metadata(&self.marker).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(io_err(&self.marker, err)),
        };

        let age = age_of(modified);
        if age <= self.options.stale_after(timeout) {
            return Ok(false);
        }

        match fs::remove_file(&self.marker) {
            Ok(()) => {
                tracing::warn!(
                    marker = %self.marker.display(),
                    age_ms = age.as_millis() as u64,
                    "reclaimed stale lock marker",
                );
                Ok(true)
            }
            // Another contender reclaimed it first.
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_err(&self.marker, err)),
        }
    }
}

/// Holds a [`MarkerLock`] until dropped or explicitly released.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a MarkerLock,
    released: bool,
}

impl LockGuard<'_> {
    /// Release now and report failure instead of logging it.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.lock.release() {
            tracing::warn!(error = %err, "failed to release lock marker");
        }
    }
}

// Future mtimes (clock skew on shared filesystems) count as fresh.
fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default()
}

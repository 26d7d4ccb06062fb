//! The lock object: the user-facing entity. Owns per-object accounting and
//! exposes explicit acquire/release plus scoped acquisitions for both
//! modes.
//!
//! One object tracks both an exclusive baton hold and a reentrant count of
//! concurrent descriptors behind a single mutex, which is never held across
//! a blocking operation: the baton wait, a census scan, or a poll sleep.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use std::os::unix::fs::MetadataExt as _;

use tracing::debug;

use crate::baton::{Baton, BatonGuard};
use crate::census;
use crate::error::{LockError, Result};
use crate::guard::{ConcurrentGuard, ExclusiveGuard};

/// Default polling period between retries, matching the
/// 100ms cadence the original implementation used.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observable mode of a [`Lock`]: which kind of hold (if any) *this* object
/// currently has. Does not report other objects' or other processes' holds
/// on the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Exclusive,
    Concurrent,
    None,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Exclusive => "EXCLUSIVE",
            Mode::Concurrent => "CONCURRENT",
            Mode::None => "NONE",
        };
        f.write_str(s)
    }
}

impl FromStr for Mode {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXCLUSIVE" => Ok(Mode::Exclusive),
            "CONCURRENT" => Ok(Mode::Concurrent),
            "NONE" => Ok(Mode::None),
            other => Err(LockError::ValueError(format!(
                "unrecognised lock mode {other:?}, expected EXCLUSIVE, CONCURRENT or NONE"
            ))),
        }
    }
}

/// A snapshot of a [`Lock`]'s own accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub mode: Mode,
    pub exclusive: bool,
    pub concurrent: usize,
}

struct Inner {
    exclusive_held: bool,
    exclusive_baton: Option<BatonGuard>,
    concurrent_handles: Vec<File>,
    descriptor_cache: HashSet<String>,
}

/// A handle bound at construction to a lockfile path.
///
/// Any number of concurrent holders (readers), across any number of
/// processes that construct a `Lock` on the same path, may proceed at once.
/// An exclusive holder (writer) proceeds only once no other holder, whether
/// concurrent or exclusive and whether in this process or any other, is
/// active.
pub struct Lock {
    path: PathBuf,
    poll_interval: Duration,
    baton: Baton,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Lock {
    /// Ties a new lock object to `path`, using [`DEFAULT_POLL_INTERVAL`] as
    /// the default polling period.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_poll_interval(path, DEFAULT_POLL_INTERVAL)
    }

    /// Ties a new lock object to `path` with a custom default polling
    /// period, used whenever an acquisition doesn't specify its own.
    pub fn with_poll_interval(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        crate::capability::ensure_supported()?;

        let path = path.into();
        let baton = Baton::open(&path);

        // Trivial acquire/release to trigger host-level validation of the
        // path (permissions, parent existence) without committing to a hold.
        drop(baton.acquire_nowait()?);

        Ok(Self {
            path,
            poll_interval,
            baton,
            inner: Mutex::new(Inner {
                exclusive_held: false,
                exclusive_baton: None,
                concurrent_handles: Vec::new(),
                descriptor_cache: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires `mode`. `poll_interval`/`timeout` default to this object's
    /// configured poll interval and an unbounded wait, respectively.
    pub fn acquire(
        &self,
        mode: Mode,
        poll_interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<&Self> {
        match mode {
            Mode::Exclusive => self.acquire_exclusive(poll_interval, timeout)?,
            Mode::Concurrent => self.acquire_concurrent(poll_interval, timeout)?,
            Mode::None => {
                return Err(LockError::ValueError(
                    "acquire() requires EXCLUSIVE or CONCURRENT, not NONE".to_owned(),
                ))
            }
        }
        Ok(self)
    }

    /// Releases whatever this object currently holds. A no-op if [`Mode::None`].
    pub fn release(&self) -> Result<&Self> {
        match self.mode() {
            Mode::Exclusive => self.release_exclusive()?,
            Mode::Concurrent => self.release_concurrent()?,
            Mode::None => {}
        }
        Ok(self)
    }

    /// Scoped exclusive acquisition: releases automatically when the
    /// returned guard drops.
    pub fn exclusive(
        &self,
        poll_interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<ExclusiveGuard<'_>> {
        self.acquire_exclusive(poll_interval, timeout)?;
        Ok(ExclusiveGuard { lock: self })
    }

    /// Scoped concurrent acquisition: releases automatically when the
    /// returned guard drops.
    pub fn concurrent(
        &self,
        poll_interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<ConcurrentGuard<'_>> {
        self.acquire_concurrent(poll_interval, timeout)?;
        Ok(ConcurrentGuard { lock: self })
    }

    /// This object's own observable mode.
    pub fn mode(&self) -> Mode {
        let inner = self.inner.lock().unwrap();
        derive_mode(&inner)
    }

    /// This object's own accounting, as a snapshot.
    pub fn state(&self) -> State {
        let inner = self.inner.lock().unwrap();
        State {
            mode: derive_mode(&inner),
            exclusive: inner.exclusive_held,
            concurrent: inner.concurrent_handles.len(),
        }
    }

    /// Removes the lockfile if it is unheld and has aged at least
    /// `min_age`. Returns `true` if it was removed.
    pub fn clean(&self, min_age: Duration) -> Result<bool> {
        let Some(baton_guard) = self.baton.acquire_nowait()? else {
            return Ok(false);
        };

        let removed = self.clean_under_baton(min_age);
        drop(baton_guard);
        removed
    }

    fn clean_under_baton(&self, min_age: Duration) -> Result<bool> {
        let still_referenced = self.census_exceeds(1)?;
        if still_referenced {
            debug!(path = ?self.path, "clean: lockfile still referenced, leaving in place");
            return Ok(false);
        }

        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        let age = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_sub(metadata.ctime().max(0) as u64);

        if age < min_age.as_secs() {
            return Ok(false);
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = ?self.path, "clean: removed idle lockfile");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Reports whether more than `n` open descriptors point at this lock's
    /// path. The descriptor cache is taken out of `inner` and put back
    /// around the actual scan, so the mutex is never held across the
    /// filesystem walk inside [`census::exceeds`].
    fn census_exceeds(&self, n: usize) -> Result<bool> {
        let mut cache = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.descriptor_cache)
        };

        let result = census::exceeds(&self.path, n, &mut cache);

        let mut inner = self.inner.lock().unwrap();
        inner.descriptor_cache = cache;
        result
    }

    fn acquire_exclusive(
        &self,
        poll_interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        let interval = poll_interval.unwrap_or(self.poll_interval);
        // A third of the poll interval, to keep the baton's own retry loop
        // responsive relative to the outer census-wait loop.
        let baton_poll_interval = interval / 3;

        let baton_guard = self.baton.acquire(timeout, baton_poll_interval)?;

        loop {
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    drop(baton_guard);
                    return Err(LockError::Timeout {
                        path: self.path.clone(),
                        mode: "EXCLUSIVE",
                        timeout,
                    });
                }
            }

            if !self.census_exceeds(1)? {
                break;
            }

            std::thread::sleep(interval);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.exclusive_held || !inner.concurrent_handles.is_empty() {
            return Err(LockError::Bug {
                invariant: "exclusive acquire observed a pre-existing local holder",
            });
        }
        inner.exclusive_held = true;
        inner.exclusive_baton = Some(baton_guard);
        drop(inner);

        debug!(path = ?self.path, "acquired EXCLUSIVE");
        Ok(())
    }

    pub(crate) fn release_exclusive(&self) -> Result<()> {
        let baton_guard = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.exclusive_held {
                return Err(LockError::Bug {
                    invariant: "release_exclusive called without holding EXCLUSIVE",
                });
            }
            inner.exclusive_held = false;
            inner.exclusive_baton.take()
        };
        drop(baton_guard);

        debug!(path = ?self.path, "released EXCLUSIVE");
        Ok(())
    }

    fn acquire_concurrent(
        &self,
        poll_interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let interval = poll_interval.unwrap_or(self.poll_interval);

        let baton_guard = self.baton.acquire(timeout, interval)?;

        let handle = OpenOptions::new().read(true).write(true).open(&self.path)?;

        // Release the baton immediately: readerness is now durable (the
        // open descriptor is visible to any exclusive-acquirer's census),
        // and holding the baton longer would needlessly serialise readers.
        drop(baton_guard);

        let mut inner = self.inner.lock().unwrap();
        if inner.exclusive_held {
            return Err(LockError::Bug {
                invariant: "concurrent acquire observed exclusive_held=true",
            });
        }
        inner.concurrent_handles.push(handle);
        drop(inner);

        debug!(path = ?self.path, "acquired CONCURRENT");
        Ok(())
    }

    pub(crate) fn release_concurrent(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(handle) = inner.concurrent_handles.pop() else {
            return Err(LockError::Bug {
                invariant: "release_concurrent called with no concurrent handle held",
            });
        };
        drop(inner);
        drop(handle);

        debug!(path = ?self.path, "released CONCURRENT");
        Ok(())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.exclusive_held = false;
        inner.exclusive_baton.take();
        inner.concurrent_handles.clear();
    }
}

fn derive_mode(inner: &Inner) -> Mode {
    if inner.exclusive_held {
        Mode::Exclusive
    } else if !inner.concurrent_handles.is_empty() {
        Mode::Concurrent
    } else {
        Mode::None
    }
}

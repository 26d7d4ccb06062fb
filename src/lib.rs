//! `twlock`: a cross-process, multi-reader / single-writer advisory lock
//! bound to a named path on a POSIX filesystem.
//!
//! Any number of processes that construct a [`Lock`] on the same path
//! coordinate as follows: any number of **concurrent** holders (readers)
//! may proceed simultaneously; an **exclusive** holder (writer) proceeds
//! only when no other holder, whether concurrent or exclusive and whether
//! in this process or any other, is active.
//!
//! The protocol combines a transient whole-file advisory lock on the
//! lockfile (the "baton", [`baton`]) with a census of long-lived open file
//! descriptors on that same path ([`census`]) to implement fair
//! reader/writer semantics across processes without a central coordinator.
//! See [`Lock`] for the public entry point.
//!
//! ```no_run
//! use std::time::Duration;
//! use twlock::{Lock, Mode};
//!
//! let lock = Lock::new("/tmp/example.lock")?;
//!
//! {
//!     let _guard = lock.concurrent(None, Some(Duration::from_secs(5)))?;
//!     // ... read the shared resource ...
//! }
//!
//! lock.acquire(Mode::Exclusive, None, None)?;
//! // ... write the shared resource ...
//! lock.release()?;
//! # Ok::<(), twlock::LockError>(())
//! ```
//!
//! # Non-goals
//!
//! - No fairness/starvation-freedom guarantee between waiters of different
//!   modes: this is opportunistic polling, not a queue.
//! - No durability or atomicity of the resource the lock protects.
//! - No network operation: the lockfile must live on a local filesystem
//!   where advisory whole-file locking and descriptor introspection are
//!   meaningful (reference host: Linux, via `/proc/<pid>/fd/*`).
//! - No deadlock detection: nested or cross-mode acquisition by the same
//!   owner that would self-deadlock is the caller's responsibility.

mod baton;
mod capability;
mod census;
mod error;
mod guard;
mod lock;

pub use error::{LockError, PlatformUnsupportedReason, Result};
pub use guard::{ConcurrentGuard, ExclusiveGuard};
pub use lock::{Lock, Mode, State, DEFAULT_POLL_INTERVAL};

//! Error taxonomy for the locking core.
//!
//! `Timeout` and `PlatformUnsupported` are surfaced to callers verbatim and
//! are never retried internally. `Io` wraps unexpected filesystem failures.
//! `Bug` marks an internal invariant violation; these are not supposed to be
//! reachable, but are returned rather than panicking so a caller can at
//! least log and unwind cleanly.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    /// Caller passed an unusable mode (e.g. [`crate::Mode::None`] to `acquire`,
    /// or an unrecognised mode name via [`std::str::FromStr`]).
    #[error("invalid lock mode: {0}")]
    ValueError(String),

    /// An acquisition did not complete within its deadline.
    #[error("timed out acquiring {mode} lock on {path:?} after {timeout:?}")]
    Timeout {
        path: PathBuf,
        mode: &'static str,
        timeout: Duration,
    },

    /// The host cannot support the protocol: descriptor introspection is
    /// missing, or failed its self-test.
    #[error("platform does not support the descriptor introspection twlock needs: {reason}")]
    PlatformUnsupported { reason: PlatformUnsupportedReason },

    /// Unexpected filesystem failure on the lockfile (creation, stat, open).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated. This should never happen; if you
    /// see this, please file a bug report.
    #[error(
        "twlock internal invariant violated: {invariant} \
         (this is a bug, please report it)"
    )]
    Bug { invariant: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformUnsupportedReason {
    /// No per-process open-descriptor directory (e.g. `/proc`) was found.
    MissingFdIntrospection,
    /// The self-test created two descriptors on a temp file but the census
    /// reported at most one.
    SelfTestUndercount,
    /// The self-test created two descriptors on a temp file but the census
    /// reported more than two.
    SelfTestOvercount,
}

impl fmt::Display for PlatformUnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PlatformUnsupportedReason::MissingFdIntrospection => {
                "no per-process open-descriptor directory is available"
            }
            PlatformUnsupportedReason::SelfTestUndercount => {
                "descriptor census self-test undercounted open descriptors"
            }
            PlatformUnsupportedReason::SelfTestOvercount => {
                "descriptor census self-test overcounted open descriptors"
            }
        };
        f.write_str(msg)
    }
}

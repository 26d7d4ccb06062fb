//! Capability probe: one-shot detection that the host exposes a
//! per-process open-descriptor directory the census can use.
//!
//! A lazily-initialised cell holds the result: the self-test runs exactly
//! once per process, independent of how many [`crate::Lock`] objects
//! exist, and its result is cached for every later call.

use std::collections::HashSet;
use std::fs::File;
use std::sync::OnceLock;

use tracing::warn;

use crate::census;
use crate::error::{LockError, PlatformUnsupportedReason, Result};

static CAPABILITY: OnceLock<std::result::Result<(), PlatformUnsupportedReason>> = OnceLock::new();

/// Runs (or recalls) the capability self-test. Returns `Ok(())` if the host
/// supports the protocol, otherwise `PlatformUnsupported`.
pub(crate) fn ensure_supported() -> Result<()> {
    match CAPABILITY.get_or_init(self_test) {
        Ok(()) => Ok(()),
        Err(reason) => Err(LockError::PlatformUnsupported { reason: *reason }),
    }
}

fn self_test() -> std::result::Result<(), PlatformUnsupportedReason> {
    const UNSUPPORTED: PlatformUnsupportedReason = PlatformUnsupportedReason::MissingFdIntrospection;

    let tmp = tempfile::NamedTempFile::new().map_err(|_| UNSUPPORTED)?;
    let path = tmp.path().to_path_buf();

    // One extra descriptor beyond the temp file's own, so the path has
    // exactly two open descriptors during this test.
    let _second: File = File::open(&path).map_err(|_| UNSUPPORTED)?;

    let mut cache = HashSet::new();
    let over_one = census::exceeds(&path, 1, &mut cache).map_err(|_| UNSUPPORTED)?;
    let over_two = census::exceeds(&path, 2, &mut cache).map_err(|_| UNSUPPORTED)?;

    match (over_one, over_two) {
        (true, false) => Ok(()),
        (false, _) => {
            warn!("descriptor census self-test undercounted open descriptors");
            Err(PlatformUnsupportedReason::SelfTestUndercount)
        }
        (true, true) => {
            warn!("descriptor census self-test overcounted open descriptors");
            Err(PlatformUnsupportedReason::SelfTestOvercount)
        }
    }
}

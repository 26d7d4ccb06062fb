//! Descriptor census: counts system-wide open descriptors pointing at a
//! path, via the per-process open-descriptor directories under `/proc`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Reports whether strictly more than `n` open descriptors in the system
/// currently point at the canonicalised `path`.
///
/// `cache` holds descriptor identities (`"<pid>/<fd>"`) known on a previous
/// call to point at this path; it is consulted first (cheap, likely still
/// valid) and updated in place before falling back to a fresh enumeration.
pub(crate) fn exceeds(path: &Path, n: usize, cache: &mut HashSet<String>) -> Result<bool> {
    let canonical = fs::canonicalize(path)?;
    let mut count = 0usize;
    let mut stale = Vec::new();

    for id in cache.iter() {
        match resolve(id) {
            Some(target) if target == canonical => {
                count += 1;
                if count > n {
                    return Ok(true);
                }
            }
            _ => stale.push(id.clone()),
        }
    }
    for id in &stale {
        cache.remove(id);
    }

    for id in all_fd_entries()? {
        if cache.contains(&id) {
            continue;
        }
        if resolve(&id).as_deref() == Some(canonical.as_path()) {
            cache.insert(id);
            count += 1;
            if count > n {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

/// Resolves the symbolic target of one `"<pid>/<fd>"` descriptor entry.
/// Returns `None` if the process or descriptor vanished mid-scan (expected
/// during concurrent activity); no error escapes this function.
fn resolve(id: &str) -> Option<PathBuf> {
    let (pid, fd) = id.split_once('/')?;
    fs::read_link(format!("/proc/{pid}/fd/{fd}")).ok()
}

/// Enumerates all live `"<pid>/<fd>"` descriptor entries on the host,
/// starting from the caller's own process (the most likely match during
/// normal operation) before expanding to the rest of `/proc`.
fn all_fd_entries() -> Result<Vec<String>> {
    let own_pid = std::process::id().to_string();
    let mut out = Vec::new();

    if let Some(mut own) = list_fds(&own_pid) {
        out.append(&mut own);
    }

    for entry in fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if pid == own_pid || !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if let Some(mut fds) = list_fds(&pid) {
            out.append(&mut fds);
        }
    }

    Ok(out)
}

/// Lists the `"<pid>/<fd>"` entries for one process. Returns `None` if the
/// process has no `fd` directory, e.g. exited or owned by another user;
/// treated as "contributes nothing", not an error.
fn list_fds(pid: &str) -> Option<Vec<String>> {
    let dir = fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
    Some(
        dir.filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
            .map(|fd| format!("{pid}/{fd}"))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn census_sees_second_descriptor() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut cache = HashSet::new();

        assert!(!exceeds(tmp.path(), 1, &mut cache).unwrap());

        let _second = File::open(tmp.path()).unwrap();
        let mut cache = HashSet::new();
        assert!(exceeds(tmp.path(), 1, &mut cache).unwrap());
        assert!(!exceeds(tmp.path(), 2, &mut cache).unwrap());
    }
}

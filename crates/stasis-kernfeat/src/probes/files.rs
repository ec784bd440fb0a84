//! File, filesystem-identity, and descriptor-limit probes.
//!
//! The shared-memory device probe is the one foundational check in the
//! family: restore cannot reason about anonymous shared mappings without
//! knowing which device backs them, so the orchestrator aborts when it
//! fails. Everything else degrades to defaults or `None`.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use tracing::{debug, warn};

use crate::probes::{owned_fd, read_self_maps, read_sysctl_u64, ScratchMap};
use stasis_common::page_size;

/// Default `fs.nr_open` assumed when the sysctl is unreadable.
const NR_OPEN_FALLBACK: u32 = 1024 * 1024;

/// Default `fs.file-max` assumed when the sysctl is unreadable.
const FILE_MAX_FALLBACK: u64 = 8192;

/// Device id backing anonymous shared memory.
///
/// A one-page `MAP_SHARED|MAP_ANONYMOUS` mapping is created and looked up
/// in our own maps listing; its recorded device number is the answer.
/// When the listing does not carry the mapping, `map_files` is tried as a
/// fallback. `Err` means the maps listing itself is unreadable, `Ok(None)`
/// means the device could not be determined either way.
pub fn probe_shmem_dev() -> io::Result<Option<u64>> {
    let map = match ScratchMap::anon(
        page_size(),
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
    ) {
        Ok(map) => map,
        Err(err) => {
            debug!(error = %err, "shared anonymous mapping failed");
            return Ok(None);
        }
    };
    map.touch();

    let entries = read_self_maps()?;
    let addr = map.addr();
    if let Some(entry) = entries.iter().find(|e| e.start == addr) {
        return Ok(Some(entry.dev()));
    }

    debug!("shared mapping not in maps listing, trying map_files");
    let end = addr + page_size() as u64;
    let path = format!("/proc/self/map_files/{addr:x}-{end:x}");
    match stat_dev(&path) {
        Some(dev) => Ok(Some(dev)),
        None => Ok(None),
    }
}

/// `stat` a path and return its device id; every failure is `None`.
pub fn stat_dev(path: &str) -> Option<u64> {
    let c_path = std::ffi::CString::new(path).ok()?;
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::stat(c_path.as_ptr(), st.as_mut_ptr()) };
    if rc != 0 {
        debug!(path, error = %io::Error::last_os_error(), "stat failed");
        return None;
    }
    let st = unsafe { st.assume_init() };
    Some(st.st_dev)
}

/// Whether `/proc/pid/fdinfo` exposes `lock:` lines.
///
/// A scratch descriptor is flocked and its own fdinfo entry inspected;
/// any step failing reports the field as absent.
pub fn probe_fdinfo_lock() -> bool {
    let fd = match scratch_fd() {
        Some(fd) => fd,
        None => {
            debug!("no scratch fd for the fdinfo lock probe");
            return false;
        }
    };

    let rc = unsafe { libc::flock(fd.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        debug!(error = %io::Error::last_os_error(), "flock on scratch fd failed");
        return false;
    }

    let path = format!("/proc/self/fdinfo/{}", fd.as_raw_fd());
    match std::fs::read_to_string(&path) {
        Ok(content) => parse_fdinfo_has_lock(&content),
        Err(err) => {
            debug!(error = %err, "fdinfo entry not readable");
            false
        }
    }
}

/// Look for a `lock:` line in fdinfo content.
pub fn parse_fdinfo_has_lock(content: &str) -> bool {
    content.lines().any(|line| line.starts_with("lock:"))
}

/// An anonymous descriptor suitable for flock, memfd first and an
/// unlinked tmpfile as the fallback.
fn scratch_fd() -> Option<OwnedFd> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_memfd_create,
            c"stasis.lock-probe".as_ptr(),
            libc::MFD_CLOEXEC as libc::c_uint,
        )
    };
    if rc >= 0 {
        return owned_fd(rc as libc::c_int).ok();
    }

    let rc = unsafe {
        libc::open(
            c"/tmp".as_ptr(),
            libc::O_TMPFILE | libc::O_RDWR | libc::O_CLOEXEC,
            0o600,
        )
    };
    owned_fd(rc).ok()
}

/// `fs.nr_open`, with the kernel's long-standing default on failure.
pub fn probe_nr_open() -> u32 {
    match read_sysctl_u64("/proc/sys/fs/nr_open") {
        Some(value) => u32::try_from(value).unwrap_or(u32::MAX),
        None => {
            warn!(fallback = NR_OPEN_FALLBACK, "cannot read fs.nr_open");
            NR_OPEN_FALLBACK
        }
    }
}

/// `fs.file-max`, with a conservative default on failure.
pub fn probe_max_files() -> u64 {
    match read_sysctl_u64("/proc/sys/fs/file-max") {
        Some(value) => value,
        None => {
            warn!(fallback = FILE_MAX_FALLBACK, "cannot read fs.file-max");
            FILE_MAX_FALLBACK
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fdinfo_has_lock() {
        let with_lock = "pos:\t0\nflags:\t02\nmnt_id:\t30\n\
                         lock:\t1: FLOCK  ADVISORY  WRITE 12345 00:2f:100 0 EOF\n";
        assert!(parse_fdinfo_has_lock(with_lock));

        let without = "pos:\t0\nflags:\t02\nmnt_id:\t30\n";
        assert!(!parse_fdinfo_has_lock(without));
        assert!(!parse_fdinfo_has_lock(""));
        // The keyword must start the line, not appear mid-text.
        assert!(!parse_fdinfo_has_lock("flags: lock: nope\n"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_shmem_dev_live() {
        let first = probe_shmem_dev().unwrap();
        let second = probe_shmem_dev().unwrap();
        assert_eq!(first, second);
        if let Some(dev) = first {
            // tmpfs-backed mappings never live on a real block device 0:0.
            assert_ne!(dev, 0);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stat_dev_known_paths() {
        assert!(stat_dev("/").is_some());
        assert!(stat_dev("/definitely/not/a/path").is_none());
        // proc and the root fs are different devices.
        assert_ne!(stat_dev("/proc/self"), stat_dev("/"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_limits_plausible() {
        let nr_open = probe_nr_open();
        assert!(nr_open >= 1024);
        assert_eq!(nr_open, probe_nr_open());
        assert!(probe_max_files() > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_fdinfo_lock_deterministic() {
        assert_eq!(probe_fdinfo_lock(), probe_fdinfo_lock());
    }
}

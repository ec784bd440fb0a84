//! Namespace-introspection probes, all queried lazily.
//!
//! The ioctl probes run against our own namespace descriptors. `ENOTTY`
//! means the kernel predates the ioctl; `EPERM` on `NS_GET_PARENT` of a
//! root namespace means the call exists but the relationship is not
//! visible, which still counts as support.

use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use tracing::debug;

use crate::probes::owned_fd;

const NSIO: libc::c_ulong = 0xb7;
const NS_GET_USERNS: libc::c_ulong = NSIO << 8 | 0x1;
const NS_GET_PARENT: libc::c_ulong = NSIO << 8 | 0x2;

/// `NS_GET_USERNS` ioctl availability, probed on our own netns fd.
pub fn probe_ns_get_userns() -> bool {
    probe_ns_ioctl("/proc/self/ns/net", NS_GET_USERNS, "NS_GET_USERNS")
}

/// `NS_GET_PARENT` ioctl availability, probed on our own pid ns fd.
pub fn probe_ns_get_parent() -> bool {
    probe_ns_ioctl("/proc/self/ns/pid", NS_GET_PARENT, "NS_GET_PARENT")
}

fn probe_ns_ioctl(ns_path: &str, request: libc::c_ulong, name: &str) -> bool {
    let ns = match std::fs::File::open(ns_path) {
        Ok(file) => file,
        Err(err) => {
            debug!(ns_path, error = %err, "namespace fd not openable");
            return false;
        }
    };

    let rc = unsafe { libc::ioctl(ns.as_raw_fd(), request) };
    if rc >= 0 {
        // The ioctl hands back a new namespace fd; release it.
        drop(owned_fd(rc));
        return true;
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOTTY) => false,
        // A root namespace has no visible parent/owner, but the call
        // itself is there.
        Some(libc::EPERM) => true,
        _ => {
            debug!(probe = name, error = %err, "ns ioctl failed unexpectedly");
            false
        }
    }
}

/// `/proc/pid/status` carries `NSpid:` lines.
pub fn probe_nspid() -> bool {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(content) => parse_status_has_nspid(&content),
        Err(err) => {
            debug!(error = %err, "own status not readable");
            false
        }
    }
}

/// Look for an `NSpid:` field in status content.
pub fn parse_status_has_nspid(content: &str) -> bool {
    content.lines().any(|line| line.starts_with("NSpid:"))
}

/// The `pid_for_children` namespace entry exists.
pub fn probe_pid_for_children_ns() -> bool {
    Path::new("/proc/self/ns/pid_for_children").exists()
}

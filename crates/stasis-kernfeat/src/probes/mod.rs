//! Probe primitives.
//!
//! Every function in this family interrogates exactly one kernel facility
//! with the minimum interaction needed, folds all failure outcomes into a
//! typed "absent"/"unknown" classification, and releases whatever it
//! touched (mappings, descriptors, helper children) before returning.
//! Nothing here aborts the process; the two foundational failures are
//! surfaced as [`crate::detect::DetectError`] by the orchestrator.
//!
//! File-backed probes split the kernel interaction (`read_*`/`probe_*`)
//! from content interpretation (`parse_*_content`) so parsers stay
//! testable without the live kernel.

pub mod cpu;
pub mod files;
pub mod memory;
pub mod net;
pub mod ns;
pub mod security;
pub mod vdso;

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

use tracing::debug;

/// One line of `/proc/pid/maps`, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub path: Option<String>,
}

impl MapsEntry {
    /// Device id in `stat.st_dev` encoding.
    pub fn dev(&self) -> u64 {
        libc::makedev(self.dev_major, self.dev_minor)
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Parse one maps line such as
/// `7ffd1c8e4000-7ffd1c8e6000 r-xp 00000000 00:00 0   [vdso]`.
///
/// Returns `None` for any line that does not match the expected shape.
pub fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    let rest = line.trim_start();
    let (range, rest) = rest.split_once(' ')?;
    let (perms, rest) = rest.trim_start().split_once(' ')?;
    let (offset, rest) = rest.trim_start().split_once(' ')?;
    let (dev, rest) = rest.trim_start().split_once(' ')?;
    let (inode, rest) = match rest.trim_start().split_once(' ') {
        Some((inode, tail)) => (inode, tail),
        None => (rest.trim_start(), ""),
    };

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end < start || perms.is_empty() {
        return None;
    }

    let offset = u64::from_str_radix(offset, 16).ok()?;
    let (major, minor) = dev.split_once(':')?;
    let dev_major = u32::from_str_radix(major, 16).ok()?;
    let dev_minor = u32::from_str_radix(minor, 16).ok()?;
    let inode = inode.parse().ok()?;

    let path = rest.trim();
    let path = if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    };

    Some(MapsEntry {
        start,
        end,
        perms: perms.to_string(),
        offset,
        dev_major,
        dev_minor,
        inode,
        path,
    })
}

/// Parse a whole maps listing, skipping lines that do not decode.
pub fn parse_maps_content(content: &str) -> Vec<MapsEntry> {
    content.lines().filter_map(parse_maps_line).collect()
}

/// Read and decode our own maps listing.
pub fn read_self_maps() -> io::Result<Vec<MapsEntry>> {
    let content = std::fs::read_to_string("/proc/self/maps")?;
    Ok(parse_maps_content(&content))
}

/// Parse a single-value sysctl file body.
pub fn parse_sysctl_u64(content: &str) -> Option<u64> {
    content.split_whitespace().next()?.parse().ok()
}

/// Read a numeric sysctl, folding every failure into `None`.
pub fn read_sysctl_u64(path: &str) -> Option<u64> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let value = parse_sysctl_u64(&content);
            if value.is_none() {
                debug!(path, "sysctl value did not parse");
            }
            value
        }
        Err(err) => {
            debug!(path, error = %err, "sysctl not readable");
            None
        }
    }
}

/// Wrap a raw-descriptor syscall return in an `OwnedFd`.
pub(crate) fn owned_fd(ret: libc::c_int) -> io::Result<OwnedFd> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(ret) })
    }
}

/// A scratch anonymous mapping unmapped on drop.
pub(crate) struct ScratchMap {
    addr: *mut libc::c_void,
    len: usize,
}

impl ScratchMap {
    pub(crate) fn anon(len: usize, prot: libc::c_int, flags: libc::c_int) -> io::Result<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                flags | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { addr, len })
    }

    pub(crate) fn addr(&self) -> u64 {
        self.addr as u64
    }

    /// Write one byte so the page is faulted in and marked written.
    pub(crate) fn touch(&self) {
        unsafe { std::ptr::write_volatile(self.addr as *mut u8, 1) };
    }

    /// Read one byte so an untouched page faults in as the zero page.
    pub(crate) fn read_byte(&self) -> u8 {
        unsafe { std::ptr::read_volatile(self.addr as *const u8) }
    }
}

impl Drop for ScratchMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

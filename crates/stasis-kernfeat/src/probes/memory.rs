//! Memory and paging probes.
//!
//! Covers the pagemap interface lattice, soft-dirty tracking, the shared
//! zero page, memfd, userfaultfd, THP disabling, the mmap floor, the
//! stack guard gap, and the userspace address ceiling.

use std::io;
use std::os::unix::fs::FileExt;

use tracing::{debug, warn};

use crate::probes::{read_self_maps, read_sysctl_u64, ScratchMap};
use crate::types::{PagemapMode, UffdFeatures};
use stasis_common::page_size;

/// Soft-dirty bit in a pagemap entry.
pub const PAGEMAP_SOFT_DIRTY: u64 = 1 << 55;
/// Page-present bit in a pagemap entry.
pub const PAGEMAP_PRESENT: u64 = 1 << 63;
/// Page frame number field of a pagemap entry.
pub const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

/// Default `vm.mmap_min_addr` assumed when the sysctl is unreadable.
const MMAP_MIN_ADDR_FALLBACK: u64 = 0x10000;

/// Combined outcome of the pagemap walk.
#[derive(Debug, Clone, Copy)]
pub struct PagemapProbe {
    pub mode: PagemapMode,
    pub soft_dirty: bool,
    pub zero_page_pfn: Option<u64>,
}

/// Classify the pagemap interface and, while at it, observe the
/// soft-dirty bit and the shared zero page.
///
/// The lattice is walked upward: open the file, read an entry, check the
/// PFN field. The first failing step fixes the classification; later
/// steps are not attempted out of order.
pub fn probe_pagemap() -> PagemapProbe {
    let unknown = PagemapProbe {
        mode: PagemapMode::Unknown,
        soft_dirty: false,
        zero_page_pfn: None,
    };

    let file = match std::fs::File::open("/proc/self/pagemap") {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            debug!("pagemap not openable for this user");
            return PagemapProbe {
                mode: PagemapMode::Disabled,
                ..unknown
            };
        }
        Err(err) => {
            debug!(error = %err, "pagemap open failed unexpectedly");
            return unknown;
        }
    };

    let written = match ScratchMap::anon(
        page_size(),
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE,
    ) {
        Ok(map) => map,
        Err(err) => {
            debug!(error = %err, "scratch mapping failed");
            return unknown;
        }
    };
    written.touch();

    let entry = match read_pagemap_entry(&file, written.addr()) {
        Some(entry) => entry,
        None => return unknown,
    };

    let mode = if entry & PAGEMAP_PRESENT != 0 && entry & PAGEMAP_PFN_MASK == 0 {
        PagemapMode::FlagsOnly
    } else {
        PagemapMode::Full
    };
    let soft_dirty = entry & PAGEMAP_SOFT_DIRTY != 0;
    if !soft_dirty {
        debug!("soft-dirty bit not reported for a freshly written page");
    }

    // The zero page backs an untouched read-faulted anonymous page; its
    // frame number is only visible with full pagemap access.
    let zero_page_pfn = if mode == PagemapMode::Full {
        probe_zero_page_pfn(&file)
    } else {
        None
    };

    PagemapProbe {
        mode,
        soft_dirty,
        zero_page_pfn,
    }
}

fn probe_zero_page_pfn(pagemap: &std::fs::File) -> Option<u64> {
    let map = match ScratchMap::anon(page_size(), libc::PROT_READ, libc::MAP_PRIVATE) {
        Ok(map) => map,
        Err(err) => {
            debug!(error = %err, "zero page mapping failed");
            return None;
        }
    };
    map.read_byte();
    let entry = read_pagemap_entry(pagemap, map.addr())?;
    if entry & PAGEMAP_PRESENT == 0 {
        return None;
    }
    Some(entry & PAGEMAP_PFN_MASK)
}

fn read_pagemap_entry(pagemap: &std::fs::File, addr: u64) -> Option<u64> {
    let mut buf = [0u8; 8];
    let offset = (addr / page_size() as u64) * 8;
    match pagemap.read_exact_at(&mut buf, offset) {
        Ok(()) => Some(u64::from_le_bytes(buf)),
        Err(err) => {
            debug!(error = %err, "pagemap entry not readable");
            None
        }
    }
}

/// Whether soft-dirty tracking can drive incremental memory dumps.
pub fn probe_dirty_track(pagemap: &PagemapProbe) -> bool {
    if !pagemap.soft_dirty {
        warn!("dirty tracking is off on this host");
    }
    pagemap.soft_dirty
}

/// Read the lowest mappable address, with the kernel's usual default
/// when the sysctl cannot be read.
pub fn probe_mmap_min_addr() -> u64 {
    match read_sysctl_u64("/proc/sys/vm/mmap_min_addr") {
        Some(value) => value,
        None => {
            warn!(
                fallback = MMAP_MIN_ADDR_FALLBACK,
                "cannot read vm.mmap_min_addr, assuming default"
            );
            MMAP_MIN_ADDR_FALLBACK
        }
    }
}

/// Upper bound of the userspace address range for this architecture.
pub fn task_size() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        0x7fff_ffff_f000
    }
    #[cfg(target_arch = "aarch64")]
    {
        1 << 48
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        1 << 47
    }
}

/// Detect whether the kernel keeps the stack guard gap out of the maps
/// listing.
///
/// A grows-down mapping is created and looked up in our own maps: kernels
/// with the enlarged guard gap report the mapping at its true start,
/// older ones shift the visible start by one page.
pub fn probe_stack_guard_gap() -> bool {
    let len = 3 << 20;
    let map = match ScratchMap::anon(
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_GROWSDOWN,
    ) {
        Ok(map) => map,
        Err(err) => {
            debug!(error = %err, "grows-down mapping failed");
            return false;
        }
    };

    let entries = match read_self_maps() {
        Ok(entries) => entries,
        Err(err) => {
            debug!(error = %err, "maps not readable for guard gap check");
            return false;
        }
    };

    let addr = map.addr();
    let page = page_size() as u64;
    for entry in &entries {
        if entry.start == addr {
            return false;
        }
        if entry.start == addr + page {
            debug!("guard page visible in maps listing");
            return true;
        }
    }
    debug!("grows-down mapping not found in maps listing");
    false
}

/// `PR_GET_THP_DISABLE` availability.
pub fn probe_thp_disable() -> bool {
    const PR_GET_THP_DISABLE: libc::c_int = 42;
    let rc = unsafe { libc::prctl(PR_GET_THP_DISABLE, 0, 0, 0, 0) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            debug!(error = %err, "PR_GET_THP_DISABLE failed unexpectedly");
        }
        return false;
    }
    true
}

/// `memfd_create(2)` availability.
pub fn probe_memfd() -> bool {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_memfd_create,
            c"stasis.probe".as_ptr(),
            0 as libc::c_uint,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOSYS) {
            debug!(error = %err, "memfd_create failed unexpectedly");
        }
        return false;
    }
    unsafe {
        libc::close(rc as libc::c_int);
    }
    true
}

/// userfaultfd API negotiation request/response block.
#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

const UFFD_API: u64 = 0xaa;
const UFFDIO_API: libc::c_ulong = 0xc018_aa3f;

/// Userfaultfd availability plus the negotiated feature bits.
///
/// Every failure (syscall missing, refused by policy, handshake error)
/// reports the interface as absent with empty features. A descriptor
/// whose API negotiation failed is not usable, so a handshake error
/// counts as absent too.
pub fn probe_userfaultfd() -> (bool, UffdFeatures) {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_userfaultfd,
            libc::O_CLOEXEC | libc::O_NONBLOCK,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        debug!(error = %err, "userfaultfd unavailable");
        return (false, UffdFeatures::empty());
    }
    let fd = rc as libc::c_int;

    let mut api = UffdioApi {
        api: UFFD_API,
        features: 0,
        ioctls: 0,
    };
    let negotiated = {
        let rc = unsafe { libc::ioctl(fd, UFFDIO_API, &mut api) };
        if rc < 0 {
            debug!(
                error = %io::Error::last_os_error(),
                "UFFDIO_API handshake failed, treating userfaultfd as absent"
            );
            None
        } else {
            Some(api.features)
        }
    };
    unsafe {
        libc::close(fd);
    }
    classify_uffd_handshake(negotiated)
}

/// Fold the negotiation outcome into the published pair. No handshake
/// means no usable interface, whatever the syscall said.
fn classify_uffd_handshake(negotiated: Option<u64>) -> (bool, UffdFeatures) {
    match negotiated {
        Some(bits) => (true, UffdFeatures(bits)),
        None => (false, UffdFeatures::empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_size_covers_userspace() {
        let size = task_size();
        assert!(size > 1 << 32);
        // The probe scratch mappings must fall below the ceiling.
        let map = ScratchMap::anon(
            page_size(),
            libc::PROT_READ,
            libc::MAP_PRIVATE,
        )
        .unwrap();
        assert!(map.addr() < size);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_pagemap_deterministic() {
        let first = probe_pagemap();
        let second = probe_pagemap();
        assert_eq!(first.mode, second.mode);
        assert_eq!(first.soft_dirty, second.soft_dirty);
        // The zero page frame is a host-wide constant when visible.
        assert_eq!(first.zero_page_pfn, second.zero_page_pfn);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_pagemap_lattice_consistency() {
        let probe = probe_pagemap();
        if probe.zero_page_pfn.is_some() {
            assert_eq!(probe.mode, PagemapMode::Full);
        }
        if probe.soft_dirty {
            assert!(probe.mode >= PagemapMode::FlagsOnly);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_mmap_min_addr_plausible() {
        let floor = probe_mmap_min_addr();
        assert!(floor < task_size());
        assert_eq!(floor, probe_mmap_min_addr());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_memfd_deterministic() {
        assert_eq!(probe_memfd(), probe_memfd());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_userfaultfd_guard() {
        let (available, features) = probe_userfaultfd();
        if !available {
            assert_eq!(features, UffdFeatures::empty());
        }
    }

    #[test]
    fn test_failed_uffd_handshake_reports_absent() {
        assert_eq!(
            classify_uffd_handshake(None),
            (false, UffdFeatures::empty())
        );
    }

    #[test]
    fn test_uffd_handshake_carries_negotiated_bits() {
        assert_eq!(
            classify_uffd_handshake(Some(0x1ff)),
            (true, UffdFeatures(0x1ff))
        );
        // A kernel that negotiates but reports no optional features is
        // still usable.
        assert_eq!(
            classify_uffd_handshake(Some(0)),
            (true, UffdFeatures::empty())
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_thp_disable_deterministic() {
        assert_eq!(probe_thp_disable(), probe_thp_disable());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_stack_guard_gap_deterministic() {
        assert_eq!(probe_stack_guard_gap(), probe_stack_guard_gap());
    }
}

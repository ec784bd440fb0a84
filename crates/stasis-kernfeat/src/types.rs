//! Kernel feature record and classification types.
//!
//! `KernelFeatures` is the flat snapshot of everything detection learns
//! about the running kernel. It is built once by the orchestrator, wrapped
//! by [`crate::registry::FeatureRegistry`] for querying, and serialized as
//! the payload of the on-disk snapshot. Field order is the stable cache
//! encoding order; reordering or resizing fields requires a format magic
//! bump in `cache.rs`.

use serde::{Deserialize, Serialize};

/// How much of the pagemap interface the kernel exposes to us.
///
/// Ordered lattice: each variant strictly extends the previous one.
/// Probing walks the lattice upward and stops at the first failing step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PagemapMode {
    /// Probe could not classify the interface (unexpected errors).
    #[default]
    Unknown,
    /// `/proc/self/pagemap` does not open for this user.
    Disabled,
    /// Entries readable but PFN bits are zeroed for this user.
    FlagsOnly,
    /// Full entries including page frame numbers.
    Full,
}

/// Audit loginuid support level.
///
/// Ordered lattice, probed upward: no file, readable, writable back.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum LoginuidMode {
    /// `/proc/self/loginuid` absent (audit support not built in).
    #[default]
    None,
    /// Value readable but cannot be rewritten.
    ReadOnly,
    /// Value can be cleared and restored, as restore needs.
    Full,
}

/// Active security module, as far as its attribute interfaces reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lsm {
    #[default]
    None,
    AppArmor,
    SeLinux,
}

impl Lsm {
    pub fn as_str(self) -> &'static str {
        match self {
            Lsm::None => "none",
            Lsm::AppArmor => "apparmor",
            Lsm::SeLinux => "selinux",
        }
    }
}

/// Pseudo-filesystems whose instance identity matters for restore.
///
/// A mount of one of these inside a container may be the host's instance
/// or a freshly created one; state found there is only trustworthy when
/// the device identity matches the host's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PseudoFs {
    Devpts,
    Devtmpfs,
    BinfmtMisc,
}

impl PseudoFs {
    pub const ALL: [PseudoFs; 3] = [PseudoFs::Devpts, PseudoFs::Devtmpfs, PseudoFs::BinfmtMisc];

    /// Canonical host path used to learn the host instance's device id.
    pub fn canonical_path(self) -> &'static str {
        match self {
            PseudoFs::Devpts => "/dev/pts",
            PseudoFs::Devtmpfs => "/dev",
            PseudoFs::BinfmtMisc => "/proc/sys/fs/binfmt_misc",
        }
    }

    pub fn index(self) -> usize {
        match self {
            PseudoFs::Devpts => 0,
            PseudoFs::Devtmpfs => 1,
            PseudoFs::BinfmtMisc => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PseudoFs::Devpts => "devpts",
            PseudoFs::Devtmpfs => "devtmpfs",
            PseudoFs::BinfmtMisc => "binfmt_misc",
        }
    }
}

/// Host device ids for the tracked pseudo-filesystems.
///
/// `None` means not yet probed or not determinable; each entry is filled
/// lazily on first comparison request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PseudoFsDevs {
    pub devpts: Option<u64>,
    pub devtmpfs: Option<u64>,
    pub binfmt_misc: Option<u64>,
}

impl PseudoFsDevs {
    pub fn get(&self, which: PseudoFs) -> Option<u64> {
        match which {
            PseudoFs::Devpts => self.devpts,
            PseudoFs::Devtmpfs => self.devtmpfs,
            PseudoFs::BinfmtMisc => self.binfmt_misc,
        }
    }

    pub fn set(&mut self, which: PseudoFs, dev: Option<u64>) {
        match which {
            PseudoFs::Devpts => self.devpts = dev,
            PseudoFs::Devtmpfs => self.devtmpfs = dev,
            PseudoFs::BinfmtMisc => self.binfmt_misc = dev,
        }
    }
}

/// Which lock-wait flag variants the installed iptables binary accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct XtablesLocks(pub u32);

impl XtablesLocks {
    /// `-w` (wait for the xtables lock).
    pub const WAIT: XtablesLocks = XtablesLocks(1 << 0);
    /// `-w -W <usec>` (wait with a poll interval).
    pub const WAIT_INTERVAL: XtablesLocks = XtablesLocks(1 << 1);

    pub fn empty() -> Self {
        XtablesLocks(0)
    }

    pub fn insert(&mut self, other: XtablesLocks) {
        self.0 |= other.0;
    }

    pub fn contains(self, other: XtablesLocks) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Feature bits negotiated through the userfaultfd API handshake.
///
/// Bit values mirror the kernel's `UFFD_FEATURE_*` constants. Only
/// meaningful while userfaultfd itself is available; the registry refuses
/// to hand these out otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UffdFeatures(pub u64);

impl UffdFeatures {
    pub const PAGEFAULT_FLAG_WP: UffdFeatures = UffdFeatures(1 << 0);
    pub const EVENT_FORK: UffdFeatures = UffdFeatures(1 << 1);
    pub const EVENT_REMAP: UffdFeatures = UffdFeatures(1 << 2);
    pub const EVENT_REMOVE: UffdFeatures = UffdFeatures(1 << 3);
    pub const MISSING_HUGETLBFS: UffdFeatures = UffdFeatures(1 << 4);
    pub const MISSING_SHMEM: UffdFeatures = UffdFeatures(1 << 5);
    pub const EVENT_UNMAP: UffdFeatures = UffdFeatures(1 << 6);
    pub const SIGBUS: UffdFeatures = UffdFeatures(1 << 7);
    pub const THREAD_ID: UffdFeatures = UffdFeatures(1 << 8);

    pub fn empty() -> Self {
        UffdFeatures(0)
    }

    pub fn contains(self, other: UffdFeatures) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}

/// One resolved vdso symbol: name and offset from the mapping start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdsoSymbol {
    pub name: String,
    pub offset: u64,
}

/// Parsed symbol table of a vdso image.
///
/// Only the symbols restore relocates are recorded; names the image does
/// not export are simply absent from the list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VdsoSymtable {
    /// Length of the mapping in bytes (0 when no vdso was found).
    pub len: u64,
    pub symbols: Vec<VdsoSymbol>,
}

impl VdsoSymtable {
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn offset_of(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.offset)
    }
}

/// Everything detection learned about the running kernel.
///
/// Startup-probed fields always hold a definite value once the
/// orchestrator returns; lazily-probed fields are `None` until their
/// first query. The struct is the cache payload; see the module doc for
/// the layout-stability rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KernelFeatures {
    /// Device id backing anonymous shared memory mappings.
    pub shmem_dev: u64,
    /// Highest capability number the kernel knows about.
    pub last_cap: u32,
    /// Page frame number of the shared zero page (full pagemap only).
    pub zero_page_pfn: Option<u64>,
    /// Soft-dirty page tracking works.
    pub has_dirty_track: bool,
    /// `memfd_create(2)` is available.
    pub has_memfd: bool,
    /// `/proc/pid/fdinfo` exposes `lock:` lines for flocked files.
    pub has_fdinfo_lock: bool,
    /// Upper bound of the userspace address range.
    pub task_size: u64,
    /// IPv6 sockets can be created.
    pub ipv6: bool,
    /// Audit loginuid support level.
    pub loginuid: LoginuidMode,
    /// 32-bit tasks can be checkpointed/restored on this host.
    pub compat_cr: bool,
    /// Socket diag can attribute sockets to network namespaces.
    pub sock_netns: bool,
    /// Pagemap interface exposure level.
    pub pagemap: PagemapMode,
    /// iptables lock-wait flag variants accepted on this host.
    pub xtables_locks: XtablesLocks,
    /// Lowest mappable address (`vm.mmap_min_addr`).
    pub mmap_min_addr: u64,
    /// TCP_REPAIR can be entered from half-closed states.
    pub has_tcp_half_closed: bool,
    /// Kernel hides the stack guard gap from the maps listing.
    pub stack_guard_gap_hidden: bool,
    /// Active security module.
    pub lsm: Lsm,
    /// userfaultfd syscall is available.
    pub has_userfaultfd: bool,
    /// Negotiated userfaultfd feature bits (valid only with the above).
    pub uffd_features: UffdFeatures,
    /// `PR_GET_THP_DISABLE` is supported.
    pub has_thp_disable: bool,
    /// The compat vdso can be mapped on demand.
    pub can_map_vdso: bool,
    /// vvar/vdso mapping order makes placement hints trustworthy.
    pub vdso_hint_reliable: bool,
    /// Symbol table of the native vdso image.
    pub vdso: VdsoSymtable,
    /// Symbol table of the 32-bit compat vdso image (x86_64 hosts).
    pub vdso_compat: Option<VdsoSymtable>,
    /// Network namespace ids are queryable over netlink.
    pub has_nsid: bool,
    /// Link netnsid attributes are reported.
    pub has_link_nsid: bool,
    /// `fs.nr_open` sysctl value.
    pub sysctl_nr_open: u32,
    /// `fs.file-max` sysctl value.
    pub max_files: u64,
    /// Kernel truncates ptrace xsave reads (pre-4.14 erratum).
    pub x86_ptrace_fpu_xsave_bug: bool,
    /// Lazily probed: `/proc/pid/status` carries `NSpid:` lines.
    pub has_nspid: Option<bool>,
    /// Lazily probed: `NS_GET_USERNS` ioctl exists.
    pub has_ns_get_userns: Option<bool>,
    /// Lazily probed: `NS_GET_PARENT` ioctl exists.
    pub has_ns_get_parent: Option<bool>,
    /// Lazily probed: `/proc/pid/ns/pid_for_children` exists.
    pub has_pid_for_children_ns: Option<bool>,
    /// Lazily probed: TCP_REPAIR usable by this process.
    pub tcp_repair: Option<bool>,
    /// Lazily probed host device ids for pseudo-filesystem identity.
    pub fs_devs: PseudoFsDevs,
    /// When the probe run that produced this snapshot happened (RFC 3339).
    pub probed_at: String,
}

impl KernelFeatures {
    /// One-line summary for logs and human CLI output.
    pub fn summary(&self) -> String {
        format!(
            "pagemap: {:?} | dirty-track: {} | uffd: {} | memfd: {} | vdso syms: {} | lsm: {} | loginuid: {:?} | ipv6: {}",
            self.pagemap,
            yes_no(self.has_dirty_track),
            if self.has_userfaultfd {
                format!("yes (0x{:x})", self.uffd_features.bits())
            } else {
                "no".to_string()
            },
            yes_no(self.has_memfd),
            self.vdso.symbols.len(),
            self.lsm.as_str(),
            self.loginuid,
            yes_no(self.ipv6),
        )
    }
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagemap_lattice_order() {
        assert!(PagemapMode::Unknown < PagemapMode::Disabled);
        assert!(PagemapMode::Disabled < PagemapMode::FlagsOnly);
        assert!(PagemapMode::FlagsOnly < PagemapMode::Full);
    }

    #[test]
    fn test_loginuid_lattice_order() {
        assert!(LoginuidMode::None < LoginuidMode::ReadOnly);
        assert!(LoginuidMode::ReadOnly < LoginuidMode::Full);
    }

    #[test]
    fn test_lattice_defaults_are_bottom() {
        assert_eq!(PagemapMode::default(), PagemapMode::Unknown);
        assert_eq!(LoginuidMode::default(), LoginuidMode::None);
    }

    #[test]
    fn test_xtables_flags() {
        let mut locks = XtablesLocks::empty();
        assert!(locks.is_empty());
        locks.insert(XtablesLocks::WAIT);
        assert!(locks.contains(XtablesLocks::WAIT));
        assert!(!locks.contains(XtablesLocks::WAIT_INTERVAL));
        locks.insert(XtablesLocks::WAIT_INTERVAL);
        assert!(locks.contains(XtablesLocks::WAIT_INTERVAL));
        assert_eq!(locks.bits(), 0b11);
    }

    #[test]
    fn test_uffd_feature_bits() {
        let feats = UffdFeatures(
            UffdFeatures::EVENT_FORK.bits() | UffdFeatures::SIGBUS.bits(),
        );
        assert!(feats.contains(UffdFeatures::EVENT_FORK));
        assert!(feats.contains(UffdFeatures::SIGBUS));
        assert!(!feats.contains(UffdFeatures::THREAD_ID));
    }

    #[test]
    fn test_pseudo_fs_indexing() {
        for (i, fs) in PseudoFs::ALL.iter().enumerate() {
            assert_eq!(fs.index(), i);
        }
        assert!(PseudoFs::Devpts.canonical_path().starts_with("/dev"));
    }

    #[test]
    fn test_pseudo_fs_devs_accessors() {
        let mut devs = PseudoFsDevs::default();
        assert_eq!(devs.get(PseudoFs::Devpts), None);
        devs.set(PseudoFs::Devpts, Some(42));
        assert_eq!(devs.get(PseudoFs::Devpts), Some(42));
        assert_eq!(devs.get(PseudoFs::Devtmpfs), None);
    }

    #[test]
    fn test_vdso_symtable_lookup() {
        let table = VdsoSymtable {
            len: 8192,
            symbols: vec![VdsoSymbol {
                name: "__vdso_time".to_string(),
                offset: 0xa80,
            }],
        };
        assert_eq!(table.offset_of("__vdso_time"), Some(0xa80));
        assert_eq!(table.offset_of("__vdso_getcpu"), None);
    }

    #[test]
    fn test_snapshot_serde_round_trip() {
        let mut features = KernelFeatures {
            shmem_dev: 0x23,
            last_cap: 40,
            pagemap: PagemapMode::Full,
            zero_page_pfn: Some(0x1234),
            loginuid: LoginuidMode::Full,
            lsm: Lsm::AppArmor,
            has_nspid: Some(true),
            probed_at: "2026-01-01T00:00:00+00:00".to_string(),
            ..Default::default()
        };
        features.fs_devs.set(PseudoFs::Devtmpfs, Some(6));

        let json = serde_json::to_string(&features).unwrap();
        let back: KernelFeatures = serde_json::from_str(&json).unwrap();
        assert_eq!(back, features);
    }

    #[test]
    fn test_summary_mentions_key_facts() {
        let features = KernelFeatures {
            has_userfaultfd: true,
            uffd_features: UffdFeatures::SIGBUS,
            ..Default::default()
        };
        let text = features.summary();
        assert!(text.contains("uffd: yes"));
        assert!(text.contains("0x80"));
    }
}

//! The feature registry: startup snapshot plus lazily-probed fields.
//!
//! Startup fields are fixed before the registry is handed out, so they
//! need no guards. Each lazy field has its own `OnceLock`: racing first
//! callers may both run the probe, but the probes are pure functions of
//! host state and all callers settle on one stored value.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::debug;

use crate::cache;
use crate::probes::{files, net, ns};
use crate::types::{
    KernelFeatures, LoginuidMode, PagemapMode, PseudoFs, UffdFeatures, VdsoSymtable,
};

/// Process-wide record of detected kernel features.
///
/// Built once by [`crate::detect`]; later phases hold it by shared
/// reference and only the lazy accessors below write to it.
pub struct FeatureRegistry {
    features: KernelFeatures,
    cache_path: Option<PathBuf>,
    tcp_repair: OnceLock<bool>,
    nspid: OnceLock<bool>,
    ns_get_userns: OnceLock<bool>,
    ns_get_parent: OnceLock<bool>,
    pid_for_children_ns: OnceLock<bool>,
    fs_devs: [OnceLock<Option<u64>>; 3],
}

impl FeatureRegistry {
    /// Wrap a freshly probed or cache-loaded snapshot.
    ///
    /// Lazy values already present in the snapshot (a cache hit from a
    /// run that computed them) seed the corresponding guards so they are
    /// not probed again.
    pub(crate) fn new(features: KernelFeatures, cache_path: Option<PathBuf>) -> Self {
        let registry = Self {
            tcp_repair: OnceLock::new(),
            nspid: OnceLock::new(),
            ns_get_userns: OnceLock::new(),
            ns_get_parent: OnceLock::new(),
            pid_for_children_ns: OnceLock::new(),
            fs_devs: [OnceLock::new(), OnceLock::new(), OnceLock::new()],
            cache_path,
            features,
        };
        if let Some(value) = registry.features.tcp_repair {
            let _ = registry.tcp_repair.set(value);
        }
        if let Some(value) = registry.features.has_nspid {
            let _ = registry.nspid.set(value);
        }
        if let Some(value) = registry.features.has_ns_get_userns {
            let _ = registry.ns_get_userns.set(value);
        }
        if let Some(value) = registry.features.has_ns_get_parent {
            let _ = registry.ns_get_parent.set(value);
        }
        if let Some(value) = registry.features.has_pid_for_children_ns {
            let _ = registry.pid_for_children_ns.set(value);
        }
        for which in PseudoFs::ALL {
            if let Some(dev) = registry.features.fs_devs.get(which) {
                let _ = registry.fs_devs[which.index()].set(Some(dev));
            }
        }
        registry
    }

    /// The startup-probed feature record.
    pub fn features(&self) -> &KernelFeatures {
        &self.features
    }

    /// Soft-dirty page tracking works on this host.
    pub fn has_dirty_track(&self) -> bool {
        self.features.has_dirty_track
    }

    /// Pagemap interface exposure level.
    pub fn pagemap(&self) -> PagemapMode {
        self.features.pagemap
    }

    /// Audit loginuid support level.
    pub fn loginuid(&self) -> LoginuidMode {
        self.features.loginuid
    }

    /// Negotiated userfaultfd feature bits, or `None` when the interface
    /// is absent.
    ///
    /// Consumers must go through this guard instead of reading the raw
    /// bits; the bits are meaningless without the syscall.
    pub fn userfaultfd(&self) -> Option<UffdFeatures> {
        if self.features.has_userfaultfd {
            Some(self.features.uffd_features)
        } else {
            None
        }
    }

    /// Symbol table of the native vdso image.
    pub fn vdso(&self) -> &VdsoSymtable {
        &self.features.vdso
    }

    /// TCP repair usable by this process (lazy).
    pub fn tcp_repair(&self) -> bool {
        self.lazy_bool(&self.tcp_repair, "tcp_repair", net::probe_tcp_repair)
    }

    /// `NSpid:` lines present in `/proc/pid/status` (lazy).
    pub fn has_nspid(&self) -> bool {
        self.lazy_bool(&self.nspid, "nspid", ns::probe_nspid)
    }

    /// `NS_GET_USERNS` ioctl available (lazy).
    pub fn has_ns_get_userns(&self) -> bool {
        self.lazy_bool(&self.ns_get_userns, "ns_get_userns", ns::probe_ns_get_userns)
    }

    /// `NS_GET_PARENT` ioctl available (lazy).
    pub fn has_ns_get_parent(&self) -> bool {
        self.lazy_bool(&self.ns_get_parent, "ns_get_parent", ns::probe_ns_get_parent)
    }

    /// `pid_for_children` namespace entry available (lazy).
    pub fn has_pid_for_children_ns(&self) -> bool {
        self.lazy_bool(
            &self.pid_for_children_ns,
            "pid_for_children_ns",
            ns::probe_pid_for_children_ns,
        )
    }

    /// First-call path for a lazy boolean probe. Racing callers may all
    /// run the probe; the probes are pure functions of host state, so
    /// every result agrees and only one is stored.
    fn lazy_bool(&self, guard: &OnceLock<bool>, name: &str, probe: fn() -> bool) -> bool {
        if let Some(&value) = guard.get() {
            return value;
        }
        let probed = probe();
        debug!(probe = name, value = probed, "lazy probe ran");
        let value = *guard.get_or_init(|| probed);
        self.persist_lazy();
        value
    }

    /// Whether the filesystem instance behind `dev` is a separate
    /// (virtualized) instance rather than the host's.
    ///
    /// The host device id for each tracked pseudo-filesystem is learned
    /// on first use. `None` means the host side could not be determined,
    /// so no comparison is possible.
    pub fn fs_virtualized(&self, which: PseudoFs, dev: u64) -> Option<bool> {
        let guard = &self.fs_devs[which.index()];
        let host = match guard.get() {
            Some(&host) => host,
            None => {
                let probed = files::stat_dev(which.canonical_path());
                debug!(fs = which.as_str(), ?probed, "lazy probe: fs host device");
                let host = *guard.get_or_init(|| probed);
                self.persist_lazy();
                host
            }
        };
        host.map(|host_dev| host_dev != dev)
    }

    /// Snapshot the registry including any lazy values computed so far.
    ///
    /// This is what the cache persists, so a later run inherits the lazy
    /// answers too.
    pub fn snapshot(&self) -> KernelFeatures {
        let mut features = self.features.clone();
        features.tcp_repair = self.tcp_repair.get().copied();
        features.has_nspid = self.nspid.get().copied();
        features.has_ns_get_userns = self.ns_get_userns.get().copied();
        features.has_ns_get_parent = self.ns_get_parent.get().copied();
        features.has_pid_for_children_ns = self.pid_for_children_ns.get().copied();
        for which in PseudoFs::ALL {
            if let Some(dev) = self.fs_devs[which.index()].get() {
                features.fs_devs.set(which, *dev);
            }
        }
        features
    }

    /// Best-effort refresh of the on-disk snapshot after a lazy probe.
    fn persist_lazy(&self) {
        let Some(path) = &self.cache_path else {
            return;
        };
        if let Err(err) = cache::save(path, &self.snapshot()) {
            debug!(error = %err, "lazy snapshot refresh failed");
        }
    }
}

impl std::fmt::Debug for FeatureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("features", &self.features)
            .field("cache_path", &self.cache_path)
            .finish_non_exhaustive()
    }
}

//! Probe orchestration.
//!
//! `KernelFeatures::detect` runs every startup probe in dependency order
//! and wraps the result in a [`FeatureRegistry`]; `registry()` memoizes
//! one detection for the whole process. Only the two foundational
//! failures abort: the process's own maps listing being unreadable, and
//! the shared-memory device identity being undeterminable. Everything
//! else degrades to an "absent" or "unknown" classification.

use std::path::PathBuf;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::{debug, info};

use crate::cache;
use crate::probes::{cpu, files, memory, net, security, vdso};
use crate::registry::FeatureRegistry;
use crate::types::KernelFeatures;

/// Fatal initialization failures.
///
/// Everything the checkpoint engine does later assumes these two facts
/// are known; proceeding without them would risk a corrupt dump.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("cannot read /proc/self/maps: {source}")]
    ProcMapsUnreadable {
        #[source]
        source: std::io::Error,
    },
    #[error("cannot determine the shared-memory device id")]
    ShmemDevUndetermined,
}

impl DetectError {
    /// Whether the failure traces back to an access denial, so callers
    /// can tell "run with more privilege" apart from a broken host.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            DetectError::ProcMapsUnreadable { source } => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            DetectError::ShmemDevUndetermined => false,
        }
    }
}

/// Detection knobs, injectable for tests and the CLI.
#[derive(Debug, Clone)]
pub struct DetectConfig {
    /// Snapshot location; `None` means the well-known default.
    pub cache_path: Option<PathBuf>,
    /// Load and persist snapshots at all.
    pub use_cache: bool,
    /// Ignore an existing snapshot but still write a fresh one.
    pub refresh: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            use_cache: true,
            refresh: false,
        }
    }
}

impl KernelFeatures {
    /// Run kernel feature detection.
    ///
    /// Tries the snapshot cache first (unless refreshing); a validated
    /// snapshot skips every probe. A fresh probe run is persisted
    /// best-effort before returning.
    pub fn detect(config: &DetectConfig) -> Result<FeatureRegistry, DetectError> {
        let cache_path = config
            .cache_path
            .clone()
            .unwrap_or_else(cache::default_cache_path);
        let persist_path = config.use_cache.then(|| cache_path.clone());

        if config.use_cache && !config.refresh {
            if let Some(features) = cache::load(&cache_path) {
                return Ok(FeatureRegistry::new(features, persist_path));
            }
        }

        let features = run_startup_probes()?;
        info!(summary = %features.summary(), "kernel feature detection complete");

        if config.use_cache {
            if let Err(err) = cache::save(&cache_path, &features) {
                debug!(error = %err, "snapshot persist failed, continuing");
            }
        }
        Ok(FeatureRegistry::new(features, persist_path))
    }
}

/// The startup probe sequence. Order matters: LSM colors the reading of
/// later permission errors, the pagemap walk feeds dirty tracking, the
/// address-space ceiling bounds vdso discovery, and the shmem device
/// check is the foundational gate.
fn run_startup_probes() -> Result<KernelFeatures, DetectError> {
    let lsm = security::probe_lsm();
    debug!(lsm = lsm.as_str(), "security module detected");

    let pagemap = memory::probe_pagemap();
    let has_dirty_track = memory::probe_dirty_track(&pagemap);

    let shmem_dev = match files::probe_shmem_dev() {
        Ok(Some(dev)) => dev,
        Ok(None) => return Err(DetectError::ShmemDevUndetermined),
        Err(source) => return Err(DetectError::ProcMapsUnreadable { source }),
    };

    let task_size = memory::task_size();
    let mmap_min_addr = memory::probe_mmap_min_addr();
    let stack_guard_gap_hidden = memory::probe_stack_guard_gap();
    let has_thp_disable = memory::probe_thp_disable();

    let has_memfd = memory::probe_memfd();
    let (has_userfaultfd, uffd_features) = memory::probe_userfaultfd();

    let vdso = vdso::probe_vdso(task_size);

    let has_fdinfo_lock = files::probe_fdinfo_lock();
    let sysctl_nr_open = files::probe_nr_open();
    let max_files = files::probe_max_files();

    let ipv6 = net::probe_ipv6();
    let sock_netns = net::probe_sock_netns();
    let has_tcp_half_closed = net::probe_tcp_half_closed();

    let last_cap = security::probe_last_cap();
    let loginuid = security::probe_loginuid();
    let xtables_locks = security::probe_xtables_locks();

    let has_nsid = net::probe_nsid();
    let has_link_nsid = net::probe_link_nsid(has_nsid);

    let compat_cr = cpu::probe_compat_cr();
    let x86_ptrace_fpu_xsave_bug = cpu::probe_ptrace_fpu_xsave_bug();

    Ok(KernelFeatures {
        shmem_dev,
        last_cap,
        zero_page_pfn: pagemap.zero_page_pfn,
        has_dirty_track,
        has_memfd,
        has_fdinfo_lock,
        task_size,
        ipv6,
        loginuid,
        compat_cr,
        sock_netns,
        pagemap: pagemap.mode,
        xtables_locks,
        mmap_min_addr,
        has_tcp_half_closed,
        stack_guard_gap_hidden,
        lsm,
        has_userfaultfd,
        uffd_features,
        has_thp_disable,
        can_map_vdso: vdso.can_map,
        vdso_hint_reliable: vdso.hint_reliable,
        vdso: vdso.table,
        vdso_compat: vdso.compat,
        has_nsid,
        has_link_nsid,
        sysctl_nr_open,
        max_files,
        x86_ptrace_fpu_xsave_bug,
        has_nspid: None,
        has_ns_get_userns: None,
        has_ns_get_parent: None,
        has_pid_for_children_ns: None,
        tcp_repair: None,
        fs_devs: Default::default(),
        probed_at: chrono::Utc::now().to_rfc3339(),
    })
}

/// Process-wide registry, detected once with default configuration.
///
/// The first caller pays for detection; everyone else gets the memoized
/// result, including a memoized failure.
pub fn registry() -> Result<&'static FeatureRegistry, &'static DetectError> {
    static REGISTRY: OnceLock<Result<FeatureRegistry, DetectError>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| KernelFeatures::detect(&DetectConfig::default()))
        .as_ref()
}

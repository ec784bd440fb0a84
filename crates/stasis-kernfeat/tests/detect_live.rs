//! End-to-end detection on the build host.
//!
//! These tests run on arbitrary kernels, so they never assert that a
//! particular feature is present; they assert determinism, lattice
//! membership, and the guards around conditional fields.

#![cfg(target_os = "linux")]

use stasis_kernfeat::{DetectConfig, KernelFeatures, LoginuidMode, PagemapMode, PseudoFs};

fn detect() -> stasis_kernfeat::FeatureRegistry {
    KernelFeatures::detect(&DetectConfig {
        cache_path: None,
        use_cache: false,
        refresh: false,
    })
    .unwrap()
}

#[test]
fn detection_twice_yields_identical_snapshots() {
    let first = detect();
    let second = detect();
    let mut a = first.features().clone();
    let mut b = second.features().clone();
    // The wall-clock stamp is the only field allowed to differ.
    a.probed_at.clear();
    b.probed_at.clear();
    assert_eq!(a, b);
}

#[test]
fn every_startup_field_is_definite() {
    let registry = detect();
    let features = registry.features();

    assert_ne!(features.shmem_dev, 0);
    assert!(features.task_size > 1 << 32);
    assert!(features.mmap_min_addr < features.task_size);
    assert!(features.last_cap >= 37);
    assert!(features.sysctl_nr_open >= 1024);
    assert!(features.max_files > 0);
    assert!(!features.probed_at.is_empty());
    assert!(matches!(
        features.pagemap,
        PagemapMode::Unknown
            | PagemapMode::Disabled
            | PagemapMode::FlagsOnly
            | PagemapMode::Full
    ));
    assert!(matches!(
        features.loginuid,
        LoginuidMode::None | LoginuidMode::ReadOnly | LoginuidMode::Full
    ));
}

#[test]
fn dependent_fields_respect_their_guards() {
    let registry = detect();
    let features = registry.features();

    // Zero page frame only with full pagemap access.
    if features.zero_page_pfn.is_some() {
        assert_eq!(features.pagemap, PagemapMode::Full);
    }
    // Dirty tracking needs a readable pagemap.
    if features.has_dirty_track {
        assert!(features.pagemap >= PagemapMode::FlagsOnly);
    }
    // Feature bits only through the guard, only when uffd exists.
    match registry.userfaultfd() {
        Some(_) => assert!(features.has_userfaultfd),
        None => assert!(!features.has_userfaultfd),
    }
    // Link nsid is gated on nsid.
    if features.has_link_nsid {
        assert!(features.has_nsid);
    }
    // The compat table only appears when the compat vdso is mappable.
    if features.vdso_compat.is_some() {
        assert!(features.can_map_vdso);
    }
    // Resolved vdso symbols stay inside the mapping.
    for sym in &features.vdso.symbols {
        assert!(sym.offset < features.vdso.len);
    }
}

#[test]
fn lazy_queries_are_memoized_and_stable() {
    let registry = detect();
    assert_eq!(registry.tcp_repair(), registry.tcp_repair());
    assert_eq!(registry.has_nspid(), registry.has_nspid());
    assert_eq!(registry.has_ns_get_userns(), registry.has_ns_get_userns());
    assert_eq!(registry.has_ns_get_parent(), registry.has_ns_get_parent());
    assert_eq!(
        registry.has_pid_for_children_ns(),
        registry.has_pid_for_children_ns()
    );
}

#[test]
fn concurrent_lazy_first_callers_converge() {
    let registry = detect();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = &registry;
                scope.spawn(move || {
                    if i % 2 == 0 {
                        registry.tcp_repair()
                    } else {
                        registry.has_ns_get_parent();
                        registry.tcp_repair()
                    }
                })
            })
            .collect();
        let values: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(values.iter().all(|&v| v == values[0]));
    });
}

#[test]
fn fs_virtualization_answers_are_consistent() {
    let registry = detect();
    for which in PseudoFs::ALL {
        let first = registry.fs_virtualized(which, 0x1234_5678);
        assert_eq!(first, registry.fs_virtualized(which, 0x1234_5678));
        // The host's own device id is never reported as virtualized.
        if let Some(host_dev) = registry.snapshot().fs_devs.get(which) {
            assert_eq!(registry.fs_virtualized(which, host_dev), Some(false));
        }
    }
}

#[test]
fn snapshot_round_trips_through_json() {
    let registry = detect();
    registry.has_nspid();
    let snapshot = registry.snapshot();
    let json = serde_json::to_string(&snapshot).unwrap();
    let back: KernelFeatures = serde_json::from_str(&json).unwrap();
    assert_eq!(back, snapshot);
}

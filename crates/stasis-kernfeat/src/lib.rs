//! Kernel feature detection for stasis.
//!
//! Checkpoint/restore correctness depends on dozens of optional kernel
//! interfaces whose presence varies by version, build configuration, and
//! sandboxing. This crate probes them once per invocation, records the
//! findings in a process-wide [`FeatureRegistry`], and persists a
//! validated snapshot so later runs on an unchanged host skip probing.
//!
//! Entry points:
//! - [`registry()`] — the memoized process-wide registry.
//! - [`KernelFeatures::detect`] — explicit detection with injectable
//!   cache configuration (tests, the CLI).
//!
//! Probes never panic and never abort detection except for the two
//! foundational failures in [`DetectError`]; an absent kernel feature is
//! a value, not an error.

pub mod cache;
pub mod detect;
pub mod helper;
pub mod probes;
pub mod registry;
pub mod types;

pub use cache::{CacheError, CacheVerdict};
pub use detect::{registry, DetectConfig, DetectError};
pub use registry::FeatureRegistry;
pub use types::{
    KernelFeatures, LoginuidMode, Lsm, PagemapMode, PseudoFs, UffdFeatures, VdsoSymbol,
    VdsoSymtable, XtablesLocks,
};

//! Stasis common foundations.
//!
//! This crate provides pieces shared across stasis components:
//! - Host identity helpers (uname, kernel version, boot id, page size)
//! - Common error types
//! - Exit codes for CLI binaries

pub mod error;
pub mod exit_codes;
pub mod host;

pub use error::HostError;
pub use exit_codes::ExitCode;
pub use host::{boot_id, kernel_version, page_size, utsname, KernelVersion, Utsname};

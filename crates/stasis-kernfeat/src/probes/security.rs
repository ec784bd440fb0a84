//! Security-module, capability-ceiling, loginuid, and xtables probes.
//!
//! LSM detection runs first in the startup order because the meaning of
//! later permission refusals depends on which module is enforcing.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::helper::run_probe_command;
use crate::probes::read_sysctl_u64;
use crate::types::{LoginuidMode, Lsm, XtablesLocks};

/// Highest capability number this build knows about
/// (CAP_CHECKPOINT_RESTORE), used when the sysctl is unreadable.
const LAST_CAP_FALLBACK: u32 = 40;

/// The kernel's "loginuid unset" sentinel.
const LOGINUID_UNSET: u32 = u32::MAX;

/// Ceiling for the iptables flag probes.
const XTABLES_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Highest capability number the running kernel supports.
pub fn probe_last_cap() -> u32 {
    match read_sysctl_u64("/proc/sys/kernel/cap_last_cap") {
        Some(value) => u32::try_from(value).unwrap_or(LAST_CAP_FALLBACK),
        None => {
            warn!(
                fallback = LAST_CAP_FALLBACK,
                "cannot read kernel.cap_last_cap"
            );
            LAST_CAP_FALLBACK
        }
    }
}

/// Classify the active security module from its filesystem surfaces.
pub fn probe_lsm() -> Lsm {
    if Path::new("/sys/kernel/security/apparmor").exists() {
        return Lsm::AppArmor;
    }
    if Path::new("/sys/fs/selinux").exists() {
        return Lsm::SeLinux;
    }
    Lsm::None
}

/// Walk the loginuid lattice: absent file, readable, rewritable.
///
/// Writability is tested by writing the unset sentinel and immediately
/// restoring the original value, so the probe leaves no trace. Restore
/// needs full write access to reinstate a task's audit identity.
pub fn probe_loginuid() -> LoginuidMode {
    let content = match std::fs::read_to_string("/proc/self/loginuid") {
        Ok(content) => content,
        Err(err) => {
            debug!(error = %err, "loginuid not readable");
            return LoginuidMode::None;
        }
    };
    let original = content.trim().to_string();
    if original.parse::<u32>().is_err() {
        debug!(value = %original, "loginuid did not parse");
        return LoginuidMode::None;
    }

    if !write_loginuid(&LOGINUID_UNSET.to_string()) {
        return LoginuidMode::ReadOnly;
    }
    if !write_loginuid(&original) {
        // Unset succeeded but the restore did not; the kernel treats the
        // sentinel as "writable again", so this should not happen.
        warn!("loginuid restore failed after probe");
    }
    LoginuidMode::Full
}

fn write_loginuid(value: &str) -> bool {
    let result = std::fs::OpenOptions::new()
        .write(true)
        .open("/proc/self/loginuid")
        .and_then(|mut file| file.write_all(value.as_bytes()));
    match result {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "loginuid write refused");
            false
        }
    }
}

/// Which lock-wait flags the installed iptables binary accepts.
///
/// Each variant is exercised with a harmless list command under a hard
/// timeout. A missing binary or a refused flag leaves its bit unset.
pub fn probe_xtables_locks() -> XtablesLocks {
    let mut locks = XtablesLocks::empty();
    if run_probe_command(
        "iptables",
        &["-w", "-W", "10", "-L", "-n"],
        XTABLES_PROBE_TIMEOUT,
    ) == Some(0)
    {
        locks.insert(XtablesLocks::WAIT);
        locks.insert(XtablesLocks::WAIT_INTERVAL);
    } else if run_probe_command("iptables", &["-w", "-L", "-n"], XTABLES_PROBE_TIMEOUT)
        == Some(0)
    {
        locks.insert(XtablesLocks::WAIT);
    }
    if locks.is_empty() {
        debug!("no iptables lock-wait variant accepted");
    }
    locks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_cap_fallback_is_checkpoint_restore() {
        assert_eq!(LAST_CAP_FALLBACK, 40);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_last_cap_plausible() {
        let cap = probe_last_cap();
        // CAP_AUDIT_READ (37) exists since 3.16; anything older is out
        // of scope for checkpoint/restore.
        assert!(cap >= 37);
        assert_eq!(cap, probe_last_cap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_lsm_deterministic() {
        assert_eq!(probe_lsm(), probe_lsm());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_loginuid_in_lattice() {
        let first = probe_loginuid();
        let second = probe_loginuid();
        assert_eq!(first, second);
        assert!(matches!(
            first,
            LoginuidMode::None | LoginuidMode::ReadOnly | LoginuidMode::Full
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_loginuid_leaves_value_unchanged() {
        let before = std::fs::read_to_string("/proc/self/loginuid").ok();
        let _ = probe_loginuid();
        let after = std::fs::read_to_string("/proc/self/loginuid").ok();
        assert_eq!(before, after);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_xtables_locks_lattice() {
        let locks = probe_xtables_locks();
        // WAIT_INTERVAL implies WAIT; the probe never sets it alone.
        if locks.contains(XtablesLocks::WAIT_INTERVAL) {
            assert!(locks.contains(XtablesLocks::WAIT));
        }
    }
}

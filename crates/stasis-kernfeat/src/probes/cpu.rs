//! CPU and architecture quirk probes.

#[cfg(target_arch = "x86_64")]
use tracing::debug;

#[cfg(target_arch = "x86_64")]
use crate::helper::{ChildStatus, ScopedChild};

/// 32-bit tasks can be checkpointed and restored on this host.
///
/// Requires the compat syscall entry, visible as the `abi.vsyscall32`
/// sysctl on x86_64 kernels built with IA32 emulation. Other
/// architectures have no compat checkpoint mode.
pub fn probe_compat_cr() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::path::Path::new("/proc/sys/abi/vsyscall32").exists()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Pre-4.14 x86 kernels accept an undersized buffer for xsave register
/// reads and silently truncate, corrupting FPU state capture.
///
/// Detected by ptrace-stopping a disposable child and issuing
/// `PTRACE_GETREGSET(NT_X86_XSTATE)` with a buffer far smaller than any
/// real xsave area; a kernel that accepts it has the erratum.
#[cfg(target_arch = "x86_64")]
pub fn probe_ptrace_fpu_xsave_bug() -> bool {
    const NT_X86_XSTATE: libc::c_int = 0x202;
    const SHORT_BUF_LEN: usize = 64;

    let child = ScopedChild::spawn(|| {
        unsafe {
            if libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0) != 0 {
                return 1;
            }
            libc::raise(libc::SIGSTOP);
            // The parent kills us; sleep defensively in case it cannot.
            libc::pause();
        }
        0
    });
    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            debug!(error = %err, "could not fork xsave probe child");
            return false;
        }
    };

    match child.wait_next(libc::WUNTRACED) {
        Ok(ChildStatus::Stopped(libc::SIGSTOP)) => {}
        Ok(status) => {
            debug!(?status, "xsave probe child did not stop");
            return false;
        }
        Err(err) => {
            debug!(error = %err, "xsave probe child wait failed");
            return false;
        }
    }

    let mut buf = [0u8; SHORT_BUF_LEN];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            child.pid(),
            NT_X86_XSTATE as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    // The scoped child is killed and reaped on drop.
    if rc == 0 {
        debug!("kernel accepted an undersized xsave buffer");
        return true;
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        // Fixed kernels refuse the short buffer; chips without xsave
        // have nothing to truncate.
        Some(libc::EFAULT) | Some(libc::EIO) | Some(libc::EINVAL) | Some(libc::ENODEV) => {
            false
        }
        _ => {
            debug!(error = %err, "xsave regset read failed unexpectedly");
            false
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn probe_ptrace_fpu_xsave_bug() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_probe_compat_cr_deterministic() {
        assert_eq!(probe_compat_cr(), probe_compat_cr());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_probe_xsave_bug_deterministic_and_reaps() {
        let first = probe_ptrace_fpu_xsave_bug();
        assert_eq!(first, probe_ptrace_fpu_xsave_bug());
        // No zombie children left behind.
        let rc = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        assert!(rc <= 0);
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[test]
    fn test_xsave_bug_absent_off_x86() {
        assert!(!probe_ptrace_fpu_xsave_bug());
    }
}

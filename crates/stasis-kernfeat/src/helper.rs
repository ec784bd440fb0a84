//! Short-lived helper processes for probes.
//!
//! Some kernel behaviors can only be observed by letting a disposable
//! process perform one irreversible operation (remap its own vdso, be
//! ptrace-stopped) or by running an external binary. Helpers here
//! guarantee the child is reaped on every exit path and that no probe
//! blocks past a fixed deadline.

use std::io;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Ceiling for any helper child before it is killed.
const CHILD_DEADLINE: Duration = Duration::from_secs(5);

/// Poll interval while waiting on a child.
const REAP_POLL: Duration = Duration::from_millis(5);

/// How a helper child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
    Stopped(i32),
}

/// A forked helper child, killed and reaped on drop if still running.
pub struct ScopedChild {
    pid: libc::pid_t,
    reaped: bool,
}

impl ScopedChild {
    /// Fork and run `child_fn` in the child; its return value becomes the
    /// child's exit code. The child never returns to the caller's code.
    pub fn spawn<F: FnOnce() -> i32>(child_fn: F) -> io::Result<Self> {
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                let code = child_fn();
                unsafe { libc::_exit(code & 0xff) };
            }
            pid => Ok(Self { pid, reaped: false }),
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Wait for the next state change, bounded by the helper deadline.
    ///
    /// Pass `libc::WUNTRACED` to also observe stop states (ptrace
    /// helpers). A child that misses the deadline is SIGKILLed and the
    /// kill is reported as `Signaled(SIGKILL)`.
    pub fn wait_next(&mut self, extra_flags: libc::c_int) -> io::Result<ChildStatus> {
        let deadline = Instant::now() + CHILD_DEADLINE;
        loop {
            let mut status: libc::c_int = 0;
            let rc = unsafe {
                libc::waitpid(self.pid, &mut status, libc::WNOHANG | extra_flags)
            };
            match rc {
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    self.reaped = true;
                    return Err(err);
                }
                0 => {
                    if Instant::now() >= deadline {
                        warn!(pid = self.pid, "helper child missed deadline, killing");
                        self.kill_and_reap();
                        return Ok(ChildStatus::Signaled(libc::SIGKILL));
                    }
                    std::thread::sleep(REAP_POLL);
                }
                _ => {
                    let decoded = decode_status(status);
                    if !matches!(decoded, ChildStatus::Stopped(_)) {
                        self.reaped = true;
                    }
                    return Ok(decoded);
                }
            }
        }
    }

    /// Wait until the child exits, killing it at the deadline.
    pub fn wait_exit(&mut self) -> io::Result<ChildStatus> {
        loop {
            match self.wait_next(0)? {
                ChildStatus::Stopped(_) => continue,
                status => return Ok(status),
            }
        }
    }

    fn kill_and_reap(&mut self) {
        if self.reaped {
            return;
        }
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
        let mut status: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(self.pid, &mut status, 0) };
        if rc == -1 {
            debug!(pid = self.pid, "helper child already gone");
        }
        self.reaped = true;
    }
}

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.kill_and_reap();
    }
}

fn decode_status(status: libc::c_int) -> ChildStatus {
    if libc::WIFEXITED(status) {
        ChildStatus::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSTOPPED(status) {
        ChildStatus::Stopped(libc::WSTOPSIG(status))
    } else if libc::WIFSIGNALED(status) {
        ChildStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ChildStatus::Signaled(0)
    }
}

/// Run `child_fn` in a forked child and return its exit code.
///
/// Any spawn or wait failure, or a signal death, folds into `None`.
pub fn probe_in_child<F: FnOnce() -> i32>(child_fn: F) -> Option<i32> {
    let mut child = match ScopedChild::spawn(child_fn) {
        Ok(child) => child,
        Err(err) => {
            debug!(error = %err, "could not fork probe helper");
            return None;
        }
    };
    match child.wait_exit() {
        Ok(ChildStatus::Exited(code)) => Some(code),
        Ok(status) => {
            debug!(?status, "probe helper did not exit cleanly");
            None
        }
        Err(err) => {
            debug!(error = %err, "could not reap probe helper");
            None
        }
    }
}

/// Run an external probe command with a clean environment and a hard
/// timeout, discarding all output.
///
/// Returns the exit code, or `None` when the binary is missing, dies on
/// a signal, or has to be killed at the deadline.
pub fn run_probe_command(program: &str, args: &[&str], timeout: Duration) -> Option<i32> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .env_clear()
        .env("LC_ALL", "C");
    if let Ok(path) = std::env::var("PATH") {
        command.env("PATH", path);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            debug!(program, error = %err, "probe command did not spawn");
            return None;
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return status.code().or_else(|| {
                    debug!(program, "probe command killed by signal");
                    None
                });
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!(program, "probe command timed out, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(REAP_POLL);
            }
            Err(err) => {
                debug!(program, error = %err, "probe command wait failed");
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_in_child_exit_code() {
        assert_eq!(probe_in_child(|| 0), Some(0));
        assert_eq!(probe_in_child(|| 7), Some(7));
    }

    #[test]
    fn test_scoped_child_reaps_on_drop() {
        let child = ScopedChild::spawn(|| {
            unsafe { libc::pause() };
            0
        })
        .unwrap();
        let pid = child.pid();
        drop(child);
        // After drop the pid is reaped; waiting again must fail with ECHILD.
        let rc = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
        assert_eq!(rc, -1);
    }

    #[test]
    fn test_run_probe_command_true_false() {
        let timeout = Duration::from_secs(5);
        assert_eq!(run_probe_command("true", &[], timeout), Some(0));
        assert_eq!(run_probe_command("false", &[], timeout), Some(1));
    }

    #[test]
    fn test_run_probe_command_missing_binary() {
        let timeout = Duration::from_secs(1);
        assert_eq!(
            run_probe_command("definitely-not-a-real-binary-xyz", &[], timeout),
            None
        );
    }

    #[test]
    fn test_run_probe_command_timeout() {
        let start = Instant::now();
        let result = run_probe_command("sleep", &["30"], Duration::from_millis(200));
        assert_eq!(result, None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}

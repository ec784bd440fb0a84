//! Host identity facts.
//!
//! Small, memoized accessors for the facts every stasis component keys off:
//! the kernel release/version strings, the parsed kernel version for
//! feature gating, the boot id, and the system page size. Each is read at
//! most once per process.

use std::sync::OnceLock;

use tracing::debug;

use crate::error::HostError;

/// Captured `uname(2)` fields, converted to owned strings.
#[derive(Debug, Clone)]
pub struct Utsname {
    pub sysname: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

/// Run `uname(2)` and capture the fields we care about.
pub fn try_uname() -> Result<Utsname, HostError> {
    let mut uts = std::mem::MaybeUninit::<libc::utsname>::uninit();
    let rc = unsafe { libc::uname(uts.as_mut_ptr()) };
    if rc != 0 {
        return Err(HostError::Uname(std::io::Error::last_os_error()));
    }
    let uts = unsafe { uts.assume_init() };
    let field = |raw: &[libc::c_char]| unsafe {
        std::ffi::CStr::from_ptr(raw.as_ptr())
            .to_string_lossy()
            .to_string()
    };
    Ok(Utsname {
        sysname: field(&uts.sysname),
        release: field(&uts.release),
        version: field(&uts.version),
        machine: field(&uts.machine),
    })
}

/// Memoized `uname(2)` capture; `None` if the syscall failed.
pub fn utsname() -> Option<&'static Utsname> {
    static UTSNAME: OnceLock<Option<Utsname>> = OnceLock::new();
    UTSNAME
        .get_or_init(|| match try_uname() {
            Ok(uts) => Some(uts),
            Err(err) => {
                debug!(error = %err, "uname unavailable");
                None
            }
        })
        .as_ref()
}

/// Parsed kernel version, ordered for release gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    /// Parse a release string such as `6.1.0-25-amd64` or `5.15.0`.
    ///
    /// Everything after the first `-` (distro suffixes) is ignored; a
    /// missing patch component parses as zero.
    pub fn parse(release: &str) -> Option<Self> {
        let numeric = release.split('-').next()?;
        let mut parts = numeric.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn at_least(self, major: u32, minor: u32, patch: u32) -> bool {
        self >= KernelVersion {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Memoized parsed kernel version from the uname release string.
pub fn kernel_version() -> Option<KernelVersion> {
    static VERSION: OnceLock<Option<KernelVersion>> = OnceLock::new();
    *VERSION.get_or_init(|| {
        let uts = utsname()?;
        let parsed = KernelVersion::parse(&uts.release);
        if parsed.is_none() {
            debug!(release = %uts.release, "unparseable kernel release");
        }
        parsed
    })
}

/// Read the kernel boot id (changes on every boot).
pub fn try_boot_id() -> Result<String, HostError> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .map_err(HostError::BootId)?;
    Ok(raw.trim().to_string())
}

/// Memoized boot id; `None` when the proc file is unavailable.
pub fn boot_id() -> Option<&'static str> {
    static BOOT_ID: OnceLock<Option<String>> = OnceLock::new();
    BOOT_ID
        .get_or_init(|| match try_boot_id() {
            Ok(id) => Some(id),
            Err(err) => {
                debug!(error = %err, "boot id unavailable");
                None
            }
        })
        .as_deref()
}

/// System page size in bytes (memoized, defaults to 4096 on error).
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

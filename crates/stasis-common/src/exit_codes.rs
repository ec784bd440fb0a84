//! Exit codes for stasis CLI binaries.
//!
//! Exit codes communicate operation outcome without requiring output parsing.
//!
//! Exit code ranges:
//! - 0-6: Success/operational outcomes (parse outcome from code, not output)
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

/// Exit codes for stasis operations.
///
/// These codes are a stable contract for automation. Changes require
/// a major version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Success / Operational Outcomes (0-6)
    // ========================================================================
    /// Success: operation completed
    Ok = 0,

    /// No cached state present (informational, not an error)
    NoCache = 1,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments
    ArgsError = 10,

    /// Kernel feature detection failed (foundational probe unusable)
    ProbeError = 11,

    /// Permission denied
    PermissionError = 12,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Check if this exit code indicates operational outcome (codes 0-6).
    /// These are not errors - they communicate workflow state.
    pub fn is_operational(self) -> bool {
        (self as i32) < 10
    }

    /// Check if this exit code is a user/environment error (codes 10-19).
    /// These can be resolved by user action.
    pub fn is_user_error(self) -> bool {
        let code = self as i32;
        (10..20).contains(&code)
    }

    /// Check if this exit code is an internal error (codes 20-29).
    /// These indicate bugs and should be reported.
    pub fn is_internal_error(self) -> bool {
        let code = self as i32;
        code >= 20
    }

    /// Check if this exit code indicates any error requiring attention.
    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Get the error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Ok => "OK",
            ExitCode::NoCache => "OK_NO_CACHE",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ProbeError => "ERR_PROBE",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operational_codes() {
        assert!(ExitCode::Ok.is_operational());
        assert!(ExitCode::NoCache.is_operational());
        assert!(!ExitCode::Ok.is_error());
        assert!(!ExitCode::NoCache.is_error());
    }

    #[test]
    fn test_user_error_codes() {
        assert!(ExitCode::ArgsError.is_user_error());
        assert!(ExitCode::ProbeError.is_user_error());
        assert!(ExitCode::PermissionError.is_user_error());
        assert!(ExitCode::ArgsError.is_error());
        assert!(!ExitCode::ArgsError.is_internal_error());
    }

    #[test]
    fn test_internal_error_codes() {
        assert!(ExitCode::InternalError.is_internal_error());
        assert!(ExitCode::IoError.is_internal_error());
        assert!(!ExitCode::InternalError.is_user_error());
    }

    #[test]
    fn test_code_values_stable() {
        assert_eq!(ExitCode::Ok.as_i32(), 0);
        assert_eq!(ExitCode::NoCache.as_i32(), 1);
        assert_eq!(ExitCode::ArgsError.as_i32(), 10);
        assert_eq!(ExitCode::ProbeError.as_i32(), 11);
        assert_eq!(ExitCode::InternalError.as_i32(), 20);
        assert_eq!(i32::from(ExitCode::IoError), 21);
    }

    #[test]
    fn test_display_includes_name_and_code() {
        let text = ExitCode::ProbeError.to_string();
        assert!(text.contains("ERR_PROBE"));
        assert!(text.contains("11"));
    }
}

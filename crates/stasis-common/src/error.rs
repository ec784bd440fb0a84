//! Errors for host identity helpers.

use thiserror::Error;

/// Errors raised while collecting host identity facts.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("uname failed: {0}")]
    Uname(#[source] std::io::Error),

    #[error("cannot read boot id: {0}")]
    BootId(#[source] std::io::Error),
}

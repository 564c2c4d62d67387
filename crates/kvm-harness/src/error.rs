//! Error types for the harness.

use thiserror::Error;

use crate::result::Outcome;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors that can occur while building, running or tearing down a guest.
///
/// Every variant maps to a reporting [`Outcome`] through
/// [`HarnessError::outcome`], so the runner can tell "the harness could not
/// run the test" (broken) apart from "the test ran and failed".
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A host resource is missing: device node, free memory, mappings.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The hypervisor rejected a request or answered unexpectedly.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The guest stopped for a reason the engine does not handle.
    #[error("execution fault: {reason} (rip={rip})")]
    ExecutionFault {
        reason: String,
        /// Guest instruction pointer, if it could be read.
        rip: RipDisplay,
    },

    /// The guest wrote a status code outside the recognized set.
    #[error("result corruption: {0}")]
    ResultCorruption(String),

    /// Invalid configuration or API misuse.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The host cannot run this test at all.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Creates a resource-unavailable error.
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    /// Creates a protocol-violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Creates an execution fault for the given guest RIP.
    pub fn fault(reason: impl Into<String>, rip: Option<u64>) -> Self {
        Self::ExecutionFault {
            reason: reason.into(),
            rip: RipDisplay(rip),
        }
    }

    /// Returns the reporting outcome for this error.
    pub const fn outcome(&self) -> Outcome {
        match self {
            Self::Unsupported(_) => Outcome::Conf,
            _ => Outcome::Broken,
        }
    }

    /// Returns true if this error means the harness could not run the test.
    pub const fn is_broken(&self) -> bool {
        matches!(self.outcome(), Outcome::Broken)
    }
}

/// Optional guest RIP, rendered as hex or `unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipDisplay(pub Option<u64>);

impl std::fmt::Display for RipDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(rip) => write!(f, "{rip:#x}"),
            None => f.write_str("unknown"),
        }
    }
}

/// Result type for raw hypervisor calls.
pub type KvmResult<T> = std::result::Result<T, KvmError>;

/// Error from a raw hypervisor call: the OS errno plus a message.
#[derive(Debug, Clone)]
pub struct KvmError {
    pub errno: i32,
    pub message: String,
}

impl KvmError {
    /// Creates an error from an errno value.
    pub fn from_errno(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    /// Captures `errno` from the last failed system call.
    pub fn last_os_error() -> Self {
        Self::from(std::io::Error::last_os_error())
    }

    /// Returns true if the call was interrupted by a signal.
    pub const fn is_interrupted(&self) -> bool {
        self.errno == libc::EINTR
    }
}

impl std::fmt::Display for KvmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KVM error ({}): {}", self.errno, self.message)
    }
}

impl std::error::Error for KvmError {}

impl From<std::io::Error> for KvmError {
    fn from(e: std::io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(-1),
            message: e.to_string(),
        }
    }
}

impl From<nix::Error> for KvmError {
    fn from(e: nix::Error) -> Self {
        Self {
            errno: e as i32,
            message: e.to_string(),
        }
    }
}

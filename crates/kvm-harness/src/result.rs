//! Guest/host result protocol.
//!
//! The guest writes a [`ResultRecord`] at the configured result address and
//! then halts (or writes to the completion port). The layout below is a
//! frozen wire contract shared with every guest payload:
//!
//! | offset | size | field       |
//! |--------|------|-------------|
//! | 0      | 4    | `result`    |
//! | 4      | 4    | `lineno`    |
//! | 8      | 8    | `file_addr` |
//! | 16     | ...  | `message`   |
//!
//! All integers are little endian. `message` is NUL terminated and may use
//! the rest of the record, up to [`RESULT_RECORD_SIZE`] bytes in total.

use std::fmt;

use crate::error::{HarnessError, Result};

/// Test passed.
pub const TPASS: i32 = 0;
/// Test failed.
pub const TFAIL: i32 = 1;
/// Test could not run.
pub const TBROK: i32 = 2;
/// Non-fatal problem.
pub const TWARN: i32 = 4;
/// Informational message.
pub const TINFO: i32 = 16;
/// Test is not applicable to this configuration.
pub const TCONF: i32 = 32;

/// Guest has not written a result.
pub const KVM_TNONE: i32 = -1;
/// Guest is done; no further results follow.
pub const KVM_TEXIT: i32 = 0xff;

/// Size of the fixed header in bytes.
pub const RESULT_HEADER_SIZE: usize = 16;

/// Total size of the record including the message buffer.
pub const RESULT_RECORD_SIZE: usize = 0xff0;

/// Largest message the guest can store, without the terminating NUL.
pub const RESULT_MESSAGE_CAPACITY: usize = RESULT_RECORD_SIZE - RESULT_HEADER_SIZE - 1;

/// Generic reporting taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Pass,
    Fail,
    Broken,
    Warn,
    Info,
    Conf,
}

impl Outcome {
    /// Maps a raw status code to an outcome; `None` for anything else.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            TPASS => Some(Self::Pass),
            TFAIL => Some(Self::Fail),
            TBROK => Some(Self::Broken),
            TWARN => Some(Self::Warn),
            TINFO => Some(Self::Info),
            TCONF => Some(Self::Conf),
            _ => None,
        }
    }

    /// Returns the raw status code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Pass => TPASS,
            Self::Fail => TFAIL,
            Self::Broken => TBROK,
            Self::Warn => TWARN,
            Self::Info => TINFO,
            Self::Conf => TCONF,
        }
    }

    /// Returns the conventional label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "TPASS",
            Self::Fail => "TFAIL",
            Self::Broken => "TBROK",
            Self::Warn => "TWARN",
            Self::Info => "TINFO",
            Self::Conf => "TCONF",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a status code coming from guest memory.
///
/// Any `i32` is accepted as input. Codes outside the recognized set,
/// including [`KVM_TNONE`] and [`KVM_TEXIT`], are a protocol corruption and
/// fail with [`HarnessError::ResultCorruption`]; they never yield a pass or
/// fail outcome.
pub fn validate_result(value: i32) -> Result<Outcome> {
    if value == KVM_TNONE {
        return Err(HarnessError::ResultCorruption(
            "KVM test did not return any result".to_string(),
        ));
    }

    Outcome::from_code(value).ok_or_else(|| {
        HarnessError::ResultCorruption(format!("KVM test returned invalid result value {value}"))
    })
}

/// A validated result with its auxiliary value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    /// Auxiliary value, passed through unchanged (the guest source line).
    pub aux: i32,
}

/// The record as read back from guest memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    /// Raw status code.
    pub result: i32,
    /// Auxiliary value.
    pub lineno: i32,
    /// Guest address of the source file name.
    pub file_addr: u64,
    /// Message text.
    pub message: String,
}

impl ResultRecord {
    /// A record that says "no result yet".
    #[must_use]
    pub fn none() -> Self {
        Self {
            result: KVM_TNONE,
            lineno: 0,
            file_addr: 0,
            message: String::new(),
        }
    }

    /// Returns true if the guest signalled that it is done.
    #[must_use]
    pub const fn is_exit(&self) -> bool {
        self.result == KVM_TEXIT
    }

    /// Validates the status code and pairs it with the auxiliary value.
    pub fn verdict(&self) -> Result<Verdict> {
        Ok(Verdict {
            outcome: validate_result(self.result)?,
            aux: self.lineno,
        })
    }

    /// Decodes a record from raw guest bytes.
    ///
    /// Never fails on content: short input is treated as zero filled, the
    /// message stops at the first NUL (or the end of the buffer) and invalid
    /// UTF-8 is replaced.
    #[must_use]
    pub fn decode(raw: &[u8]) -> Self {
        let mut header = [0u8; RESULT_HEADER_SIZE];
        let n = raw.len().min(RESULT_HEADER_SIZE);
        header[..n].copy_from_slice(&raw[..n]);

        let message = raw
            .get(RESULT_HEADER_SIZE..raw.len().min(RESULT_RECORD_SIZE))
            .unwrap_or(&[]);
        let len = message.iter().position(|&b| b == 0).unwrap_or(message.len());

        Self {
            result: i32::from_le_bytes([header[0], header[1], header[2], header[3]]),
            lineno: i32::from_le_bytes([header[4], header[5], header[6], header[7]]),
            file_addr: u64::from_le_bytes([
                header[8], header[9], header[10], header[11], header[12], header[13], header[14],
                header[15],
            ]),
            message: String::from_utf8_lossy(&message[..len]).into_owned(),
        }
    }

    /// Encodes the record the way a guest would write it. The message is
    /// truncated to [`RESULT_MESSAGE_CAPACITY`] bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let msg = self.message.as_bytes();
        let msg = &msg[..msg.len().min(RESULT_MESSAGE_CAPACITY)];

        let mut out = Vec::with_capacity(RESULT_HEADER_SIZE + msg.len() + 1);
        out.extend_from_slice(&self.result.to_le_bytes());
        out.extend_from_slice(&self.lineno.to_le_bytes());
        out.extend_from_slice(&self.file_addr.to_le_bytes());
        out.extend_from_slice(msg);
        out.push(0);
        out
    }
}

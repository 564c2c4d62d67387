//! VM configuration types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    error::{HarnessError, Result},
    memory::{GUEST_ADDR_LIMIT_32, MIB},
    result::RESULT_RECORD_SIZE,
};

/// Default hypervisor device node.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/kvm";

/// Guest address the payload is loaded at.
pub const VM_KERNEL_BASEADDR: u64 = 0x1000;

/// Address of the first instruction fetched after reset.
pub const VM_RESET_BASEADDR: u64 = 0xffff_fff0;

/// Bytes reserved for the reset code.
pub const VM_RESET_CODE_SIZE: usize = 8;

/// Guest address of the shared Result Record.
pub const KVM_RESULT_BASEADDR: u64 = 0xffff_f000;

/// Free memory that must remain on the host, and the minimum guest RAM left
/// over after the payload.
pub const MIN_FREE_RAM: u64 = 10 * MIB;

/// Default guest RAM size.
pub const DEFAULT_RAM_SIZE: u64 = 16 * MIB;

/// I/O port a guest may write to instead of halting to signal completion.
pub const COMPLETION_PORT: u16 = 0x00f4;

/// Reset code: `ljmp 0x0000:0x1000` in 16-bit real mode.
pub const RESET_CODE: [u8; VM_RESET_CODE_SIZE] = [0xea, 0x00, 0x10, 0x00, 0x00, 0, 0, 0];

/// Virtual machine configuration.
///
/// Plain parameters only; the runner decides where the values come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Hypervisor device node.
    pub device_path: PathBuf,
    /// Requested guest RAM size in bytes.
    pub ram_size: u64,
    /// Guest address the payload is copied to.
    pub kernel_base: u64,
    /// Guest address of the reset vector.
    pub reset_base: u64,
    /// Guest address of the Result Record.
    pub result_base: u64,
    /// Free memory that must remain on the host.
    pub min_free_ram: u64,
    /// Port treated as an alternative completion signal; `None` disables it.
    pub completion_port: Option<u16>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            ram_size: DEFAULT_RAM_SIZE,
            kernel_base: VM_KERNEL_BASEADDR,
            reset_base: VM_RESET_BASEADDR,
            result_base: KVM_RESULT_BASEADDR,
            min_free_ram: MIN_FREE_RAM,
            completion_port: Some(COMPLETION_PORT),
        }
    }
}

impl VmConfig {
    /// Creates a new builder for VM configuration.
    #[must_use]
    pub fn builder() -> VmConfigBuilder {
        VmConfigBuilder::default()
    }

    /// Checks the fixed layout: the reset code and the Result Record must
    /// share the last page below 4 GiB and must not overlap each other.
    pub fn validate(&self) -> Result<()> {
        if self.ram_size == 0 {
            return Err(HarnessError::invalid_config("RAM size must be > 0"));
        }

        let reset_end = self.reset_base.saturating_add(VM_RESET_CODE_SIZE as u64);
        if self.reset_base >= GUEST_ADDR_LIMIT_32 || reset_end > GUEST_ADDR_LIMIT_32 {
            return Err(HarnessError::invalid_config(format!(
                "reset code at {:#x} does not fit below 4 GiB",
                self.reset_base
            )));
        }

        let result_end = self.result_base.saturating_add(RESULT_RECORD_SIZE as u64);
        if self.result_base > self.reset_base || result_end > self.reset_base {
            return Err(HarnessError::invalid_config(format!(
                "result record at {:#x} overlaps reset code at {:#x}",
                self.result_base, self.reset_base
            )));
        }

        // Both live in the slot that backs the reset page.
        if self.reset_base - self.result_base >= 2 * MIB {
            return Err(HarnessError::invalid_config(format!(
                "result record at {:#x} is too far from reset code",
                self.result_base
            )));
        }

        if self.kernel_base == 0 || self.kernel_base >= self.ram_size {
            return Err(HarnessError::invalid_config(format!(
                "kernel base {:#x} outside guest RAM",
                self.kernel_base
            )));
        }

        Ok(())
    }
}

/// Builder for [`VmConfig`].
#[derive(Debug, Default)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    /// Sets the hypervisor device node.
    #[must_use]
    pub fn device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.device_path = path.into();
        self
    }

    /// Sets the guest RAM size in bytes.
    #[must_use]
    pub fn ram_size(mut self, size: u64) -> Self {
        self.config.ram_size = size;
        self
    }

    /// Sets the free host memory that must remain after allocation.
    #[must_use]
    pub fn min_free_ram(mut self, size: u64) -> Self {
        self.config.min_free_ram = size;
        self
    }

    /// Sets the completion port.
    #[must_use]
    pub fn completion_port(mut self, port: Option<u16>) -> Self {
        self.config.completion_port = port;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> VmConfig {
        self.config
    }
}

//! Core traits for the hypervisor backend.
//!
//! The harness only talks to the hypervisor through these traits. The Linux
//! KVM backend lives in [`crate::linux`]; tests plug in a scripted backend.

use std::io;
use std::path::Path;

use crate::{
    error::KvmResult,
    memory::MemoryRegion,
    types::{CodeSegment, CpuFeatures, Registers, VcpuExit},
};

/// Source of the host's free memory figure.
pub trait HostMemoryInfo {
    /// Returns the memory available for new allocations, in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the figure cannot be read.
    fn available_memory(&self) -> io::Result<u64>;
}

/// Entry point of a backend: opens the hypervisor device.
pub trait Backend: HostMemoryInfo {
    /// Handle to the opened device.
    type System: HypervisorSystem;

    /// Opens the hypervisor device node.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened.
    fn open(&self, device: &Path) -> KvmResult<Self::System>;
}

/// System-level hypervisor handle (`/dev/kvm`).
pub trait HypervisorSystem {
    /// The VM handle created by this system.
    type Vm: VmHandle;

    /// Returns the hypervisor API version.
    fn api_version(&self) -> KvmResult<i32>;

    /// Returns the size of the per-vCPU control block mapping.
    fn vcpu_mmap_size(&self) -> KvmResult<usize>;

    /// Creates a new VM object.
    fn create_vm(&self) -> KvmResult<Self::Vm>;

    /// Queries the supported CPUID leaves into a buffer of `capacity`
    /// entries. Fails with `E2BIG` when `capacity` is too small.
    fn supported_cpuid(&self, capacity: u32) -> KvmResult<CpuFeatures>;
}

/// VM-level handle.
pub trait VmHandle {
    /// The vCPU handle created by this VM.
    type Vcpu: VcpuHandle;

    /// Installs (or replaces) a guest-physical memory slot backed by host
    /// memory at `host_addr`.
    fn set_user_memory_region(&self, region: &MemoryRegion, host_addr: u64) -> KvmResult<()>;

    /// Creates vCPU `id` and maps its control block of `mmap_size` bytes.
    fn create_vcpu(&self, id: u32, mmap_size: usize) -> KvmResult<Self::Vcpu>;
}

/// vCPU-level handle. Owns the mapped control block.
pub trait VcpuHandle {
    /// Enters the guest and blocks until the next VM exit.
    ///
    /// A run interrupted by a host signal is reported as
    /// [`VcpuExit::Interrupted`], not as an error.
    fn run(&mut self) -> KvmResult<VcpuExit>;

    /// Reads the general purpose registers.
    fn get_regs(&self) -> KvmResult<Registers>;

    /// Writes the general purpose registers.
    fn set_regs(&mut self, regs: &Registers) -> KvmResult<()>;

    /// Loads the code segment base and selector.
    fn set_code_segment(&mut self, segment: CodeSegment) -> KvmResult<()>;

    /// Installs the CPUID leaves the guest will see.
    fn set_cpuid(&mut self, features: &CpuFeatures) -> KvmResult<()>;

    /// Translates a guest linear address to a guest physical address.
    /// Returns `None` if the address is not mapped in the guest.
    fn translate(&self, linear_addr: u64) -> KvmResult<Option<u64>>;

    /// Unmaps the control block. Safe to call more than once.
    fn unmap_control_block(&mut self);
}

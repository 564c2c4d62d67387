//! `/dev/kvm` system handle and host memory accounting.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;

use sysinfo::System;

use crate::{
    error::{KvmError, KvmResult},
    traits::{Backend, HostMemoryInfo, HypervisorSystem},
    types::{CpuFeatures, CpuidEntry},
};

use super::ffi::{
    CpuidBuffer, KVM_CREATE_VM, KVM_GET_API_VERSION, KVM_GET_SUPPORTED_CPUID,
    KVM_GET_VCPU_MMAP_SIZE, ioctl_none, ioctl_ptr,
};
use super::vm::KvmVm;

/// The real KVM backend.
///
/// Free memory is what the kernel reports as available, queried through
/// `sysinfo` on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct KvmBackend;

impl KvmBackend {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HostMemoryInfo for KvmBackend {
    fn available_memory(&self) -> io::Result<u64> {
        let mut sys = System::new();
        sys.refresh_memory();
        match sys.available_memory() {
            0 => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "host did not report available memory",
            )),
            available => Ok(available),
        }
    }
}

impl Backend for KvmBackend {
    type System = KvmSystem;

    fn open(&self, device: &Path) -> KvmResult<KvmSystem> {
        KvmSystem::open(device)
    }
}

/// Safe wrapper for the KVM system handle.
#[derive(Debug)]
pub struct KvmSystem {
    fd: OwnedFd,
}

impl KvmSystem {
    /// Opens the device node.
    pub fn open(device: &Path) -> KvmResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|e| KvmError {
                errno: e.raw_os_error().unwrap_or(-1),
                message: format!("Failed to open {}: {}", device.display(), e),
            })?;

        let fd = unsafe { OwnedFd::from_raw_fd(file.into_raw_fd()) };

        Ok(Self { fd })
    }
}

impl AsRawFd for KvmSystem {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl HypervisorSystem for KvmSystem {
    type Vm = KvmVm;

    fn api_version(&self) -> KvmResult<i32> {
        ioctl_none(self, KVM_GET_API_VERSION)
    }

    fn vcpu_mmap_size(&self) -> KvmResult<usize> {
        let size = ioctl_none(self, KVM_GET_VCPU_MMAP_SIZE)?;
        usize::try_from(size).map_err(|_| KvmError::from_errno(libc::EINVAL, "bad mmap size"))
    }

    fn create_vm(&self) -> KvmResult<KvmVm> {
        let fd = ioctl_none(self, KVM_CREATE_VM)?;
        Ok(KvmVm::new(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn supported_cpuid(&self, capacity: u32) -> KvmResult<CpuFeatures> {
        let mut buffer = CpuidBuffer::with_capacity(capacity);
        unsafe { ioctl_ptr(self.as_raw_fd(), KVM_GET_SUPPORTED_CPUID, buffer.as_mut_ptr())? };

        let entries = buffer
            .entries()
            .into_iter()
            .map(|e| CpuidEntry {
                function: e.function,
                index: e.index,
                flags: e.flags,
                eax: e.eax,
                ebx: e.ebx,
                ecx: e.ecx,
                edx: e.edx,
            })
            .collect();
        Ok(CpuFeatures::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::supported_cpu_features;

    #[test]
    fn test_host_memory_is_readable() {
        let available = KvmBackend::new().available_memory().unwrap();
        assert!(available > 0);

        let mut sys = System::new();
        sys.refresh_memory();
        assert!(available <= sys.total_memory());
    }

    #[test]
    fn test_open_missing_device() {
        let err = KvmSystem::open(Path::new("/nonexistent/kvm")).unwrap_err();
        assert_eq!(err.errno, libc::ENOENT);
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_kvm_open() {
        let kvm = KvmSystem::open(Path::new("/dev/kvm")).expect("Failed to open /dev/kvm");
        assert_eq!(kvm.api_version().unwrap(), 12);
        assert!(kvm.vcpu_mmap_size().unwrap() > 0);
    }

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_supported_cpuid() {
        let kvm = KvmSystem::open(Path::new("/dev/kvm")).expect("Failed to open /dev/kvm");
        assert_eq!(kvm.supported_cpuid(1).unwrap_err().errno, libc::E2BIG);

        let features = supported_cpu_features(&kvm).unwrap().expect("no CPUID");
        assert!(features.leaf(0, 0).is_some());
    }
}

//! KVM VM handle.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::{
    error::{KvmError, KvmResult},
    memory::{Access, MemoryRegion},
    traits::VmHandle,
};

use super::ffi::{
    KVM_CREATE_VCPU, KVM_MEM_READONLY, KVM_SET_USER_MEMORY_REGION, KvmRun,
    KvmUserspaceMemoryRegion, ioctl_ptr, ioctl_val,
};
use super::vcpu::KvmVcpu;

/// Safe wrapper for a KVM VM file descriptor.
#[derive(Debug)]
pub struct KvmVm {
    fd: OwnedFd,
}

impl KvmVm {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for KvmVm {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl VmHandle for KvmVm {
    type Vcpu = KvmVcpu;

    fn set_user_memory_region(&self, region: &MemoryRegion, host_addr: u64) -> KvmResult<()> {
        let mut raw = KvmUserspaceMemoryRegion {
            slot: region.slot,
            flags: match region.access {
                Access::ReadOnly => KVM_MEM_READONLY,
                Access::ReadWrite => 0,
            },
            guest_phys_addr: region.guest_addr.raw(),
            memory_size: region.size,
            userspace_addr: host_addr,
        };

        unsafe { ioctl_ptr(self.as_raw_fd(), KVM_SET_USER_MEMORY_REGION, &mut raw)? };
        Ok(())
    }

    fn create_vcpu(&self, id: u32, mmap_size: usize) -> KvmResult<KvmVcpu> {
        if mmap_size < size_of::<KvmRun>() {
            return Err(KvmError::from_errno(
                libc::EINVAL,
                format!("vCPU mmap size {mmap_size} is smaller than kvm_run"),
            ));
        }

        let ret = ioctl_val(self, KVM_CREATE_VCPU, libc::c_ulong::from(id))?;
        let fd = unsafe { OwnedFd::from_raw_fd(ret) };

        // mmap the kvm_run structure
        let run = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if run == libc::MAP_FAILED {
            return Err(KvmError::last_os_error());
        }

        Ok(KvmVcpu::new(id, fd, run.cast(), mmap_size))
    }
}

//! Virtual CPU implementation for Linux KVM.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::{
    error::{KvmError, KvmResult},
    traits::VcpuHandle,
    types::{CodeSegment, CpuFeatures, Registers, VcpuExit},
};

use super::ffi::{
    CpuidBuffer, KVM_EXIT_DEBUG, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR,
    KVM_EXIT_INTR, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KVM_EXIT_MMIO,
    KVM_EXIT_SHUTDOWN, KVM_GET_REGS, KVM_GET_SREGS, KVM_RUN, KVM_SET_CPUID2, KVM_SET_REGS,
    KVM_SET_SREGS, KVM_TRANSLATE, KvmCpuidEntry2, KvmRegs, KvmRun, KvmSregs, KvmTranslation,
    ioctl_none, ioctl_ptr,
};

/// Virtual CPU implementation for Linux KVM.
///
/// Owns the vCPU file descriptor and the mapped `kvm_run` control block.
pub struct KvmVcpu {
    /// vCPU ID.
    id: u32,
    /// KVM vCPU file descriptor.
    fd: OwnedFd,
    /// Shared control block; null once unmapped.
    kvm_run: *mut KvmRun,
    mmap_size: usize,
}

// Safety: The kvm_run pointer is only accessed through &mut self.
unsafe impl Send for KvmVcpu {}

impl KvmVcpu {
    pub(crate) fn new(id: u32, fd: OwnedFd, kvm_run: *mut KvmRun, mmap_size: usize) -> Self {
        Self {
            id,
            fd,
            kvm_run,
            mmap_size,
        }
    }

    /// Returns the vCPU ID.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    fn control_block(&self) -> KvmResult<&KvmRun> {
        if self.kvm_run.is_null() {
            return Err(KvmError::from_errno(
                libc::EBADF,
                format!("vCPU {} control block is unmapped", self.id),
            ));
        }
        Ok(unsafe { &*self.kvm_run })
    }

    fn get_sregs(&self) -> KvmResult<KvmSregs> {
        let mut sregs = KvmSregs::default();
        unsafe { ioctl_ptr(self.as_raw_fd(), KVM_GET_SREGS, &mut sregs)? };
        Ok(sregs)
    }

    fn set_sregs(&self, sregs: &KvmSregs) -> KvmResult<()> {
        let mut sregs = sregs.clone();
        unsafe { ioctl_ptr(self.as_raw_fd(), KVM_SET_SREGS, &mut sregs)? };
        Ok(())
    }

    /// Converts the exit recorded in the control block.
    fn convert_exit(&self) -> KvmResult<VcpuExit> {
        let run = self.control_block()?;

        let exit = match run.exit_reason {
            KVM_EXIT_HLT => VcpuExit::Halt,
            KVM_EXIT_IO => {
                let io = unsafe { run.exit_data.io };
                match io.direction {
                    KVM_EXIT_IO_OUT => {
                        let width = usize::from(io.size).min(8);
                        let mut bytes = [0u8; 8];
                        let data_offset = usize::try_from(io.data_offset).unwrap_or(usize::MAX);
                        if data_offset.saturating_add(width) <= self.mmap_size {
                            let src = unsafe { self.kvm_run.cast::<u8>().add(data_offset) };
                            unsafe { ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), width) };
                        }
                        VcpuExit::IoOut {
                            port: io.port,
                            size: io.size,
                            data: u64::from_le_bytes(bytes),
                        }
                    }
                    KVM_EXIT_IO_IN => VcpuExit::IoIn {
                        port: io.port,
                        size: io.size,
                    },
                    other => VcpuExit::Unknown(u32::from(other)),
                }
            }
            KVM_EXIT_MMIO => {
                let mmio = unsafe { run.exit_data.mmio };
                let size = u8::try_from(mmio.len.min(8)).unwrap_or(8);
                if mmio.is_write != 0 {
                    VcpuExit::MmioWrite {
                        addr: mmio.phys_addr,
                        size,
                        data: u64::from_le_bytes(mmio.data),
                    }
                } else {
                    VcpuExit::MmioRead {
                        addr: mmio.phys_addr,
                        size,
                    }
                }
            }
            KVM_EXIT_SHUTDOWN => VcpuExit::Shutdown,
            KVM_EXIT_FAIL_ENTRY => VcpuExit::FailEntry {
                reason: unsafe { run.exit_data.fail_entry.hardware_entry_failure_reason },
            },
            KVM_EXIT_INTERNAL_ERROR => VcpuExit::InternalError {
                suberror: unsafe { run.exit_data.internal.suberror },
            },
            KVM_EXIT_INTR => VcpuExit::Interrupted,
            KVM_EXIT_DEBUG => VcpuExit::Debug,
            other => VcpuExit::Unknown(other),
        };

        Ok(exit)
    }
}

impl AsRawFd for KvmVcpu {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl VcpuHandle for KvmVcpu {
    fn run(&mut self) -> KvmResult<VcpuExit> {
        self.control_block()?;

        match ioctl_none(&*self, KVM_RUN) {
            Ok(_) => self.convert_exit(),
            // EINTR is not an error, it just means we were interrupted
            Err(e) if e.is_interrupted() => Ok(VcpuExit::Interrupted),
            Err(e) => Err(e),
        }
    }

    fn get_regs(&self) -> KvmResult<Registers> {
        let mut regs = KvmRegs::default();
        unsafe { ioctl_ptr(self.as_raw_fd(), KVM_GET_REGS, &mut regs)? };

        Ok(Registers {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.rflags,
        })
    }

    fn set_regs(&mut self, regs: &Registers) -> KvmResult<()> {
        let mut kvm_regs = KvmRegs {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.rflags,
        };
        unsafe { ioctl_ptr(self.as_raw_fd(), KVM_SET_REGS, &mut kvm_regs)? };
        Ok(())
    }

    fn set_code_segment(&mut self, segment: CodeSegment) -> KvmResult<()> {
        let mut sregs = self.get_sregs()?;
        sregs.cs.base = segment.base;
        sregs.cs.selector = segment.selector;
        self.set_sregs(&sregs)
    }

    fn set_cpuid(&mut self, features: &CpuFeatures) -> KvmResult<()> {
        let entries: Vec<KvmCpuidEntry2> = features
            .entries()
            .iter()
            .map(|e| KvmCpuidEntry2 {
                function: e.function,
                index: e.index,
                flags: e.flags,
                eax: e.eax,
                ebx: e.ebx,
                ecx: e.ecx,
                edx: e.edx,
                padding: [0; 3],
            })
            .collect();

        let mut buffer = CpuidBuffer::from_entries(&entries);
        unsafe { ioctl_ptr(self.as_raw_fd(), KVM_SET_CPUID2, buffer.as_mut_ptr())? };
        Ok(())
    }

    fn translate(&self, linear_addr: u64) -> KvmResult<Option<u64>> {
        let mut tr = KvmTranslation {
            linear_address: linear_addr,
            ..Default::default()
        };
        unsafe { ioctl_ptr(self.as_raw_fd(), KVM_TRANSLATE, &mut tr)? };

        Ok((tr.valid != 0).then_some(tr.physical_address))
    }

    fn unmap_control_block(&mut self) {
        if self.kvm_run.is_null() {
            return;
        }

        unsafe {
            libc::munmap(self.kvm_run.cast(), self.mmap_size);
        }
        self.kvm_run = ptr::null_mut();
        tracing::trace!("Unmapped control block of vCPU {}", self.id);
    }
}

impl Drop for KvmVcpu {
    fn drop(&mut self) {
        self.unmap_control_block();
    }
}

impl std::fmt::Debug for KvmVcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmVcpu")
            .field("id", &self.id)
            .field("fd", &self.fd.as_raw_fd())
            .field("mapped", &!self.kvm_run.is_null())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::allocator::GuestMemoryMap;
    use crate::linux::{KvmBackend, KvmSystem};
    use crate::memory::{Access, GuestAddress, MIB};
    use crate::traits::{HypervisorSystem, VmHandle};

    #[test]
    #[ignore] // Requires /dev/kvm
    fn test_hlt_in_real_mode() {
        let kvm = KvmSystem::open(Path::new("/dev/kvm")).expect("Failed to open /dev/kvm");
        let vm = kvm.create_vm().unwrap();

        // mov al, 0x42; out 0xf4, al; hlt
        let code = [0xb0, 0x42, 0xe6, 0xf4, 0xf4];
        let mut memory = GuestMemoryMap::new(0);
        memory
            .allocate(&vm, &KvmBackend::new(), 0, GuestAddress(0), MIB, Access::ReadWrite)
            .unwrap();
        memory.write(GuestAddress(0x1000), &code).unwrap();

        let mut vcpu = vm.create_vcpu(0, kvm.vcpu_mmap_size().unwrap()).unwrap();
        vcpu.set_code_segment(CodeSegment {
            base: 0,
            selector: 0,
        })
        .unwrap();
        vcpu.set_regs(&Registers {
            rip: 0x1000,
            rflags: 2,
            ..Default::default()
        })
        .unwrap();

        let exit = loop {
            match vcpu.run().unwrap() {
                VcpuExit::Interrupted => continue,
                exit => break exit,
            }
        };
        assert_eq!(
            exit,
            VcpuExit::IoOut {
                port: 0xf4,
                size: 1,
                data: 0x42
            }
        );
        assert_eq!(vcpu.run().unwrap(), VcpuExit::Halt);

        // Paging is off, so linear equals physical.
        assert_eq!(vcpu.translate(0x1234).unwrap(), Some(0x1234));

        vcpu.unmap_control_block();
        vcpu.unmap_control_block();
        assert_eq!(vcpu.run().unwrap_err().errno, libc::EBADF);
    }
}

//! FFI bindings for the Linux KVM API.
//!
//! Only the ioctls the harness issues are defined here. Layouts follow
//! `include/uapi/linux/kvm.h` and the x86 `asm/kvm.h`.

#![allow(dead_code)]

use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{KvmError, KvmResult};

// ============================================================================
// KVM ioctl Numbers
// ============================================================================

/// KVM magic number for ioctl encoding.
const KVMIO: u8 = 0xAE;

macro_rules! kvm_io {
    ($nr:expr) => {
        nix::request_code_none!(KVMIO, $nr)
    };
}

macro_rules! kvm_ior {
    ($nr:expr, $ty:ty) => {
        nix::request_code_read!(KVMIO, $nr, std::mem::size_of::<$ty>())
    };
}

macro_rules! kvm_iow {
    ($nr:expr, $ty:ty) => {
        nix::request_code_write!(KVMIO, $nr, std::mem::size_of::<$ty>())
    };
}

macro_rules! kvm_iowr {
    ($nr:expr, $ty:ty) => {
        nix::request_code_readwrite!(KVMIO, $nr, std::mem::size_of::<$ty>())
    };
}

type IoctlNum = nix::sys::ioctl::ioctl_num_type;

// System ioctls
pub const KVM_GET_API_VERSION: IoctlNum = kvm_io!(0x00);
pub const KVM_CREATE_VM: IoctlNum = kvm_io!(0x01);
pub const KVM_GET_VCPU_MMAP_SIZE: IoctlNum = kvm_io!(0x04);
pub const KVM_GET_SUPPORTED_CPUID: IoctlNum = kvm_iowr!(0x05, KvmCpuid2Header);

// VM ioctls
pub const KVM_CREATE_VCPU: IoctlNum = kvm_io!(0x41);
pub const KVM_SET_USER_MEMORY_REGION: IoctlNum = kvm_iow!(0x46, KvmUserspaceMemoryRegion);

// vCPU ioctls
pub const KVM_RUN: IoctlNum = kvm_io!(0x80);
pub const KVM_GET_REGS: IoctlNum = kvm_ior!(0x81, KvmRegs);
pub const KVM_SET_REGS: IoctlNum = kvm_iow!(0x82, KvmRegs);
pub const KVM_GET_SREGS: IoctlNum = kvm_ior!(0x83, KvmSregs);
pub const KVM_SET_SREGS: IoctlNum = kvm_iow!(0x84, KvmSregs);
pub const KVM_TRANSLATE: IoctlNum = kvm_iowr!(0x85, KvmTranslation);
pub const KVM_SET_CPUID2: IoctlNum = kvm_iow!(0x90, KvmCpuid2Header);

// ============================================================================
// KVM Exit Reasons
// ============================================================================

pub const KVM_EXIT_UNKNOWN: u32 = 0;
pub const KVM_EXIT_EXCEPTION: u32 = 1;
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_HYPERCALL: u32 = 3;
pub const KVM_EXIT_DEBUG: u32 = 4;
pub const KVM_EXIT_HLT: u32 = 5;
pub const KVM_EXIT_MMIO: u32 = 6;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;
pub const KVM_EXIT_INTR: u32 = 10;
pub const KVM_EXIT_INTERNAL_ERROR: u32 = 17;

// I/O direction
pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;

// ============================================================================
// Memory Region Flags
// ============================================================================

pub const KVM_MEM_READONLY: u32 = 1 << 1;

// ============================================================================
// Data Structures
// ============================================================================

/// Userspace memory region descriptor.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmUserspaceMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

/// x86_64 general purpose registers.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// x86_64 segment descriptor.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmSegment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

/// x86_64 descriptor table.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmDtable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

/// x86_64 special registers.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmSregs {
    pub cs: KvmSegment,
    pub ds: KvmSegment,
    pub es: KvmSegment,
    pub fs: KvmSegment,
    pub gs: KvmSegment,
    pub ss: KvmSegment,
    pub tr: KvmSegment,
    pub ldt: KvmSegment,
    pub gdt: KvmDtable,
    pub idt: KvmDtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; 4],
}

/// Guest linear to physical translation.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct KvmTranslation {
    pub linear_address: u64,
    pub physical_address: u64,
    pub valid: u8,
    pub writeable: u8,
    pub usermode: u8,
    pub pad: [u8; 5],
}

/// CPUID entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KvmCpuidEntry2 {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub padding: [u32; 3],
}

/// Header of the variable length `kvm_cpuid2`; `nent` entries follow it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KvmCpuid2Header {
    pub nent: u32,
    pub padding: u32,
}

/// Owned `kvm_cpuid2` with room for `capacity` entries.
pub struct CpuidBuffer {
    // u32 storage keeps the 4-byte alignment both structs need.
    words: Vec<u32>,
}

impl CpuidBuffer {
    const HEADER_WORDS: usize = size_of::<KvmCpuid2Header>() / 4;
    const ENTRY_WORDS: usize = size_of::<KvmCpuidEntry2>() / 4;

    /// Allocates a zeroed buffer and sets `nent = capacity`.
    pub fn with_capacity(capacity: u32) -> Self {
        let mut words = vec![0u32; Self::HEADER_WORDS + capacity as usize * Self::ENTRY_WORDS];
        words[0] = capacity;
        Self { words }
    }

    /// Builds a buffer holding `entries`.
    pub fn from_entries(entries: &[KvmCpuidEntry2]) -> Self {
        let mut buffer = Self::with_capacity(entries.len() as u32);
        for (i, entry) in entries.iter().enumerate() {
            let start = Self::HEADER_WORDS + i * Self::ENTRY_WORDS;
            buffer.words[start..start + 7].copy_from_slice(&[
                entry.function,
                entry.index,
                entry.flags,
                entry.eax,
                entry.ebx,
                entry.ecx,
                entry.edx,
            ]);
        }
        buffer
    }

    /// Entries currently reported by `nent`.
    pub fn entries(&self) -> Vec<KvmCpuidEntry2> {
        let capacity = (self.words.len() - Self::HEADER_WORDS) / Self::ENTRY_WORDS;
        let nent = (self.words[0] as usize).min(capacity);
        self.words[Self::HEADER_WORDS..]
            .chunks_exact(Self::ENTRY_WORDS)
            .take(nent)
            .map(|w| KvmCpuidEntry2 {
                function: w[0],
                index: w[1],
                flags: w[2],
                eax: w[3],
                ebx: w[4],
                ecx: w[5],
                edx: w[6],
                padding: [0; 3],
            })
            .collect()
    }

    pub fn as_mut_ptr(&mut self) -> *mut KvmCpuid2Header {
        self.words.as_mut_ptr().cast()
    }

    pub fn as_ptr(&self) -> *const KvmCpuid2Header {
        self.words.as_ptr().cast()
    }
}

// ============================================================================
// KVM Run Structure
// ============================================================================

/// KVM run structure for vCPU execution.
/// This is mmap'd and shared between kernel and userspace.
#[repr(C)]
pub struct KvmRun {
    // Request flags
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],

    // Exit information
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,

    pub cr8: u64,
    pub apic_base: u64,

    // Exit data (union in C)
    pub exit_data: KvmRunExitData,
}

/// Exit data union.
#[repr(C)]
pub union KvmRunExitData {
    pub hw: KvmRunHw,
    pub fail_entry: KvmRunFailEntry,
    pub io: KvmRunIo,
    pub mmio: KvmRunMmio,
    pub internal: KvmRunInternal,
    pub padding: [u8; 256],
}

/// Unknown exit data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmRunHw {
    pub hardware_exit_reason: u64,
}

/// Failed entry data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmRunFailEntry {
    pub hardware_entry_failure_reason: u64,
    pub cpu: u32,
}

/// I/O exit data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmRunIo {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data_offset: u64,
}

/// MMIO exit data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmRunMmio {
    pub phys_addr: u64,
    pub data: [u8; 8],
    pub len: u32,
    pub is_write: u8,
    pub padding: [u8; 3],
}

/// Internal error data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KvmRunInternal {
    pub suberror: u32,
    pub ndata: u32,
}

// ============================================================================
// ioctl helpers
// ============================================================================

/// Issues an ioctl without argument.
pub fn ioctl_none(fd: &impl AsRawFd, request: IoctlNum) -> KvmResult<i32> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request, 0) };
    if ret < 0 {
        return Err(KvmError::last_os_error());
    }
    Ok(ret)
}

/// Issues an ioctl with an integer argument.
pub fn ioctl_val(fd: &impl AsRawFd, request: IoctlNum, arg: libc::c_ulong) -> KvmResult<i32> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request, arg) };
    if ret < 0 {
        return Err(KvmError::last_os_error());
    }
    Ok(ret)
}

/// Issues an ioctl whose argument points at `arg`.
///
/// # Safety
///
/// `request` must expect a pointer to a `T` sized (or `T` headed) object.
pub unsafe fn ioctl_ptr<T>(fd: RawFd, request: IoctlNum, arg: *mut T) -> KvmResult<i32> {
    let ret = unsafe { libc::ioctl(fd, request, arg) };
    if ret < 0 {
        return Err(KvmError::last_os_error());
    }
    Ok(ret)
}

//! Common types shared by the backends and the engine.

/// General purpose register state (x86_64 layout).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
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

    // Instruction pointer and flags
    pub rip: u64,
    pub rflags: u64,
}

/// Code segment state loaded into the vCPU before the first entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSegment {
    pub base: u64,
    pub selector: u16,
}

/// Reason for vCPU exit.
///
/// Every raw exit code the kernel reports lands in exactly one variant;
/// codes the harness has no use for end up in [`VcpuExit::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcpuExit {
    /// Guest executed `hlt`.
    Halt,
    /// I/O port write.
    IoOut { port: u16, size: u8, data: u64 },
    /// I/O port read.
    IoIn { port: u16, size: u8 },
    /// Memory-mapped I/O read.
    MmioRead { addr: u64, size: u8 },
    /// Memory-mapped I/O write.
    MmioWrite { addr: u64, size: u8, data: u64 },
    /// Triple fault or explicit shutdown.
    Shutdown,
    /// Hardware refused to enter the guest.
    FailEntry { reason: u64 },
    /// KVM internal error.
    InternalError { suberror: u32 },
    /// Host signal interrupted the run; no guest progress was consumed.
    Interrupted,
    /// Debug exception.
    Debug,
    /// Exit code not handled by this crate.
    Unknown(u32),
}

impl VcpuExit {
    /// Short name used in diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Halt => "hlt",
            Self::IoOut { .. } => "io-out",
            Self::IoIn { .. } => "io-in",
            Self::MmioRead { .. } => "mmio-read",
            Self::MmioWrite { .. } => "mmio-write",
            Self::Shutdown => "shutdown",
            Self::FailEntry { .. } => "fail-entry",
            Self::InternalError { .. } => "internal-error",
            Self::Interrupted => "interrupted",
            Self::Debug => "debug",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// One CPUID leaf as reported by the hypervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidEntry {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Host-supported CPU feature leaves.
///
/// Read-only once created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    entries: Vec<CpuidEntry>,
}

impl CpuFeatures {
    /// Wraps a list of CPUID entries.
    #[must_use]
    pub fn new(entries: Vec<CpuidEntry>) -> Self {
        Self { entries }
    }

    /// Returns the entries.
    #[must_use]
    pub fn entries(&self) -> &[CpuidEntry] {
        &self.entries
    }

    /// Number of leaves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no leaves.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a leaf by function and index.
    #[must_use]
    pub fn leaf(&self, function: u32, index: u32) -> Option<&CpuidEntry> {
        self.entries
            .iter()
            .find(|e| e.function == function && e.index == index)
    }
}

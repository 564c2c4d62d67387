//! Scripted in-process backend for driving the harness without `/dev/kvm`.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use kvm_harness::{
    Backend, CodeSegment, CpuFeatures, CpuidEntry, GuestAddress, HostMemoryInfo, HypervisorSystem,
    KvmError, KvmResult, MemoryRegion, Registers, ResultRecord, VcpuExit, VcpuHandle, VmHandle,
    config::KVM_RESULT_BASEADDR,
};

/// Plenty of host memory.
pub const LOTS_OF_MEMORY: u64 = 64 << 30;

/// Guest address the scripted guest stores its file name at.
pub const GUEST_FILE_ADDR: u64 = 0x8000;

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// One scripted vCPU action.
#[derive(Debug, Clone)]
pub enum Step {
    /// The guest writes a Result Record and keeps running.
    Write(ResultRecord),
    /// The guest stores a NUL-terminated string at a guest address.
    WriteStr(u64, String),
    /// `KVM_RUN` returns this exit.
    Exit(VcpuExit),
    /// `KVM_RUN` fails with this errno.
    Fail(i32),
}

impl Step {
    /// A guest that writes `record` and halts.
    pub fn report(record: ResultRecord) -> [Step; 2] {
        [Step::Write(record), Step::Exit(VcpuExit::Halt)]
    }
}

/// Where to inject a hypervisor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Open,
    MmapSize,
    CreateVm,
    CreateVcpu,
    SetCpuid,
    SetRegion(u32),
    SetSregs,
    SetRegs,
}

/// Shared state observed by tests.
#[derive(Debug)]
pub struct MockState {
    pub available_memory: u64,
    pub api_version: i32,
    /// Leaves reported by `KVM_GET_SUPPORTED_CPUID`; `None` makes it fail.
    pub cpuid_leaves: Option<u32>,
    pub fail_at: Option<FailPoint>,

    pub opens: usize,
    pub cpuid_queries: usize,
    pub live_systems: usize,
    pub live_vms: usize,
    pub live_vcpus: usize,
    pub mapped_blocks: usize,
    /// Installed slots: region and host address.
    pub regions: BTreeMap<u32, (MemoryRegion, u64)>,
    pub cpuid_installed: Option<usize>,
    pub code_segment: Option<CodeSegment>,
    pub regs: Registers,
    pub runs: usize,
    pub script: VecDeque<Step>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            available_memory: LOTS_OF_MEMORY,
            api_version: 12,
            cpuid_leaves: Some(24),
            fail_at: None,
            opens: 0,
            cpuid_queries: 0,
            live_systems: 0,
            live_vms: 0,
            live_vcpus: 0,
            mapped_blocks: 0,
            regions: BTreeMap::new(),
            cpuid_installed: None,
            code_segment: None,
            regs: Registers::default(),
            runs: 0,
            script: VecDeque::new(),
        }
    }
}

impl MockState {
    /// Handles and mappings still open.
    pub fn open_resources(&self) -> usize {
        self.live_systems + self.live_vms + self.live_vcpus + self.mapped_blocks
    }

    fn fails(&self, point: FailPoint) -> KvmResult<()> {
        if self.fail_at == Some(point) {
            return Err(KvmError::from_errno(libc::EIO, format!("injected {point:?}")));
        }
        Ok(())
    }

    /// Writes into guest memory through the registered host mapping.
    fn write_guest(&self, gpa: u64, data: &[u8]) {
        let (region, host_addr) = self
            .regions
            .values()
            .find(|(r, _)| r.contains_range(GuestAddress(gpa), data.len() as u64))
            .unwrap_or_else(|| panic!("guest address {gpa:#x} is not mapped"));
        let offset = (gpa - region.guest_addr.raw()) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (*host_addr as *mut u8).add(offset),
                data.len(),
            );
        }
    }

    /// Reads guest memory through the registered host mapping.
    pub fn read_guest(&self, gpa: u64, len: usize) -> Vec<u8> {
        let (region, host_addr) = self
            .regions
            .values()
            .find(|(r, _)| r.contains_range(GuestAddress(gpa), len as u64))
            .unwrap_or_else(|| panic!("guest address {gpa:#x} is not mapped"));
        let offset = (gpa - region.guest_addr.raw()) as usize;
        unsafe { std::slice::from_raw_parts((*host_addr as *const u8).add(offset), len).to_vec() }
    }
}

/// Scripted backend. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Appends steps to the vCPU script.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.state().script.extend(steps);
    }

    /// Scripts a guest reporting `result` with `lineno`, `message`, and a
    /// file name stored in guest RAM.
    pub fn report(&self, result: i32, lineno: i32, file: &str, message: &str) {
        self.script([Step::WriteStr(GUEST_FILE_ADDR, file.to_string())]);
        self.script(Step::report(ResultRecord {
            result,
            lineno,
            file_addr: GUEST_FILE_ADDR,
            message: message.to_string(),
        }));
    }

    /// Scripts the final "done" marker.
    pub fn exit(&self) {
        self.script(Step::report(ResultRecord {
            result: kvm_harness::result::KVM_TEXIT,
            ..ResultRecord::none()
        }));
    }
}

impl HostMemoryInfo for MockBackend {
    fn available_memory(&self) -> io::Result<u64> {
        Ok(self.state().available_memory)
    }
}

impl Backend for MockBackend {
    type System = MockSystem;

    fn open(&self, device: &Path) -> KvmResult<MockSystem> {
        let mut state = self.state();
        state.opens += 1;
        if state.fail_at == Some(FailPoint::Open) {
            return Err(KvmError::from_errno(
                libc::ENOENT,
                format!("{} not found", device.display()),
            ));
        }
        state.live_systems += 1;
        Ok(MockSystem {
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockSystem {
    state: Arc<Mutex<MockState>>,
}

impl Drop for MockSystem {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_systems -= 1;
    }
}

impl HypervisorSystem for MockSystem {
    type Vm = MockVm;

    fn api_version(&self) -> KvmResult<i32> {
        Ok(self.state.lock().unwrap().api_version)
    }

    fn vcpu_mmap_size(&self) -> KvmResult<usize> {
        self.state.lock().unwrap().fails(FailPoint::MmapSize)?;
        Ok(12288)
    }

    fn create_vm(&self) -> KvmResult<MockVm> {
        let mut state = self.state.lock().unwrap();
        state.fails(FailPoint::CreateVm)?;
        state.live_vms += 1;
        Ok(MockVm {
            state: Arc::clone(&self.state),
        })
    }

    fn supported_cpuid(&self, capacity: u32) -> KvmResult<CpuFeatures> {
        let mut state = self.state.lock().unwrap();
        state.cpuid_queries += 1;
        let Some(leaves) = state.cpuid_leaves else {
            return Err(KvmError::from_errno(libc::EINVAL, "no CPUID support"));
        };
        if capacity < leaves {
            return Err(KvmError::from_errno(libc::E2BIG, "buffer too small"));
        }
        Ok(CpuFeatures::new(
            (0..leaves)
                .map(|function| CpuidEntry {
                    function,
                    ..Default::default()
                })
                .collect(),
        ))
    }
}

pub struct MockVm {
    state: Arc<Mutex<MockState>>,
}

impl Drop for MockVm {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.live_vms -= 1;
        state.regions.clear();
    }
}

impl VmHandle for MockVm {
    type Vcpu = MockVcpu;

    fn set_user_memory_region(&self, region: &MemoryRegion, host_addr: u64) -> KvmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.fails(FailPoint::SetRegion(region.slot))?;
        if state
            .regions
            .values()
            .any(|(r, _)| r.slot != region.slot && r.overlaps(region.guest_addr, region.size))
        {
            return Err(KvmError::from_errno(libc::EEXIST, "overlapping slot"));
        }
        state.regions.insert(region.slot, (*region, host_addr));
        Ok(())
    }

    fn create_vcpu(&self, _id: u32, _mmap_size: usize) -> KvmResult<MockVcpu> {
        let mut state = self.state.lock().unwrap();
        state.fails(FailPoint::CreateVcpu)?;
        state.live_vcpus += 1;
        state.mapped_blocks += 1;
        Ok(MockVcpu {
            state: Arc::clone(&self.state),
            mapped: true,
        })
    }
}

pub struct MockVcpu {
    state: Arc<Mutex<MockState>>,
    mapped: bool,
}

impl Drop for MockVcpu {
    fn drop(&mut self) {
        self.unmap_control_block();
        self.state.lock().unwrap().live_vcpus -= 1;
    }
}

impl VcpuHandle for MockVcpu {
    fn run(&mut self) -> KvmResult<VcpuExit> {
        let mut state = self.state.lock().unwrap();
        state.runs += 1;

        loop {
            match state.script.pop_front() {
                Some(Step::Write(record)) => {
                    let raw = record.encode();
                    state.write_guest(KVM_RESULT_BASEADDR, &raw);
                }
                Some(Step::WriteStr(addr, text)) => {
                    let mut raw = text.into_bytes();
                    raw.push(0);
                    state.write_guest(addr, &raw);
                }
                Some(Step::Exit(exit)) => {
                    if exit != VcpuExit::Interrupted {
                        state.regs.rip += 1;
                    }
                    return Ok(exit);
                }
                Some(Step::Fail(errno)) => {
                    return Err(KvmError::from_errno(errno, "scripted KVM_RUN failure"));
                }
                None => return Ok(VcpuExit::Shutdown),
            }
        }
    }

    fn get_regs(&self) -> KvmResult<Registers> {
        Ok(self.state.lock().unwrap().regs.clone())
    }

    fn set_regs(&mut self, regs: &Registers) -> KvmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.fails(FailPoint::SetRegs)?;
        state.regs = regs.clone();
        Ok(())
    }

    fn set_code_segment(&mut self, segment: CodeSegment) -> KvmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.fails(FailPoint::SetSregs)?;
        state.code_segment = Some(segment);
        Ok(())
    }

    fn set_cpuid(&mut self, features: &CpuFeatures) -> KvmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.fails(FailPoint::SetCpuid)?;
        state.cpuid_installed = Some(features.len());
        Ok(())
    }

    fn translate(&self, linear_addr: u64) -> KvmResult<Option<u64>> {
        // Paging off: identity below 4 GiB.
        Ok((linear_addr < 1 << 32).then_some(linear_addr))
    }

    fn unmap_control_block(&mut self) {
        if self.mapped {
            self.mapped = false;
            self.state.lock().unwrap().mapped_blocks -= 1;
        }
    }
}

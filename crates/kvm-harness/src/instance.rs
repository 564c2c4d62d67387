//! VM instance lifecycle.
//!
//! A [`VmInstance`] owns everything one execution needs: the VM handle, a
//! single vCPU with its mapped control block, and the guest memory map.
//! Creation loads the payload and the reset code and points the vCPU at the
//! reset vector; destruction releases everything in reverse order.

use crate::{
    allocator::GuestMemoryMap,
    config::{RESET_CODE, VM_RESET_CODE_SIZE, VmConfig},
    error::{HarnessError, Result},
    memory::{Access, GuestAddress, MIB, MemoryRegion, PAGE_SIZE, align_up},
    probe::{FeatureCache, probe_device},
    result::{RESULT_RECORD_SIZE, ResultRecord},
    traits::{Backend, HypervisorSystem, VcpuHandle, VmHandle},
    types::{CodeSegment, Registers},
};

/// Guest RAM slot.
pub const RAM_SLOT: u32 = 0;

/// Slot holding the Result Record and the reset code.
pub const RESET_SLOT: u32 = 1;

/// Initial RFLAGS: only the reserved bit 1 set.
const RESET_RFLAGS: u64 = 0x2;

/// Computes the guest RAM size for a payload of `payload_len` bytes.
///
/// RAM grows (in 1 MiB steps) until at least `min_free_ram` bytes stay free
/// after the payload, and is capped at `ram_limit`. Fails with
/// `Unsupported` if the payload cannot fit even then.
pub fn plan_ram_size(config: &VmConfig, payload_len: u64, ram_limit: u64) -> Result<u64> {
    let kernel_base = config.kernel_base;
    let too_large = || {
        HarnessError::Unsupported(format!("test binary too large ({payload_len} bytes)"))
    };

    let needed = payload_len
        .checked_add(config.min_free_ram)
        .ok_or_else(too_large)?;
    let mut ram_size = config.ram_size;

    if needed > ram_size.saturating_sub(kernel_base) {
        ram_size = needed
            .checked_add(kernel_base)
            .and_then(|n| align_up(n, MIB))
            .ok_or_else(too_large)?;
        tracing::warn!(
            "RAM size increased to {} bytes to fit a {} byte payload",
            ram_size,
            payload_len
        );
    }

    if ram_size > ram_limit {
        ram_size = ram_limit;
        tracing::warn!("RAM size capped at {:#x} bytes", ram_size);
    }

    if needed > ram_size.saturating_sub(kernel_base) {
        return Err(too_large());
    }

    Ok(ram_size)
}

/// A created VM with one vCPU and its guest memory.
pub struct VmInstance<V: VmHandle> {
    config: VmConfig,
    ram_size: u64,
    result_addr: GuestAddress,
    memory: GuestMemoryMap,
    vcpu: Option<V::Vcpu>,
    vm: Option<V>,
}

impl<V: VmHandle> VmInstance<V> {
    /// Creates and initializes an instance running `payload`.
    ///
    /// Free host memory is checked before the device is opened. Any failure
    /// after the VM exists tears down everything created so far.
    pub fn create<B>(backend: &B, config: &VmConfig, payload: &[u8]) -> Result<Self>
    where
        B: Backend,
        B::System: HypervisorSystem<Vm = V>,
    {
        Self::create_with_cache(backend, config, payload, &FeatureCache::new())
    }

    /// Like [`VmInstance::create`], taking CPU features from `features`.
    pub fn create_with_cache<B>(
        backend: &B,
        config: &VmConfig,
        payload: &[u8],
        features: &FeatureCache,
    ) -> Result<Self>
    where
        B: Backend,
        B::System: HypervisorSystem<Vm = V>,
    {
        config.validate()?;

        let memory = GuestMemoryMap::new(config.min_free_ram);
        let ram_limit = GuestAddress(config.result_base)
            .align_down(memory.page_size())
            .raw();
        let ram_size = plan_ram_size(config, payload.len() as u64, ram_limit)?;

        let available = backend.available_memory().map_err(|e| {
            HarnessError::resource(format!("cannot determine free host memory: {e}"))
        })?;
        let needed = config.min_free_ram.saturating_add(ram_size);
        if available < needed {
            return Err(HarnessError::resource(format!(
                "not enough free memory for a {ram_size} byte VM: \
                 {available} bytes available, {needed} needed"
            )));
        }

        let system = probe_device(backend, &config.device_path)?;
        let mmap_size = system.vcpu_mmap_size().map_err(|e| {
            HarnessError::protocol(format!("KVM_GET_VCPU_MMAP_SIZE failed: {e}"))
        })?;
        let vm = system
            .create_vm()
            .map_err(|e| HarnessError::protocol(format!("KVM_CREATE_VM failed: {e}")))?;

        let mut instance = Self {
            config: config.clone(),
            ram_size,
            result_addr: GuestAddress(config.result_base),
            memory,
            vcpu: None,
            vm: Some(vm),
        };

        if let Err(e) = instance.init(backend, &system, mmap_size, payload, features) {
            tracing::debug!("VM setup failed, tearing down: {}", e);
            instance.destroy();
            return Err(e);
        }

        tracing::info!(
            "Created VM with {} MiB RAM, {} byte payload",
            ram_size / MIB,
            payload.len()
        );
        Ok(instance)
    }

    fn init<B, S>(
        &mut self,
        backend: &B,
        system: &S,
        mmap_size: usize,
        payload: &[u8],
        features: &FeatureCache,
    ) -> Result<()>
    where
        B: Backend,
        S: HypervisorSystem<Vm = V>,
    {
        let vm = self
            .vm
            .as_ref()
            .ok_or_else(|| HarnessError::invalid_config("VM already destroyed"))?;

        let mut vcpu = vm
            .create_vcpu(0, mmap_size)
            .map_err(|e| HarnessError::protocol(format!("KVM_CREATE_VCPU failed: {e}")))?;

        if let Some(cpuid) = features.get_or_probe(system)? {
            vcpu.set_cpuid(cpuid)
                .map_err(|e| HarnessError::protocol(format!("KVM_SET_CPUID2 failed: {e}")))?;
        }
        let vcpu = self.vcpu.insert(vcpu);

        // Guest RAM with the payload at the kernel base.
        let kernel_base = self.config.kernel_base;
        let ram = self.memory.allocate(
            vm,
            backend,
            RAM_SLOT,
            GuestAddress(0),
            self.ram_size,
            Access::ReadWrite,
        )?;
        let start = ram.requested_offset() + kernel_base as usize;
        ram.as_mut_slice()[start..start + payload.len()].copy_from_slice(payload);

        // Result Record and reset code share the top slot.
        let reset_base = self.config.reset_base;
        let reset_end = reset_base + VM_RESET_CODE_SIZE as u64;
        let reset = self.memory.allocate(
            vm,
            backend,
            RESET_SLOT,
            self.result_addr,
            reset_end - self.result_addr.raw(),
            Access::ReadWrite,
        )?;
        let code_at = reset.requested_offset() + (reset_base - self.result_addr.raw()) as usize;
        reset.as_mut_slice()[code_at..code_at + VM_RESET_CODE_SIZE].copy_from_slice(&RESET_CODE);

        let record = ResultRecord::none().encode();
        let record_at = reset.requested_offset();
        reset.as_mut_slice()[record_at..record_at + record.len()].copy_from_slice(&record);

        vcpu.set_code_segment(CodeSegment {
            base: reset_base & !0xffff,
            selector: 0xf000,
        })
        .map_err(|e| HarnessError::protocol(format!("KVM_SET_SREGS failed: {e}")))?;

        vcpu.set_regs(&Registers {
            rip: reset_base & 0xffff,
            rflags: RESET_RFLAGS,
            ..Default::default()
        })
        .map_err(|e| HarnessError::protocol(format!("KVM_SET_REGS failed: {e}")))?;

        Ok(())
    }

    /// Releases every resource. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.vm.is_none() && self.vcpu.is_none() && self.memory.is_empty() {
            return;
        }

        if let Some(vcpu) = self.vcpu.as_mut() {
            vcpu.unmap_control_block();
        }
        self.memory.release();
        self.vcpu = None;
        self.vm = None;

        tracing::debug!("VM destroyed");
    }

    /// Returns true once [`VmInstance::destroy`] has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.vm.is_none()
    }

    /// Returns the configuration the instance was created with.
    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Returns the guest RAM size actually used.
    #[must_use]
    pub fn ram_size(&self) -> u64 {
        self.ram_size
    }

    /// Returns the guest address of the Result Record.
    #[must_use]
    pub fn result_addr(&self) -> GuestAddress {
        self.result_addr
    }

    /// Returns the installed memory regions, ordered by slot.
    #[must_use]
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.memory.regions()
    }

    /// Returns the guest memory map.
    #[must_use]
    pub fn memory(&self) -> &GuestMemoryMap {
        &self.memory
    }

    /// Copies `data` into guest physical memory at `addr`.
    ///
    /// The range must lie inside one installed slot; after destruction
    /// nothing is installed and every write is rejected.
    pub fn write_guest(&mut self, addr: GuestAddress, data: &[u8]) -> Result<()> {
        self.memory.write(addr, data)
    }

    /// Returns the vCPU, or `InvalidConfig` after destruction.
    pub fn vcpu_mut(&mut self) -> Result<&mut V::Vcpu> {
        self.vcpu
            .as_mut()
            .ok_or_else(|| HarnessError::invalid_config("VM instance already destroyed"))
    }

    /// Reads the Result Record.
    pub fn read_result(&self) -> Result<ResultRecord> {
        let mut raw = vec![0u8; RESULT_RECORD_SIZE];
        self.memory.read(self.result_addr, &mut raw)?;
        Ok(ResultRecord::decode(&raw))
    }

    /// Marks the Result Record as "no result".
    pub fn reset_result(&mut self) -> Result<()> {
        self.memory
            .write(self.result_addr, &ResultRecord::none().encode())
    }

    /// Reads a NUL-terminated string at a guest linear address.
    ///
    /// Returns `None` if the address does not translate into installed guest
    /// memory.
    pub fn guest_str(&self, linear_addr: u64) -> Option<String> {
        let vcpu = self.vcpu.as_ref()?;
        let phys = vcpu.translate(linear_addr).ok().flatten()?;
        let addr = GuestAddress(phys);
        self.memory.find_slot(addr)?;
        self.memory.read_cstr(addr, PAGE_SIZE as usize).ok()
    }
}

impl<V: VmHandle> Drop for VmInstance<V> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<V: VmHandle> std::fmt::Debug for VmInstance<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmInstance")
            .field("ram_size", &self.ram_size)
            .field("result_addr", &self.result_addr)
            .field("memory", &self.memory)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

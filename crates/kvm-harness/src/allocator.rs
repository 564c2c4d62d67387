//! Guest memory allocator.
//!
//! Reserves guarded, page-aligned host buffers and installs them as
//! guest-physical memory slots. The buffers form an arena owned by
//! [`GuestMemoryMap`]; nobody else holds a lifetime claim on them and they
//! are released only when the map drops them.

use std::collections::BTreeMap;
use std::ptr::{self, NonNull};

use crate::{
    error::{HarnessError, Result},
    memory::{Access, GuestAddress, MemoryRegion, align_up, host_page_size},
    traits::{HostMemoryInfo, VmHandle},
};

/// Number of memory slots the harness will hand out.
pub const MAX_MEMORY_SLOTS: u32 = 32;

/// Anonymous host mapping followed by an inaccessible guard page.
///
/// The usable part starts on a page boundary and is zero filled.
pub struct GuardedBuffer {
    ptr: NonNull<u8>,
    /// Usable bytes, a multiple of the page size.
    len: usize,
    /// Usable bytes plus the guard page.
    mapping_len: usize,
    region: MemoryRegion,
    requested: GuestAddress,
}

// Safety: the mapping is exclusively owned; access goes through `&self` /
// `&mut self` like a `Vec<u8>`.
unsafe impl Send for GuardedBuffer {}

impl GuardedBuffer {
    fn map(len: usize, page_size: usize) -> std::io::Result<(NonNull<u8>, usize)> {
        let mapping_len = len
            .checked_add(page_size)
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::ENOMEM))?;

        // Anonymous mappings come back zero filled.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }

        let guard = unsafe { addr.cast::<u8>().add(len) };
        if unsafe { libc::mprotect(guard.cast(), page_size, libc::PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(addr, mapping_len);
            }
            return Err(err);
        }

        // mmap never returns null on success.
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok((ptr, mapping_len))
    }

    /// Host address of the first usable byte (page aligned).
    #[must_use]
    pub fn host_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Usable length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero sized buffers are rejected at allocation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The installed slot.
    #[must_use]
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// The guest address originally requested for this slot.
    #[must_use]
    pub fn requested_addr(&self) -> GuestAddress {
        self.requested
    }

    /// Offset of the requested address inside the buffer.
    #[must_use]
    pub fn requested_offset(&self) -> usize {
        (self.requested.raw() - self.region.guest_addr.raw()) as usize
    }

    /// Index of `addr` in the buffer, if the buffer backs it.
    #[must_use]
    pub fn offset_of(&self, addr: GuestAddress) -> Option<usize> {
        self.region
            .contains(addr)
            .then(|| (addr.raw() - self.region.guest_addr.raw()) as usize)
    }

    /// The usable bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The usable bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for GuardedBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.mapping_len);
        }
    }
}

impl std::fmt::Debug for GuardedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedBuffer")
            .field("host_addr", &format_args!("{:#x}", self.host_addr()))
            .field("len", &self.len)
            .field("region", &self.region)
            .field("requested", &self.requested)
            .finish()
    }
}

/// All guest memory slots of one VM instance.
#[derive(Debug)]
pub struct GuestMemoryMap {
    slots: BTreeMap<u32, GuardedBuffer>,
    page_size: u64,
    min_free_ram: u64,
}

impl GuestMemoryMap {
    /// Creates an empty map using the host page size.
    #[must_use]
    pub fn new(min_free_ram: u64) -> Self {
        Self {
            slots: BTreeMap::new(),
            page_size: host_page_size(),
            min_free_ram,
        }
    }

    /// Creates an empty map with an explicit page size.
    ///
    /// The page size must be a power of two and a multiple of the host page
    /// size; anything else is `InvalidConfig`.
    pub fn with_page_size(min_free_ram: u64, page_size: u64) -> Result<Self> {
        let host = host_page_size();
        if !page_size.is_power_of_two() || page_size < host {
            return Err(HarnessError::invalid_config(format!(
                "page size {page_size:#x} is not a power-of-two multiple of the host page size {host:#x}"
            )));
        }
        Ok(Self {
            page_size,
            ..Self::new(min_free_ram)
        })
    }

    /// Page size used for alignment.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Reserves a buffer covering `[guest_base, guest_base + size)` and
    /// installs it as slot `slot`.
    ///
    /// The buffer starts at `guest_base` rounded down to a page, so the
    /// requested address sits at `guest_base % page_size` inside it.
    ///
    /// # Errors
    ///
    /// * `InvalidConfig` for a zero size or out-of-range slot id.
    /// * `ProtocolViolation` for a reused slot id, an overlapping range or a
    ///   rejected registration. Existing slots are left untouched.
    /// * `ResourceUnavailable` if free host memory is below
    ///   `min_free_ram + size`; checked before any hypervisor call.
    pub fn allocate<V, H>(
        &mut self,
        vm: &V,
        host: &H,
        slot: u32,
        guest_base: GuestAddress,
        size: u64,
        access: Access,
    ) -> Result<&mut GuardedBuffer>
    where
        V: VmHandle + ?Sized,
        H: HostMemoryInfo + ?Sized,
    {
        if size == 0 {
            return Err(HarnessError::invalid_config(format!(
                "memory slot {slot}: size must be > 0"
            )));
        }

        if slot >= MAX_MEMORY_SLOTS {
            return Err(HarnessError::invalid_config(format!(
                "invalid KVM memory slot {slot}"
            )));
        }

        if self.slots.contains_key(&slot) {
            return Err(HarnessError::protocol(format!(
                "memory slot {slot} already in use"
            )));
        }

        let offset = guest_base.offset_in(self.page_size);
        let backing_base = guest_base.align_down(self.page_size);
        let len = size
            .checked_add(offset)
            .and_then(|n| align_up(n, self.page_size))
            .filter(|&n| u128::from(backing_base.raw()) + u128::from(n) <= 1u128 << 64)
            .ok_or_else(|| {
                HarnessError::invalid_config(format!(
                    "memory slot {slot}: {size:#x} bytes at {guest_base} exceed the address space"
                ))
            })?;

        if let Some(existing) = self
            .slots
            .values()
            .map(GuardedBuffer::region)
            .find(|r| r.overlaps(backing_base, len))
        {
            return Err(HarnessError::protocol(format!(
                "memory slot {slot} at {backing_base} (+{len:#x}) overlaps slot {} at {} (+{:#x})",
                existing.slot, existing.guest_addr, existing.size
            )));
        }

        self.check_free_memory(host, len)?;

        let host_len = usize::try_from(len).map_err(|_| {
            HarnessError::resource(format!("memory slot {slot}: {len:#x} bytes do not fit"))
        })?;
        let (ptr, mapping_len) = GuardedBuffer::map(host_len, self.page_size as usize)
            .map_err(|e| reserve_error(slot, len, e))?;

        let region = MemoryRegion {
            slot,
            guest_addr: backing_base,
            size: len,
            access,
        };
        let buffer = GuardedBuffer {
            ptr,
            len: host_len,
            mapping_len,
            region,
            requested: guest_base,
        };

        // On rejection `buffer` is dropped here and unmapped.
        vm.set_user_memory_region(&region, buffer.host_addr())
            .map_err(|e| {
                HarnessError::protocol(format!(
                    "KVM_SET_USER_MEMORY_REGION rejected slot {slot} at {backing_base}: {e}"
                ))
            })?;

        tracing::debug!(
            "Installed memory slot {} at {} ({:#x} bytes, {:?}), requested {}",
            slot,
            backing_base,
            len,
            access,
            guest_base
        );

        Ok(self.slots.entry(slot).or_insert(buffer))
    }

    fn check_free_memory<H: HostMemoryInfo + ?Sized>(&self, host: &H, len: u64) -> Result<()> {
        let available = host.available_memory().map_err(|e| {
            HarnessError::resource(format!("cannot determine free host memory: {e}"))
        })?;

        let needed = self.min_free_ram.saturating_add(len);
        if available < needed {
            return Err(HarnessError::resource(format!(
                "not enough free host memory: {available} bytes available, {needed} needed"
            )));
        }
        Ok(())
    }

    /// Returns the buffer of a slot.
    #[must_use]
    pub fn slot(&self, slot: u32) -> Option<&GuardedBuffer> {
        self.slots.get(&slot)
    }

    /// Returns the buffer of a slot, mutably.
    pub fn slot_mut(&mut self, slot: u32) -> Option<&mut GuardedBuffer> {
        self.slots.get_mut(&slot)
    }

    /// Finds the slot backing a guest physical address.
    #[must_use]
    pub fn find_slot(&self, addr: GuestAddress) -> Option<u32> {
        self.slots
            .values()
            .find(|b| b.region.contains(addr))
            .map(|b| b.region.slot)
    }

    /// Snapshot of the installed regions, ordered by slot id.
    #[must_use]
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.slots.values().map(|b| b.region).collect()
    }

    /// Number of installed slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no slot is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn locate(&self, addr: GuestAddress, len: usize) -> Result<(&GuardedBuffer, usize)> {
        let buffer = self
            .slots
            .values()
            .find(|b| b.region.contains_range(addr, len as u64))
            .ok_or_else(|| {
                HarnessError::protocol(format!(
                    "guest range {addr} (+{len:#x}) is not backed by a single slot"
                ))
            })?;
        Ok((buffer, (addr.raw() - buffer.region.guest_addr.raw()) as usize))
    }

    /// Copies guest memory at `addr` into `buf`.
    pub fn read(&self, addr: GuestAddress, buf: &mut [u8]) -> Result<()> {
        let (buffer, offset) = self.locate(addr, buf.len())?;
        buf.copy_from_slice(&buffer.as_slice()[offset..offset + buf.len()]);
        Ok(())
    }

    /// Copies `data` into guest memory at `addr`.
    pub fn write(&mut self, addr: GuestAddress, data: &[u8]) -> Result<()> {
        let (buffer, offset) = self.locate(addr, data.len())?;
        let slot = buffer.region.slot;
        let buffer = self
            .slots
            .get_mut(&slot)
            .ok_or_else(|| HarnessError::protocol(format!("memory slot {slot} vanished")))?;
        buffer.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads a NUL terminated string starting at `addr`, at most `max` bytes,
    /// without crossing the end of its slot.
    pub fn read_cstr(&self, addr: GuestAddress, max: usize) -> Result<String> {
        let (buffer, offset) = self.locate(addr, 1)?;
        let tail = &buffer.as_slice()[offset..];
        let tail = &tail[..tail.len().min(max)];
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    /// Releases every buffer. Slots stay registered with the VM until the VM
    /// itself is closed, so call this only while tearing the VM down.
    pub(crate) fn release(&mut self) {
        if !self.slots.is_empty() {
            tracing::debug!("Releasing {} guest memory slots", self.slots.len());
        }
        self.slots.clear();
    }
}

/// Host memory shortage is `ResourceUnavailable`; any other mapping failure
/// is passed through as `Io`.
fn reserve_error(slot: u32, len: u64, err: std::io::Error) -> HarnessError {
    match err.raw_os_error() {
        Some(libc::ENOMEM | libc::EAGAIN) => HarnessError::resource(format!(
            "failed to reserve {len:#x} bytes for memory slot {slot}: {err}"
        )),
        _ => HarnessError::Io(err),
    }
}

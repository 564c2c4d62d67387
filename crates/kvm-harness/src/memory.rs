//! Guest memory types and utilities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A guest physical address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Creates a new guest address.
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw address value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Returns the address offset by the given amount, or `None` on overflow.
    #[must_use]
    pub const fn checked_offset(&self, offset: u64) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Aligns the address down to the given alignment.
    #[must_use]
    pub const fn align_down(&self, alignment: u64) -> Self {
        Self(self.0 - self.0 % alignment)
    }

    /// Returns the offset of this address inside its `alignment` sized block.
    #[must_use]
    pub const fn offset_in(&self, alignment: u64) -> u64 {
        self.0 % alignment
    }
}

impl fmt::Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for GuestAddress {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<GuestAddress> for u64 {
    fn from(addr: GuestAddress) -> Self {
        addr.0
    }
}

/// Guest access rights of a memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Guest writes trap to the host as MMIO exits.
    ReadOnly,
    #[default]
    ReadWrite,
}

/// One installed guest-physical memory slot.
///
/// `guest_addr` and `size` describe the page-aligned backing as registered
/// with the hypervisor, not the address the caller originally asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Slot identifier.
    pub slot: u32,
    /// Guest physical address of the region start.
    pub guest_addr: GuestAddress,
    /// Size of the region in bytes.
    pub size: u64,
    /// Guest access rights.
    pub access: Access,
}

impl MemoryRegion {
    /// Returns the end address of the region (exclusive), as a `u128` so the
    /// slot ending exactly at 2^64 is representable.
    #[must_use]
    pub const fn end(&self) -> u128 {
        self.guest_addr.0 as u128 + self.size as u128
    }

    /// Checks if the region contains the given address.
    #[must_use]
    pub const fn contains(&self, addr: GuestAddress) -> bool {
        addr.0 >= self.guest_addr.0 && (addr.0 as u128) < self.end()
    }

    /// Checks if the region contains the whole range `[addr, addr + len)`.
    #[must_use]
    pub const fn contains_range(&self, addr: GuestAddress, len: u64) -> bool {
        addr.0 >= self.guest_addr.0 && addr.0 as u128 + len as u128 <= self.end()
    }

    /// Checks if the region overlaps `[start, start + len)`.
    #[must_use]
    pub const fn overlaps(&self, start: GuestAddress, len: u64) -> bool {
        let other_end = start.0 as u128 + len as u128;
        (start.0 as u128) < self.end() && other_end > self.guest_addr.0 as u128
    }
}

/// Standard page size (4KB).
pub const PAGE_SIZE: u64 = 4096;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Top of the 32-bit guest physical address space.
pub const GUEST_ADDR_LIMIT_32: u64 = 1 << 32;

/// Rounds `value` up to a multiple of `alignment`, `None` on overflow.
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    let rem = value % alignment;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(alignment - rem)
    }
}

/// Returns the host page size.
///
/// Falls back to [`PAGE_SIZE`] if `sysconf` cannot answer.
#[must_use]
pub fn host_page_size() -> u64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => PAGE_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PAGE_SIZE), Some(0));
        assert_eq!(align_up(1, PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(align_up(0xff8, PAGE_SIZE), Some(0x1000));
        assert_eq!(align_up(u64::MAX, PAGE_SIZE), None);
    }

    #[test]
    fn test_guest_address_alignment() {
        let addr = GuestAddress::new(0xffff_fff0);
        assert_eq!(addr.align_down(PAGE_SIZE), GuestAddress::new(0xffff_f000));
        assert_eq!(addr.offset_in(PAGE_SIZE), 0xff0);
        assert_eq!(addr.to_string(), "0xfffffff0");
        assert_eq!(GuestAddress::new(u64::MAX).checked_offset(1), None);
    }

    #[test]
    fn test_region_bounds() {
        let region = MemoryRegion {
            slot: 1,
            guest_addr: GuestAddress::new(0xffff_f000),
            size: 0x1000,
            access: Access::ReadWrite,
        };

        assert_eq!(region.end(), 0x1_0000_0000);
        assert!(region.contains(GuestAddress::new(0xffff_fff0)));
        assert!(!region.contains(GuestAddress::new(0x1_0000_0000)));
        assert!(region.contains_range(GuestAddress::new(0xffff_fff0), 0x10));
        assert!(!region.contains_range(GuestAddress::new(0xffff_fff0), 0x11));
        assert!(region.overlaps(GuestAddress::new(0xffff_e000), 0x1001));
        assert!(!region.overlaps(GuestAddress::new(0xffff_e000), 0x1000));
    }

    #[test]
    fn test_region_at_top_of_address_space() {
        let region = MemoryRegion {
            slot: 0,
            guest_addr: GuestAddress::new(u64::MAX - 0xfff),
            size: 0x1000,
            access: Access::ReadOnly,
        };
        assert!(region.contains(GuestAddress::new(u64::MAX)));
        assert!(region.contains_range(GuestAddress::new(u64::MAX), 1));
    }

    #[test]
    fn test_host_page_size() {
        let page = host_page_size();
        assert!(page >= PAGE_SIZE);
        assert!(page.is_power_of_two());
    }
}

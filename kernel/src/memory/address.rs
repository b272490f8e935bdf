//! Typed 32-bit physical and virtual addresses.
//!
//! A virtual address splits into a 10-bit directory index, a 10-bit table
//! index and a 12-bit page offset:
//!
//! ```text
//! | 31 ‒ 22   | 21 ‒ 12 | 11 ‒ 0 |
//! | directory |  table  | offset |
//! ```

use core::fmt;

use crate::constants::memory::PAGE_SIZE;

/// A physical memory address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

/// A virtual memory address in the single kernel address space.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Start address of frame `index`.
    pub const fn from_frame_index(index: usize) -> Self {
        Self(index as u32 * PAGE_SIZE)
    }

    /// Index of the frame containing this address.
    pub const fn frame_index(self) -> usize {
        (self.0 / PAGE_SIZE) as usize
    }

    pub const fn is_aligned(self, align: u32) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Bits 31..22, selecting the page directory entry.
    pub const fn directory_index(self) -> usize {
        ((self.0 >> 22) & 0x3FF) as usize
    }

    /// Bits 21..12, selecting the entry inside a page table.
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }

    /// Bits 11..0, the byte inside the page.
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn align_down(self, align: u32) -> Self {
        Self(align_down(self.0, align))
    }

    pub const fn is_aligned(self, align: u32) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Address `bytes` further up, or `None` past the top of the address space.
    pub const fn checked_add(self, bytes: u32) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Distance in bytes from `base` to `self`.
    pub const fn offset_from(self, base: VirtAddr) -> u32 {
        self.0 - base.0
    }
}

impl core::ops::Add<u32> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

impl core::ops::Sub<u32> for VirtAddr {
    type Output = Self;

    fn sub(self, rhs: u32) -> Self {
        Self(self.0 - rhs)
    }
}

impl core::ops::Add<u32> for PhysAddr {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Align `x` down to a multiple of `align`, which must be a power of two.
#[inline]
pub const fn align_down(x: u32, align: u32) -> u32 {
    x & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_address_splits_into_indices() {
        let va = VirtAddr::new(0xC010_2ABC);
        assert_eq!(va.directory_index(), 768);
        assert_eq!(va.table_index(), 0x102);
        assert_eq!(va.page_offset(), 0xABC);
        assert_eq!(va.align_down(PAGE_SIZE), VirtAddr::new(0xC010_2000));
    }

    #[test]
    fn heap_base_lands_in_directory_640() {
        let va = VirtAddr::new(0xA000_0000);
        assert_eq!(va.directory_index(), 640);
        assert_eq!(va.table_index(), 0);
    }

    #[test]
    fn frame_index_round_trips_through_address() {
        let pa = PhysAddr::new(0x20_8000);
        assert_eq!(pa.frame_index(), 520);
        assert_eq!(PhysAddr::from_frame_index(520), pa);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(8191, 4096), 4096);
        assert!(VirtAddr::new(0x3000).is_aligned(PAGE_SIZE));
        assert!(!PhysAddr::new(0x3001).is_aligned(PAGE_SIZE));
        assert_eq!(VirtAddr::new(u32::MAX - 1).checked_add(2), None);
    }
}

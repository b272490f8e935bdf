//! Two-level 32-bit paging.
//!
//! The kernel has exactly one address space. Its page directory and 1024
//! page tables live in one statically sized [`PagingStructures`] block,
//! which [`Paging::init`] fills with an identity map of the full 4 GiB plus
//! a higher-half alias of the first 4 MiB.
//!
//! Bring-up runs through a fixed sequence of [`PagingState`]s; nothing ever
//! moves backwards.

use core::{
    fmt,
    ops::{Index, IndexMut},
};

use bitflags::bitflags;
use log::{debug, error, info};
use thiserror::Error;

use super::{
    address::{PhysAddr, VirtAddr},
    frame_allocator::FrameAllocator,
    mmu::Mmu,
    MemoryWindow,
};
use crate::constants::memory::{
    DIRECTORY_ENTRIES, KERNEL_VIRTUAL_BASE, PAGE_SIZE, TABLE_ENTRIES,
};

bitflags! {
    /// Flag bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        /// 4 MiB page; only meaningful in a directory entry.
        const HUGE_PAGE = 1 << 7;
    }
}

/// Flags used for every entry of the boot-time identity map.
pub const IDENTITY_FLAGS: PageTableFlags = PageTableFlags::PRESENT
    .union(PageTableFlags::WRITABLE)
    .union(PageTableFlags::USER_ACCESSIBLE);

const ADDRESS_MASK: u32 = !(PAGE_SIZE - 1);

/// A directory or table entry: page-aligned physical base OR'd with flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn new(addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((addr.as_u32() & ADDRESS_MASK) | flags.bits())
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDRESS_MASK)
    }

    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    pub const fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        *self = Self::new(addr, flags);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("address", &self.address())
            .field("flags", &self.flags())
            .finish()
    }
}

/// One 4 KiB page directory or page table.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry(0); TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::default());
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// The directory followed by the 1024 tables it starts out pointing at.
///
/// Table `i` sits at `base + (i + 1) * PAGE_SIZE`.
#[repr(C, align(4096))]
#[allow(dead_code)] // only ever reached through its physical address
pub struct PagingStructures {
    directory: PageTable,
    tables: [PageTable; DIRECTORY_ENTRIES],
}

impl PagingStructures {
    pub const SIZE: u32 = core::mem::size_of::<Self>() as u32;

    pub const fn new() -> Self {
        const EMPTY: PageTable = PageTable::new();
        Self {
            directory: EMPTY,
            tables: [EMPTY; DIRECTORY_ENTRIES],
        }
    }
}

impl Default for PagingStructures {
    fn default() -> Self {
        Self::new()
    }
}

/// Bring-up progress of the paging manager, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PagingState {
    Uninitialized,
    TablesBuilt,
    DirectoryBuilt,
    HigherHalfAliased,
    TranslationEnabled,
}

impl PagingState {
    /// The only state reachable from `self`.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Uninitialized => Some(Self::TablesBuilt),
            Self::TablesBuilt => Some(Self::DirectoryBuilt),
            Self::DirectoryBuilt => Some(Self::HigherHalfAliased),
            Self::HigherHalfAliased => Some(Self::TranslationEnabled),
            Self::TranslationEnabled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PagingError {
    #[error("no physical frame left for a page table covering {0}")]
    TableAllocation(VirtAddr),
    #[error("paging cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: PagingState, to: PagingState },
}

/// Anything that can install and remove single-page translations.
pub trait Mapper {
    /// Maps the page at `virt` to the frame at `phys`.
    ///
    /// Missing page tables are allocated from `frames`.
    fn map<A: FrameAllocator>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        frames: &mut A,
    ) -> Result<(), PagingError>;

    /// Removes the translation for `virt`, if there is one.
    fn unmap(&mut self, virt: VirtAddr);

    /// Resolves `virt` to its physical address, if mapped.
    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr>;
}

/// Owns the page directory, its tables and the MMU.
pub struct Paging<W: MemoryWindow, M: Mmu> {
    window: W,
    mmu: M,
    structures: PhysAddr,
    state: PagingState,
}

impl<W: MemoryWindow, M: Mmu> Paging<W, M> {
    /// # Safety
    /// `structures` must be the 4 KiB aligned physical base of a zeroed
    /// [`PagingStructures`] block reachable through `window`, used by nothing
    /// else for as long as the returned value lives.
    pub unsafe fn new(window: W, mmu: M, structures: PhysAddr) -> Self {
        debug_assert!(structures.is_aligned(PAGE_SIZE));
        Self {
            window,
            mmu,
            structures,
            state: PagingState::Uninitialized,
        }
    }

    /// Runs the whole bring-up sequence and turns translation on.
    pub fn init(&mut self) -> Result<(), PagingError> {
        self.build_tables()?;
        self.build_directory()?;
        self.alias_kernel_high_half()?;
        self.enable()?;

        info!("Paging enabled, page directory at {}", self.directory_addr());
        Ok(())
    }

    pub fn state(&self) -> PagingState {
        self.state
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    /// Physical address of the page directory.
    pub fn directory_addr(&self) -> PhysAddr {
        self.structures
    }

    /// Fills every static table so that the whole 4 GiB is identity mapped.
    pub fn build_tables(&mut self) -> Result<(), PagingError> {
        self.check_transition(PagingState::TablesBuilt)?;

        for directory_index in 0..DIRECTORY_ENTRIES {
            let table_addr = self.static_table_addr(directory_index);
            // SAFETY: static tables are part of the block `new` was given.
            let table = unsafe { self.table_mut(table_addr) };
            for (table_index, entry) in table.entries.iter_mut().enumerate() {
                let frame = PhysAddr::from_frame_index(directory_index * TABLE_ENTRIES + table_index);
                entry.set(frame, IDENTITY_FLAGS);
            }
        }

        self.state = PagingState::TablesBuilt;
        debug!("Identity page tables built");
        Ok(())
    }

    /// Points directory entry `i` at static table `i`.
    pub fn build_directory(&mut self) -> Result<(), PagingError> {
        self.check_transition(PagingState::DirectoryBuilt)?;

        for directory_index in 0..DIRECTORY_ENTRIES {
            let table_addr = self.static_table_addr(directory_index);
            self.directory_mut()[directory_index].set(table_addr, IDENTITY_FLAGS);
        }

        self.state = PagingState::DirectoryBuilt;
        debug!("Page directory built");
        Ok(())
    }

    /// Makes the 4 MiB at [`KERNEL_VIRTUAL_BASE`] share table 0, so the
    /// higher-half kernel still reaches the bitmap and other early
    /// structures in low physical memory.
    pub fn alias_kernel_high_half(&mut self) -> Result<(), PagingError> {
        self.check_transition(PagingState::HigherHalfAliased)?;

        let kernel_index = VirtAddr::new(KERNEL_VIRTUAL_BASE).directory_index();
        let low_table = self.static_table_addr(0);
        self.directory_mut()[kernel_index].set(low_table, IDENTITY_FLAGS);

        self.state = PagingState::HigherHalfAliased;
        debug!("Directory entry {} aliased to the first 4 MiB", kernel_index);
        Ok(())
    }

    /// Loads the directory into CR3 and sets the paging bit.
    pub fn enable(&mut self) -> Result<(), PagingError> {
        self.check_transition(PagingState::TranslationEnabled)?;

        // SAFETY: the state check guarantees the identity map and the
        // higher-half alias are in place, so running code stays mapped.
        unsafe {
            self.mmu.load_directory(self.structures);
            self.mmu.enable_translation();
        }

        self.state = PagingState::TranslationEnabled;
        Ok(())
    }

    /// Maps the page at `virt` to `phys` with `flags`.
    ///
    /// If the directory slot has no table yet, one is taken from `frames`,
    /// zeroed and linked in with the same `flags`. Failing to get that frame
    /// is reported as [`PagingError::TableAllocation`].
    pub fn map<A: FrameAllocator>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        frames: &mut A,
    ) -> Result<(), PagingError> {
        let directory_index = virt.directory_index();
        let mut table_addr = self.directory()[directory_index].address();

        if table_addr.is_null() {
            let Some(frame) = frames.allocate_frame() else {
                error!("No frame left for the page table covering {}", virt);
                return Err(PagingError::TableAllocation(virt));
            };

            // SAFETY: the frame was just handed to us by the allocator.
            let table = unsafe { self.table_mut(frame) };
            table.zero();
            self.directory_mut()[directory_index].set(frame, flags);
            debug!(
                "New page table for directory entry {} at {}",
                directory_index, frame
            );
            table_addr = frame;
        }

        let was_present = {
            // SAFETY: the directory only ever points at tables we own.
            let table = unsafe { self.table_mut(table_addr) };
            let entry = &mut table[virt.table_index()];
            let was_present = entry.is_present();
            entry.set(phys, flags);
            was_present
        };

        if was_present {
            self.mmu.flush_page(virt);
        }
        Ok(())
    }

    /// Clears the translation for `virt`. Unmapped addresses are left alone.
    pub fn unmap(&mut self, virt: VirtAddr) {
        let directory_entry = self.directory()[virt.directory_index()];
        if !directory_entry.is_present() {
            return;
        }

        {
            // SAFETY: the directory only ever points at tables we own.
            let table = unsafe { self.table_mut(directory_entry.address()) };
            let entry = &mut table[virt.table_index()];
            if !entry.is_present() {
                return;
            }
            entry.clear();
        }

        self.mmu.flush_page(virt);
    }

    /// The present leaf entry translating `virt`, if any.
    pub fn entry(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        let directory_entry = self.directory()[virt.directory_index()];
        if !directory_entry.is_present() {
            return None;
        }

        // SAFETY: the directory only ever points at tables we own.
        let table = unsafe { self.table(directory_entry.address()) };
        let entry = table[virt.table_index()];
        entry.is_present().then_some(entry)
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.entry(virt)
            .map(|entry| entry.address() + virt.page_offset())
    }

    fn check_transition(&self, to: PagingState) -> Result<(), PagingError> {
        if self.state.next() == Some(to) {
            Ok(())
        } else {
            Err(PagingError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn static_table_addr(&self, directory_index: usize) -> PhysAddr {
        self.structures + (directory_index as u32 + 1) * PAGE_SIZE
    }

    fn directory(&self) -> &PageTable {
        // SAFETY: the directory is the first page of our structures block.
        unsafe { self.table(self.structures) }
    }

    fn directory_mut(&mut self) -> &mut PageTable {
        let structures = self.structures;
        // SAFETY: the directory is the first page of our structures block.
        unsafe { self.table_mut(structures) }
    }

    /// # Safety
    /// `addr` must be a page table owned by this manager.
    unsafe fn table(&self, addr: PhysAddr) -> &PageTable {
        unsafe { &*self.window.phys_to_ptr(addr).cast::<PageTable>() }
    }

    /// # Safety
    /// `addr` must be a page table owned by this manager.
    unsafe fn table_mut(&mut self, addr: PhysAddr) -> &mut PageTable {
        unsafe { &mut *self.window.phys_to_ptr(addr).cast::<PageTable>() }
    }
}

impl<W: MemoryWindow, M: Mmu> Mapper for Paging<W, M> {
    fn map<A: FrameAllocator>(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        frames: &mut A,
    ) -> Result<(), PagingError> {
        Paging::map(self, virt, phys, flags, frames)
    }

    fn unmap(&mut self, virt: VirtAddr) {
        Paging::unmap(self, virt);
    }

    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        Paging::translate(self, virt)
    }
}

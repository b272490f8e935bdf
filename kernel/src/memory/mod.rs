pub mod address;
pub mod bitmap_frame_allocator;
pub mod frame_allocator;
pub mod heap;
pub mod mmu;
pub mod paging;
pub mod tlb;

#[cfg(test)]
pub(crate) mod testing;

use address::{PhysAddr, VirtAddr};
use bitmap_frame_allocator::BitmapFrameAllocator;
use heap::{Heap, HeapError};
use log::info;
use mmu::Mmu;
use paging::{PageTableFlags, Paging, PagingError, PagingStructures};
use thiserror::Error;

use crate::constants::memory::{BITMAP_ADDR, BITMAP_SIZE, HEAP_INIT_SIZE, HEAP_START};

/// Turns addresses into pointers the allocators can dereference.
///
/// The bitmap and the page tables are reached by physical address, the heap
/// arena by virtual address.
pub trait MemoryWindow: Clone {
    fn phys_to_ptr(&self, addr: PhysAddr) -> *mut u8;
    fn virt_to_ptr(&self, addr: VirtAddr) -> *mut u8;
}

/// The kernel's view: the whole 4 GiB space is identity mapped, so an
/// address is its own pointer both before and after translation is on.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityWindow;

impl MemoryWindow for IdentityWindow {
    fn phys_to_ptr(&self, addr: PhysAddr) -> *mut u8 {
        addr.as_u32() as usize as *mut u8
    }

    fn virt_to_ptr(&self, addr: VirtAddr) -> *mut u8 {
        addr.as_u32() as usize as *mut u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("physical allocator self test failed")]
    FrameSelfTest,
    #[error("paging structures at {0} overlap the frame bitmap")]
    StructuresOverlapBitmap(PhysAddr),
    #[error(transparent)]
    Paging(#[from] PagingError),
    #[error(transparent)]
    Heap(#[from] HeapError),
}

/// The physical allocator, paging and the heap, brought up in boot order.
///
/// Paging and the heap borrow the physical allocator only for the duration
/// of a call, so there is exactly one owner of each piece of state.
pub struct KernelMemory<W: MemoryWindow, M: Mmu> {
    frames: BitmapFrameAllocator<W>,
    paging: Paging<W, M>,
    heap: Heap<W>,
}

impl<W: MemoryWindow, M: Mmu> KernelMemory<W, M> {
    /// Initializes the physical allocator with `usable_memory` bytes, turns
    /// on paging with the tables at `structures`, then maps the initial heap.
    ///
    /// # Safety
    /// Everything [`BitmapFrameAllocator::init`], [`Paging::new`] and
    /// [`Heap::init`] require: `structures` is a zeroed
    /// [`PagingStructures`] block, and `window` reaches the bitmap, the
    /// structures and the heap arena.
    ///
    /// A structures block that overlaps the bitmap is rejected before
    /// anything is written.
    pub unsafe fn init(
        usable_memory: u32,
        window: W,
        mmu: M,
        structures: PhysAddr,
    ) -> Result<Self, InitError> {
        if overlaps_bitmap(structures) {
            return Err(InitError::StructuresOverlapBitmap(structures));
        }

        let mut frames = unsafe { BitmapFrameAllocator::init(usable_memory, window.clone()) };
        frames.reserve_range(structures, PagingStructures::SIZE);
        if cfg!(debug_assertions) && !frames.self_test() {
            return Err(InitError::FrameSelfTest);
        }

        let mut paging = unsafe { Paging::new(window.clone(), mmu, structures) };
        paging.init()?;

        let heap = unsafe {
            Heap::init(
                window,
                VirtAddr::new(HEAP_START),
                HEAP_INIT_SIZE,
                &mut frames,
                &mut paging,
            )?
        };

        info!(
            "Kernel memory ready: {} of {} frames free",
            frames.free_count(),
            frames.total_frames()
        );
        Ok(Self {
            frames,
            paging,
            heap,
        })
    }

    pub fn kmalloc(&mut self, size: usize) -> Option<VirtAddr> {
        self.heap.allocate(size, &mut self.frames, &mut self.paging)
    }

    pub fn kmalloc_aligned(&mut self, size: usize, align: usize) -> Option<VirtAddr> {
        self.heap
            .allocate_aligned(size, align, &mut self.frames, &mut self.paging)
    }

    pub fn kmalloc_page_aligned(&mut self, size: usize) -> Option<VirtAddr> {
        self.heap
            .allocate_page_aligned(size, &mut self.frames, &mut self.paging)
    }

    pub fn kfree(&mut self, addr: VirtAddr) {
        self.heap.free(addr);
    }

    /// Maps one page, taking any missing page table from the physical
    /// allocator.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), PagingError> {
        self.paging.map(virt, phys, flags, &mut self.frames)
    }

    pub fn unmap_page(&mut self, virt: VirtAddr) {
        self.paging.unmap(virt);
    }

    pub fn frames(&self) -> &BitmapFrameAllocator<W> {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut BitmapFrameAllocator<W> {
        &mut self.frames
    }

    pub fn paging(&self) -> &Paging<W, M> {
        &self.paging
    }

    pub fn heap(&self) -> &Heap<W> {
        &self.heap
    }
}

fn overlaps_bitmap(structures: PhysAddr) -> bool {
    let start = structures.as_u32() as u64;
    let end = start + PagingStructures::SIZE as u64;
    let bitmap_start = BITMAP_ADDR as u64;
    let bitmap_end = bitmap_start + BITMAP_SIZE as u64;
    start < bitmap_end && bitmap_start < end
}

#[cfg(target_arch = "x86")]
pub use kernel_instance::*;

/// The single bare-metal instance and the free functions over it.
#[cfg(target_arch = "x86")]
mod kernel_instance {
    use core::{cell::UnsafeCell, ptr};

    use spin::Mutex;

    use super::{
        address::{PhysAddr, VirtAddr},
        mmu::X86Mmu,
        paging::PagingStructures,
        IdentityWindow, KernelMemory,
    };
    use crate::constants::memory::HEAP_BLOCK_HEADER_SIZE;

    #[repr(transparent)]
    struct StructuresCell(UnsafeCell<PagingStructures>);

    // SAFETY: only `init` takes the address, once, and hands it to paging.
    unsafe impl Sync for StructuresCell {}

    static PAGING_STRUCTURES: StructuresCell =
        StructuresCell(UnsafeCell::new(PagingStructures::new()));

    pub type Memory = KernelMemory<IdentityWindow, X86Mmu>;

    pub static KERNEL_MEMORY: Mutex<Option<Memory>> = Mutex::new(None);

    /// Brings up memory management with the usable memory reported by the
    /// boot loader. Panics if any stage fails or if called twice.
    pub fn init(usable_memory: u32) {
        let mut guard = KERNEL_MEMORY.lock();
        assert!(guard.is_none(), "kernel memory initialized twice");

        // The kernel image runs identity mapped, so the static's address is
        // also its physical address.
        let structures = PhysAddr::new(PAGING_STRUCTURES.0.get() as usize as u32);
        // SAFETY: the structures static is zeroed and used by nothing else,
        // and the identity window reaches all of memory.
        let memory = unsafe { Memory::init(usable_memory, IdentityWindow, X86Mmu, structures) }
            .unwrap_or_else(|err| panic!("Failed to initialize kernel memory: {err}"));

        *guard = Some(memory);
    }

    /// Runs `f` with the kernel memory locked.
    ///
    /// Panics if [`init`] has not run.
    pub fn with_kernel_memory<R>(f: impl FnOnce(&mut Memory) -> R) -> R {
        let mut guard = KERNEL_MEMORY.lock();
        let memory = guard
            .as_mut()
            .expect("kernel memory used before memory::init");
        f(memory)
    }

    fn to_ptr(addr: Option<VirtAddr>) -> *mut u8 {
        addr.map_or(ptr::null_mut(), |addr| addr.as_u32() as usize as *mut u8)
    }

    /// Allocates `size` bytes from the kernel heap. Null on failure, or if
    /// memory is not initialized yet.
    pub fn kmalloc(size: usize) -> *mut u8 {
        kmalloc_aligned(size, HEAP_BLOCK_HEADER_SIZE as usize)
    }

    pub fn kmalloc_aligned(size: usize, align: usize) -> *mut u8 {
        to_ptr(
            KERNEL_MEMORY
                .lock()
                .as_mut()
                .and_then(|memory| memory.kmalloc_aligned(size, align)),
        )
    }

    pub fn kmalloc_page_aligned(size: usize) -> *mut u8 {
        to_ptr(
            KERNEL_MEMORY
                .lock()
                .as_mut()
                .and_then(|memory| memory.kmalloc_page_aligned(size)),
        )
    }

    /// # Safety
    /// `ptr` must be null or come from one of the `kmalloc` functions and
    /// not have been freed yet.
    pub unsafe fn kfree(ptr: *mut u8) {
        if let Some(memory) = KERNEL_MEMORY.lock().as_mut() {
            memory.kfree(VirtAddr::new(ptr as usize as u32));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::{PAGE_SIZE, RESERVED_LOW_MEMORY_END};
    use crate::memory::{
        paging::{PagingState, IDENTITY_FLAGS},
        testing::{RecordingMmu, TestMemory, TestWindow, TEST_RAM_SIZE, TEST_STRUCTURES_ADDR},
    };

    const MIB: u32 = 1024 * 1024;
    const RESERVED_FRAMES: usize = (RESERVED_LOW_MEMORY_END / PAGE_SIZE) as usize;
    const STRUCTURE_FRAMES: usize = (PagingStructures::SIZE / PAGE_SIZE) as usize;
    const HEAP_FRAMES: usize = (HEAP_INIT_SIZE / PAGE_SIZE) as usize;

    fn boot(
        memory: &mut TestMemory,
        usable: u32,
    ) -> Result<KernelMemory<TestWindow, RecordingMmu>, InitError> {
        unsafe {
            KernelMemory::init(
                usable,
                memory.window(),
                RecordingMmu::default(),
                TEST_STRUCTURES_ADDR,
            )
        }
    }

    #[test]
    fn boot_order_leaves_every_subsystem_ready() {
        let mut memory = TestMemory::new(TEST_RAM_SIZE, 2 * MIB as usize);
        let kernel = boot(&mut memory, 16 * MIB).expect("init");

        assert_eq!(kernel.paging().state(), PagingState::TranslationEnabled);
        assert_eq!(kernel.paging().mmu().loaded_directory, Some(TEST_STRUCTURES_ADDR));
        assert_eq!(kernel.heap().heap_start(), VirtAddr::new(HEAP_START));
        assert_eq!(kernel.heap().free_bytes(), HEAP_INIT_SIZE);
        assert_eq!(
            kernel.frames().free_count(),
            4096 - RESERVED_FRAMES - STRUCTURE_FRAMES - HEAP_FRAMES
        );
    }

    #[test]
    fn structures_are_never_handed_out() {
        let mut memory = TestMemory::new(TEST_RAM_SIZE, 2 * MIB as usize);
        let mut kernel = boot(&mut memory, 16 * MIB).expect("init");
        let structures_end = TEST_STRUCTURES_ADDR + PagingStructures::SIZE;

        while let Ok(frame) = kernel.frames_mut().allocate() {
            assert!(frame < TEST_STRUCTURES_ADDR || frame >= structures_end);
        }
        assert_eq!(kernel.frames().free_count(), 0);
    }

    #[test]
    fn kmalloc_and_kfree_round_trip_through_the_heap() {
        let mut memory = TestMemory::new(TEST_RAM_SIZE, 2 * MIB as usize);
        let mut kernel = boot(&mut memory, 16 * MIB).expect("init");

        let small = kernel.kmalloc(64).expect("small");
        let page = kernel.kmalloc_page_aligned(PAGE_SIZE as usize).expect("page");
        assert!(page.is_aligned(PAGE_SIZE));
        assert_eq!(kernel.kmalloc(0), None);

        kernel.kfree(page);
        kernel.kfree(small);
        assert_eq!(kernel.heap().free_bytes(), HEAP_INIT_SIZE);
        assert_eq!(kernel.heap().free_block_count(), 1);
    }

    #[test]
    fn map_page_installs_the_entry_and_unmap_removes_it() {
        let mut memory = TestMemory::new(TEST_RAM_SIZE, 2 * MIB as usize);
        let mut kernel = boot(&mut memory, 16 * MIB).expect("init");
        let virt = VirtAddr::new(0x40_0000);
        let phys = PhysAddr::new(0x10_0000);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        let free_before = kernel.frames().free_count();

        kernel.map_page(virt, phys, flags).expect("map");
        assert_eq!(
            kernel.paging().entry(virt).map(|entry| entry.raw()),
            Some(0x10_0000 | flags.bits())
        );

        kernel.unmap_page(virt);
        assert_eq!(kernel.paging().translate(virt), None);

        kernel
            .map_page(virt, PhysAddr::new(virt.as_u32()), IDENTITY_FLAGS)
            .expect("remap");
        assert_eq!(kernel.paging().translate(virt), Some(PhysAddr::new(0x40_0000)));
        assert_eq!(kernel.frames().free_count(), free_before);
    }

    #[test]
    fn structures_across_the_bitmap_are_rejected() {
        let mut memory = TestMemory::new(TEST_RAM_SIZE, 2 * MIB as usize);
        let structures = PhysAddr::new(0x1F_F000);

        let result = unsafe {
            KernelMemory::init(16 * MIB, memory.window(), RecordingMmu::default(), structures)
        };

        assert!(matches!(
            result,
            Err(InitError::StructuresOverlapBitmap(addr)) if addr == structures
        ));
    }

    #[test]
    fn structures_starting_right_after_the_bitmap_are_accepted() {
        let bitmap_end = BITMAP_ADDR + BITMAP_SIZE as u32;

        assert!(!overlaps_bitmap(PhysAddr::new(bitmap_end)));
        assert!(!overlaps_bitmap(TEST_STRUCTURES_ADDR));
        assert!(overlaps_bitmap(PhysAddr::new(bitmap_end - PAGE_SIZE)));
        assert!(overlaps_bitmap(PhysAddr::new(0)));
    }

    #[test]
    fn too_little_memory_for_the_heap_fails_init() {
        let mut memory = TestMemory::new(TEST_RAM_SIZE, 2 * MIB as usize);
        let usable = RESERVED_LOW_MEMORY_END + 16 * PAGE_SIZE;

        assert!(matches!(
            boot(&mut memory, usable),
            Err(InitError::Heap(HeapError::OutOfFrames))
        ));
    }
}

//! The Kernel Heap
//!
//! A first-fit free-list allocator over a virtual arena that starts at
//! [`HEAP_START`](crate::constants::memory::HEAP_START). Every block begins
//! with an 8-byte [`BlockHeader`]; callers get the address right after it.
//!
//! ```text
//! +------+------+---------------------------+
//! | size | next | payload                   |
//! +------+------+---------------------------+
//! ^ block       ^ address handed to callers
//! ```
//!
//! Free blocks are kept sorted by address and merged with adjacent free
//! blocks on [`Heap::free`]. The arena grows a page at a time at its end,
//! with frames from the physical allocator mapped through paging, and never
//! shrinks.

use core::ptr;

use log::{debug, info, warn};
use thiserror::Error;

use super::{
    address::VirtAddr,
    frame_allocator::{FrameAllocator, FrameDeallocator},
    paging::{Mapper, PageTableFlags, PagingError},
    MemoryWindow,
};
use crate::constants::memory::{HEAP_BLOCK_HEADER_SIZE, PAGE_SIZE};

const HEADER_SIZE: u32 = HEAP_BLOCK_HEADER_SIZE;

/// Block addresses and sizes are always multiples of this.
const BLOCK_ALIGN: u32 = HEAP_BLOCK_HEADER_SIZE;

const HEAP_PAGE_FLAGS: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    /// Bytes in the whole block, header included.
    size: u32,
    /// Address of the next free block, 0 at the end of the list. Meaningless
    /// while the block is allocated.
    next: u32,
}

const _: () = assert!(core::mem::size_of::<BlockHeader>() == HEADER_SIZE as usize);

impl BlockHeader {
    fn next(self) -> Option<VirtAddr> {
        (self.next != 0).then(|| VirtAddr::new(self.next))
    }
}

fn link(next: Option<VirtAddr>) -> u32 {
    next.map_or(0, VirtAddr::as_u32)
}

/// Where a block of `total` bytes, whose payload is aligned to `align`,
/// would put its header inside the free block `[block, block + size)`.
fn fit(block: VirtAddr, size: u32, total: u32, align: u32) -> Option<VirtAddr> {
    let header = aligned_header(block, align)?;
    let end = header.as_u32() as u64 + total as u64;
    (end <= block.as_u32() as u64 + size as u64).then_some(header)
}

/// First header position at or after `block` whose payload is aligned.
fn aligned_header(block: VirtAddr, align: u32) -> Option<VirtAddr> {
    let payload = block.checked_add(HEADER_SIZE)?.checked_add(align - 1)?;
    Some(payload.align_down(align) - HEADER_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("no physical frame left to grow the heap")]
    OutOfFrames,
    #[error("the heap would grow past the top of the address space")]
    AddressSpaceExhausted,
    #[error(transparent)]
    Paging(#[from] PagingError),
}

/// Free-list heap over `[start, end)`.
///
/// Allocation and growth borrow the physical allocator and the mapper for
/// the duration of the call; the heap holds on to neither.
pub struct Heap<W: MemoryWindow> {
    window: W,
    start: VirtAddr,
    end: VirtAddr,
    free_list: Option<VirtAddr>,
}

impl<W: MemoryWindow> Heap<W> {
    /// Maps `initial_size` bytes at `start` and turns them into a single
    /// free block.
    ///
    /// # Safety
    /// `start` must be page aligned, and `[start, start + initial_size)` plus
    /// everything above it that the heap later grows into must be unused
    /// virtual address space that `window` reaches once mapped.
    pub unsafe fn init<A, P>(
        window: W,
        start: VirtAddr,
        initial_size: u32,
        frames: &mut A,
        mapper: &mut P,
    ) -> Result<Self, HeapError>
    where
        A: FrameAllocator + FrameDeallocator,
        P: Mapper,
    {
        debug_assert!(start.is_aligned(PAGE_SIZE));
        let mut heap = Self {
            window,
            start,
            end: start,
            free_list: None,
        };
        heap.grow(initial_size, frames, mapper)?;

        info!(
            "Heap initialized at {} with {} KiB",
            heap.start,
            heap.size() / 1024
        );
        Ok(heap)
    }

    pub fn heap_start(&self) -> VirtAddr {
        self.start
    }

    pub fn heap_end(&self) -> VirtAddr {
        self.end
    }

    /// Mapped bytes in the arena.
    pub fn size(&self) -> u32 {
        self.end.offset_from(self.start)
    }

    /// Bytes on the free list, headers included.
    pub fn free_bytes(&self) -> u32 {
        self.free_blocks().map(|(_, header)| header.size).sum()
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks().count()
    }

    /// Usable bytes of the live allocation at `addr`. May exceed what was
    /// asked for when a too-small remainder was handed out with it.
    pub fn allocation_size(&self, addr: VirtAddr) -> u32 {
        self.read_header(addr - HEADER_SIZE).size - HEADER_SIZE
    }

    /// Allocates `size` bytes.
    ///
    /// Returns `None` for a zero size, or when no free block fits and the
    /// heap cannot grow enough.
    pub fn allocate<A, P>(&mut self, size: usize, frames: &mut A, mapper: &mut P) -> Option<VirtAddr>
    where
        A: FrameAllocator + FrameDeallocator,
        P: Mapper,
    {
        self.allocate_aligned(size, BLOCK_ALIGN as usize, frames, mapper)
    }

    /// Allocates `size` bytes starting on a page boundary.
    pub fn allocate_page_aligned<A, P>(
        &mut self,
        size: usize,
        frames: &mut A,
        mapper: &mut P,
    ) -> Option<VirtAddr>
    where
        A: FrameAllocator + FrameDeallocator,
        P: Mapper,
    {
        self.allocate_aligned(size, PAGE_SIZE as usize, frames, mapper)
    }

    /// Allocates `size` bytes at a multiple of `align`, which must be a
    /// power of two.
    ///
    /// The block header always sits right before the returned address; any
    /// padding in front of it stays on the free list.
    pub fn allocate_aligned<A, P>(
        &mut self,
        size: usize,
        align: usize,
        frames: &mut A,
        mapper: &mut P,
    ) -> Option<VirtAddr>
    where
        A: FrameAllocator + FrameDeallocator,
        P: Mapper,
    {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let align = u32::try_from(align).ok()?.max(BLOCK_ALIGN);
        let total = u32::try_from(size)
            .ok()?
            .checked_add(HEADER_SIZE + BLOCK_ALIGN - 1)?
            & !(BLOCK_ALIGN - 1);

        if let Some(addr) = self.take_first_fit(total, align) {
            return Some(addr);
        }

        let Some(shortfall) = self.shortfall(total, align) else {
            warn!("Heap cannot fit {} bytes below the top of the address space", size);
            return None;
        };
        if let Err(err) = self.grow(shortfall, frames, mapper) {
            warn!("Heap allocation of {} bytes failed: {}", size, err);
            return None;
        }

        let addr = self.take_first_fit(total, align);
        debug_assert!(addr.is_some(), "heap grew but still has no fit");
        addr
    }

    /// Gives the allocation at `addr` back, merging it with free neighbours.
    ///
    /// A null address is ignored. Anything else must have come from this
    /// heap and must not have been freed already.
    pub fn free(&mut self, addr: VirtAddr) {
        if addr.is_null() {
            return;
        }
        debug_assert!(self.owns(addr), "freeing {addr}, which is not a heap allocation");
        if !self.owns(addr) {
            return;
        }

        let block = addr - HEADER_SIZE;
        let size = self.read_header(block).size;
        self.insert_free(block, size);
    }

    /// Maps enough whole pages at the end of the arena to cover `bytes` and
    /// links them into the free list, merged with any free block already
    /// ending there. Returns where the new memory starts.
    ///
    /// If frames run out part way, the pages mapped so far stay in the heap.
    pub fn grow<A, P>(&mut self, bytes: u32, frames: &mut A, mapper: &mut P) -> Result<VirtAddr, HeapError>
    where
        A: FrameAllocator + FrameDeallocator,
        P: Mapper,
    {
        let old_end = self.end;
        let result = (0..bytes.div_ceil(PAGE_SIZE)).try_for_each(|_| self.map_page(frames, mapper));

        if self.end > old_end {
            let grown = self.end.offset_from(old_end);
            self.insert_free(old_end, grown);
            debug!("Heap grew by {} pages to {}", grown / PAGE_SIZE, self.end);
        }

        result.map(|()| old_end)
    }

    fn map_page<A, P>(&mut self, frames: &mut A, mapper: &mut P) -> Result<(), HeapError>
    where
        A: FrameAllocator + FrameDeallocator,
        P: Mapper,
    {
        let new_end = self
            .end
            .checked_add(PAGE_SIZE)
            .ok_or(HeapError::AddressSpaceExhausted)?;
        let frame = frames.allocate_frame().ok_or(HeapError::OutOfFrames)?;

        if let Err(err) = mapper.map(self.end, frame, HEAP_PAGE_FLAGS, frames) {
            frames.deallocate_frame(frame);
            return Err(err.into());
        }

        self.end = new_end;
        Ok(())
    }

    /// How far the arena has to grow before a `total`-byte block aligned to
    /// `align` fits at its end.
    fn shortfall(&self, total: u32, align: u32) -> Option<u32> {
        let base = self
            .free_blocks()
            .find(|&(block, header)| block + header.size == self.end)
            .map_or(self.end, |(block, _)| block);

        let end = aligned_header(base, align)?.as_u32().checked_add(total)?;
        Some(end - self.end.as_u32())
    }

    fn take_first_fit(&mut self, total: u32, align: u32) -> Option<VirtAddr> {
        let mut prev = None;
        let mut cursor = self.free_list;

        while let Some(block) = cursor {
            let header = self.read_header(block);
            if let Some(at) = fit(block, header.size, total, align) {
                self.carve(prev, block, header, at, total);
                return Some(at + HEADER_SIZE);
            }
            prev = Some(block);
            cursor = header.next();
        }
        None
    }

    /// Cuts `total` bytes at `at` out of the free block at `block`.
    ///
    /// Padding in front stays on the list as a smaller free block. A tail
    /// longer than one header becomes a new free block; a shorter one goes
    /// out with the allocation.
    fn carve(
        &mut self,
        prev: Option<VirtAddr>,
        block: VirtAddr,
        header: BlockHeader,
        at: VirtAddr,
        total: u32,
    ) {
        let lead = at.offset_from(block);
        let tail = header.size - lead - total;
        let mut successor = header.next();
        let mut used = total;

        if tail > HEADER_SIZE {
            let tail_block = at + total;
            self.write_header(
                tail_block,
                BlockHeader {
                    size: tail,
                    next: header.next,
                },
            );
            successor = Some(tail_block);
        } else {
            used += tail;
        }

        if lead > 0 {
            self.write_header(
                block,
                BlockHeader {
                    size: lead,
                    next: link(successor),
                },
            );
        } else {
            self.set_next(prev, successor);
        }

        self.write_header(at, BlockHeader { size: used, next: 0 });
    }

    /// Links `[block, block + size)` into the address-ordered free list.
    fn insert_free(&mut self, block: VirtAddr, size: u32) {
        let mut prev = None;
        let mut cursor = self.free_list;
        while let Some(current) = cursor.filter(|&current| current < block) {
            prev = Some(current);
            cursor = self.read_header(current).next();
        }

        let mut merged = BlockHeader {
            size,
            next: link(cursor),
        };
        if let Some(next) = cursor {
            debug_assert!(block + size <= next, "free block at {block} overlaps {next}");
            if block + size == next {
                let next_header = self.read_header(next);
                merged.size += next_header.size;
                merged.next = next_header.next;
            }
        }

        if let Some(prev) = prev {
            let mut prev_header = self.read_header(prev);
            debug_assert!(
                prev + prev_header.size <= block,
                "double free of {}",
                block + HEADER_SIZE
            );
            if prev + prev_header.size == block {
                prev_header.size += merged.size;
                prev_header.next = merged.next;
                self.write_header(prev, prev_header);
                return;
            }
        }

        self.write_header(block, merged);
        self.set_next(prev, Some(block));
    }

    fn set_next(&mut self, prev: Option<VirtAddr>, next: Option<VirtAddr>) {
        match prev {
            Some(prev) => {
                let mut header = self.read_header(prev);
                header.next = link(next);
                self.write_header(prev, header);
            }
            None => self.free_list = next,
        }
    }

    fn owns(&self, addr: VirtAddr) -> bool {
        addr >= self.start + HEADER_SIZE && addr < self.end && addr.is_aligned(BLOCK_ALIGN)
    }

    fn free_blocks(&self) -> impl Iterator<Item = (VirtAddr, BlockHeader)> + '_ {
        core::iter::successors(
            self.free_list.map(|block| (block, self.read_header(block))),
            move |&(_, header)| header.next().map(|block| (block, self.read_header(block))),
        )
    }

    fn read_header(&self, block: VirtAddr) -> BlockHeader {
        // SAFETY: block addresses are 8-byte aligned and inside the mapped
        // arena, which `init`'s contract reserves for the heap.
        unsafe { ptr::read(self.window.virt_to_ptr(block).cast::<BlockHeader>()) }
    }

    fn write_header(&mut self, block: VirtAddr, header: BlockHeader) {
        // SAFETY: as in `read_header`.
        unsafe { ptr::write(self.window.virt_to_ptr(block).cast::<BlockHeader>(), header) }
    }
}

/// Routes `alloc` through the kernel heap.
#[cfg(target_arch = "x86")]
pub struct KernelHeapAllocator;

#[cfg(target_arch = "x86")]
unsafe impl core::alloc::GlobalAlloc for KernelHeapAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        super::kmalloc_aligned(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        unsafe { super::kfree(ptr) }
    }
}

#[cfg(all(target_arch = "x86", not(test)))]
#[global_allocator]
static ALLOCATOR: KernelHeapAllocator = KernelHeapAllocator;

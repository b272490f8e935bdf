use super::address::PhysAddr;

/// Hands out 4 KiB physical frames.
///
/// Paging uses this to back new page tables and the heap uses it to back
/// the pages it grows by.
pub trait FrameAllocator {
    /// Returns a page-aligned frame, or `None` when physical memory is exhausted.
    fn allocate_frame(&mut self) -> Option<PhysAddr>;
}

/// Takes frames back.
pub trait FrameDeallocator {
    /// Returns `frame` to the pool. Freeing a frame twice is a caller bug.
    fn deallocate_frame(&mut self, frame: PhysAddr);
}

/// Exposed function to allocate a frame from the kernel's frame allocator
#[cfg(target_arch = "x86")]
pub fn alloc_frame() -> Option<PhysAddr> {
    super::with_kernel_memory(|memory| memory.frames_mut().allocate_frame())
}

/// Exposed function to return a frame to the kernel's frame allocator
#[cfg(target_arch = "x86")]
pub fn dealloc_frame(frame: PhysAddr) {
    super::with_kernel_memory(|memory| memory.frames_mut().deallocate_frame(frame))
}

//! Bitmap physical frame allocator
//!
//! Bit `i` of the bitmap (byte `i / 8`, bit `i % 8`) tracks frame `i`:
//! `1` is allocated, `0` is free. The bitmap itself lives at the fixed
//! physical address [`BITMAP_ADDR`], right above the kernel image.

use core::slice;

use log::{debug, error, info, warn};
use thiserror::Error;

use super::{
    address::PhysAddr,
    frame_allocator::{FrameAllocator, FrameDeallocator},
    MemoryWindow,
};
use crate::constants::memory::{
    BITMAP_ADDR, BITMAP_SIZE, MAX_MEMORY_SIZE, PAGE_SIZE, RESERVED_LOW_MEMORY_END,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("out of physical memory")]
    OutOfMemory,
}

/// Tracks every usable physical frame with one bit.
///
/// # Invariants
/// - `total_frames <= BITMAP_SIZE * 8`
/// - set bits + `free_frames == total_frames`
/// - frames below [`RESERVED_LOW_MEMORY_END`] are never handed out
pub struct BitmapFrameAllocator<W: MemoryWindow> {
    window: W,
    bitmap: PhysAddr,
    total_frames: usize,
    free_frames: usize,
}

impl<W: MemoryWindow> BitmapFrameAllocator<W> {
    /// Builds the allocator over `usable_memory` bytes of RAM starting at 0.
    ///
    /// Input above [`MAX_MEMORY_SIZE`] is clamped. The bitmap is cleared and
    /// the frames holding the kernel image and the bitmap are marked used up
    /// front, so they never show up as free.
    ///
    /// # Safety
    /// The [`BITMAP_SIZE`] bytes at [`BITMAP_ADDR`] must be reachable through
    /// `window` and must not be used by anything else.
    pub unsafe fn init(usable_memory: u32, window: W) -> Self {
        let memory = usable_memory.min(MAX_MEMORY_SIZE);
        let total_frames = (memory / PAGE_SIZE) as usize;

        let mut allocator = Self {
            window,
            bitmap: PhysAddr::new(BITMAP_ADDR),
            total_frames,
            free_frames: total_frames,
        };
        allocator.bitmap_mut().fill(0);

        allocator.reserve_range(PhysAddr::zero(), RESERVED_LOW_MEMORY_END);

        info!(
            "Physical memory initialized: {} frames total, {} free, first free frame {:?}, bitmap at {}",
            allocator.total_frames,
            allocator.free_frames,
            allocator.first_free_frame(),
            allocator.bitmap
        );

        allocator
    }

    /// Allocates the lowest-indexed free frame.
    pub fn allocate(&mut self) -> Result<PhysAddr, FrameError> {
        // Each pass claims one frame, so this ends after at most
        // `total_frames` passes.
        loop {
            let Some(frame_index) = self.find_first_free() else {
                error!("Out of physical memory");
                return Err(FrameError::OutOfMemory);
            };

            self.set_bit(frame_index);
            self.free_frames -= 1;

            let addr = PhysAddr::from_frame_index(frame_index);
            if addr.as_u32() < RESERVED_LOW_MEMORY_END {
                // Only reachable if someone freed a reserved frame. Keep it
                // claimed and look further up.
                warn!("Skipping reserved frame {} at {}", frame_index, addr);
                continue;
            }

            debug!("Allocated frame {} at {}", frame_index, addr);
            return Ok(addr);
        }
    }

    /// Returns the frame containing `addr` to the pool.
    ///
    /// Addresses outside the managed range and frames that are already free
    /// are ignored (and trip an assertion in debug builds).
    pub fn free(&mut self, addr: PhysAddr) {
        let frame_index = addr.frame_index();
        debug_assert!(
            frame_index < self.total_frames,
            "freeing {addr}, which is outside managed memory"
        );
        if frame_index >= self.total_frames {
            return;
        }

        debug_assert!(self.is_bit_set(frame_index), "double free of frame at {addr}");
        if self.is_bit_set(frame_index) {
            self.clear_bit(frame_index);
            self.free_frames += 1;
        }
    }

    /// Check if the frame containing `addr` is free. Addresses outside the
    /// managed range never are.
    pub fn is_free(&self, addr: PhysAddr) -> bool {
        let frame_index = addr.frame_index();
        frame_index < self.total_frames && !self.is_bit_set(frame_index)
    }

    pub fn free_count(&self) -> usize {
        self.free_frames
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn used_count(&self) -> usize {
        self.total_frames - self.free_frames
    }

    /// The frame the next [`allocate`](Self::allocate) will return.
    pub fn first_free_frame(&self) -> Option<PhysAddr> {
        self.find_first_free().map(PhysAddr::from_frame_index)
    }

    /// Marks every frame overlapping `[start, start + length)` as used.
    ///
    /// Frames past the managed range are skipped.
    pub fn reserve_range(&mut self, start: PhysAddr, length: u32) {
        let first = start.frame_index();
        let end = (start.as_u32() as u64 + length as u64).div_ceil(PAGE_SIZE as u64) as usize;

        for frame_index in first..end.min(self.total_frames) {
            if !self.is_bit_set(frame_index) {
                self.set_bit(frame_index);
                self.free_frames -= 1;
            }
        }
    }

    /// Allocates one frame and frees it again, checking the bitmap agrees
    /// at each step. Returns `false` if it did not.
    pub fn self_test(&mut self) -> bool {
        let frame = match self.allocate() {
            Ok(frame) => frame,
            Err(_) => return self.free_frames == 0,
        };

        let mut ok = true;
        if self.is_free(frame) {
            error!("Allocated frame {} is still marked as free", frame);
            ok = false;
        }
        self.free(frame);
        if !self.is_free(frame) {
            error!("Freed frame {} is not marked as free", frame);
            ok = false;
        }
        ok
    }

    /// Scans byte by byte for one that is not full, then takes its lowest
    /// clear bit.
    fn find_first_free(&self) -> Option<usize> {
        let bitmap = &self.bitmap()[..self.total_frames.div_ceil(8)];

        bitmap
            .iter()
            .enumerate()
            .find(|&(_, &byte)| byte != 0xFF)
            .map(|(byte_index, &byte)| byte_index * 8 + (!byte).trailing_zeros() as usize)
            .filter(|&frame_index| frame_index < self.total_frames)
    }

    fn bitmap(&self) -> &[u8] {
        let ptr = self.window.phys_to_ptr(self.bitmap);
        // SAFETY: `init`'s contract gives us exclusive use of these bytes.
        unsafe { slice::from_raw_parts(ptr, BITMAP_SIZE) }
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        let ptr = self.window.phys_to_ptr(self.bitmap);
        // SAFETY: `init`'s contract gives us exclusive use of these bytes.
        unsafe { slice::from_raw_parts_mut(ptr, BITMAP_SIZE) }
    }

    /// set a particular bit (1), taking in frame_index
    fn set_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);
        self.bitmap_mut()[frame_index / 8] |= 1 << (frame_index % 8);
    }

    /// clear a particular bit (0), taking in frame_index
    fn clear_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);
        self.bitmap_mut()[frame_index / 8] &= !(1 << (frame_index % 8));
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        assert!(frame_index < self.total_frames);
        self.bitmap()[frame_index / 8] & (1 << (frame_index % 8)) != 0
    }
}

impl<W: MemoryWindow> FrameAllocator for BitmapFrameAllocator<W> {
    fn allocate_frame(&mut self) -> Option<PhysAddr> {
        self.allocate().ok()
    }
}

impl<W: MemoryWindow> FrameDeallocator for BitmapFrameAllocator<W> {
    fn deallocate_frame(&mut self, frame: PhysAddr) {
        self.free(frame);
    }
}

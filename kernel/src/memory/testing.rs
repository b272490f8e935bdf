//! Simulated physical RAM, heap arena and MMU for host-side tests.
//!
//! Physical addresses are byte offsets into a zeroed buffer. Virtual
//! addresses inside `[HEAP_START, HEAP_START + arena)` resolve into a second
//! buffer so the heap can write its block headers. Anything else panics,
//! which catches stray accesses early.

use crate::constants::memory::{HEAP_START, PAGE_SIZE};
use crate::memory::{
    address::{PhysAddr, VirtAddr},
    mmu::Mmu,
    MemoryWindow,
};

/// Where tests place the static directory + tables (4 MiB + 4 KiB).
pub const TEST_STRUCTURES_ADDR: PhysAddr = PhysAddr::new(0x40_0000);

/// RAM large enough for the bitmap, the paging structures and a few
/// demand-allocated tables.
pub const TEST_RAM_SIZE: usize = 0x90_0000;

const FRAME_SIZE: usize = PAGE_SIZE as usize;

#[repr(C, align(4096))]
#[derive(Clone)]
struct Frame([u8; FRAME_SIZE]);

/// Owns the buffers behind a [`TestWindow`]. Must outlive every window.
pub struct TestMemory {
    ram: Vec<Frame>,
    arena: Vec<Frame>,
}

impl TestMemory {
    pub fn new(ram_bytes: usize, arena_bytes: usize) -> Self {
        Self {
            ram: vec![Frame([0; FRAME_SIZE]); ram_bytes.div_ceil(FRAME_SIZE)],
            arena: vec![Frame([0; FRAME_SIZE]); arena_bytes.div_ceil(FRAME_SIZE)],
        }
    }

    pub fn window(&mut self) -> TestWindow {
        TestWindow {
            ram: self.ram.as_mut_ptr().cast(),
            ram_len: self.ram.len() * FRAME_SIZE,
            arena: self.arena.as_mut_ptr().cast(),
            arena_len: self.arena.len() * FRAME_SIZE,
        }
    }
}

#[derive(Clone, Copy)]
pub struct TestWindow {
    ram: *mut u8,
    ram_len: usize,
    arena: *mut u8,
    arena_len: usize,
}

impl MemoryWindow for TestWindow {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        let offset = pa.as_u32() as usize;
        assert!(offset < self.ram_len, "{pa} is outside simulated RAM");
        // SAFETY: bounds checked above.
        unsafe { self.ram.add(offset) }
    }

    fn virt_to_ptr(&self, va: VirtAddr) -> *mut u8 {
        let offset = va
            .as_u32()
            .checked_sub(HEAP_START)
            .map(|offset| offset as usize)
            .filter(|&offset| offset < self.arena_len)
            .unwrap_or_else(|| panic!("{va} is outside the simulated heap arena"));
        // SAFETY: bounds checked above.
        unsafe { self.arena.add(offset) }
    }
}

/// Records what the paging code asked the CPU to do.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    pub loaded_directory: Option<PhysAddr>,
    pub translation_enabled: bool,
    pub flushed: Vec<VirtAddr>,
}

impl Mmu for RecordingMmu {
    unsafe fn load_directory(&mut self, directory: PhysAddr) {
        self.loaded_directory = Some(directory);
    }

    unsafe fn enable_translation(&mut self) {
        assert!(
            self.loaded_directory.is_some(),
            "translation enabled without a directory"
        );
        self.translation_enabled = true;
    }

    fn flush_page(&mut self, addr: VirtAddr) {
        self.flushed.push(addr);
    }
}

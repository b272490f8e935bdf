//! Fixed physical and virtual memory layout.
//!
//! These values are shared with the boot code and the linker script, so they
//! must stay bit-for-bit identical.

/// Size of a virtual page and of a physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// Physical address of the frame bitmap, right above the kernel image.
pub const BITMAP_ADDR: u32 = 0x20_0000;
/// Bitmap capacity in bytes. One bit per frame, so 262144 frames (1 GiB).
pub const BITMAP_SIZE: usize = 32768;

/// Frames below this address hold the kernel image and the bitmap and are
/// never handed out.
pub const RESERVED_LOW_MEMORY_END: u32 = 0x20_8000;

/// Usable memory reported above this is ignored.
pub const MAX_MEMORY_SIZE: u32 = 256 * 1024 * 1024;

pub const HEAP_START: u32 = 0xA000_0000;
pub const HEAP_INIT_SIZE: u32 = 0x10_0000; // 1 MiB

/// Bytes taken by a heap block header (`size` and `next`, both 32 bit).
pub const HEAP_BLOCK_HEADER_SIZE: u32 = 8;

/// Higher-half load address of the kernel.
pub const KERNEL_VIRTUAL_BASE: u32 = 0xC000_0000;

pub const DIRECTORY_ENTRIES: usize = 1024;
pub const TABLE_ENTRIES: usize = 1024;

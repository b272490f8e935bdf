//! Boot sequence: logging first, then physical memory, paging and the heap.

/// The leading fields of the multiboot information block the boot loader
/// passes to the kernel entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MultibootInfo {
    pub flags: u32,
    /// KiB of memory below 1 MiB.
    pub mem_lower: u32,
    /// KiB of memory above 1 MiB.
    pub mem_upper: u32,
}

impl MultibootInfo {
    /// `mem_lower` and `mem_upper` are valid.
    pub const MEMORY_INFO: u32 = 1 << 0;

    /// Bytes of usable memory to hand the physical allocator, if the boot
    /// loader reported any.
    pub fn usable_memory(&self) -> Option<u32> {
        (self.flags & Self::MEMORY_INFO != 0).then(|| self.mem_upper.saturating_mul(1024))
    }
}

/// Brings the kernel up far enough for `alloc` to work.
///
/// Panics if the boot loader did not report a memory size or if memory
/// management cannot be initialized.
#[cfg(target_arch = "x86")]
pub fn init(info: &MultibootInfo) {
    crate::serial::print_str("Booting kernel...\n");
    crate::logging::init();

    let usable_memory = info
        .usable_memory()
        .expect("Boot loader did not report the memory size");
    log::info!("Usable memory: {} KiB", usable_memory / 1024);

    crate::memory::init(usable_memory);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_memory_is_upper_memory_in_bytes() {
        let info = MultibootInfo {
            flags: MultibootInfo::MEMORY_INFO,
            mem_lower: 639,
            mem_upper: 261_120,
        };
        assert_eq!(info.usable_memory(), Some(261_120 * 1024));
    }

    #[test]
    fn missing_memory_info_is_none() {
        let info = MultibootInfo {
            flags: 0,
            mem_lower: 639,
            mem_upper: 261_120,
        };
        assert_eq!(info.usable_memory(), None);
    }

    #[test]
    fn huge_reports_saturate() {
        let info = MultibootInfo {
            flags: MultibootInfo::MEMORY_INFO,
            mem_lower: 0,
            mem_upper: u32::MAX,
        };
        assert_eq!(info.usable_memory(), Some(u32::MAX));
    }
}

#[cfg(target_arch = "x86")]
use super::address::VirtAddr;

/// Invalidates the TLB entry for `target_vaddr` on the current processor.
///
/// There is a single CPU, so no shootdown to other cores is needed.
#[cfg(target_arch = "x86")]
pub fn flush(target_vaddr: VirtAddr) {
    let vaddr = target_vaddr.as_u32();

    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
    }
}

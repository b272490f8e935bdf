//! Control-register access for address translation.

use super::address::{PhysAddr, VirtAddr};

/// Paging bit in CR0.
pub const CR0_PAGING: u32 = 1 << 31;

/// The CPU side of address translation.
///
/// The paging manager is the only caller; it owns its `Mmu` so nothing else
/// writes translation state.
pub trait Mmu {
    /// Loads the translation-root register (CR3) with `directory`.
    ///
    /// # Safety
    /// `directory` must be the physical base of a fully built page directory.
    unsafe fn load_directory(&mut self, directory: PhysAddr);

    /// Sets the paging bit. Every later memory access is translated.
    ///
    /// # Safety
    /// The loaded directory must map the currently executing code and stack
    /// at their present addresses.
    unsafe fn enable_translation(&mut self);

    /// Drops any cached translation for the page holding `addr` on this CPU.
    fn flush_page(&mut self, addr: VirtAddr);
}

/// The 32-bit x86 MMU of the boot processor.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Mmu;

#[cfg(target_arch = "x86")]
impl Mmu for X86Mmu {
    unsafe fn load_directory(&mut self, directory: PhysAddr) {
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) directory.as_u32(),
                options(nostack, preserves_flags)
            );
        }
    }

    unsafe fn enable_translation(&mut self) {
        let mut cr0: u32;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
            cr0 |= CR0_PAGING;
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        }
    }

    fn flush_page(&mut self, addr: VirtAddr) {
        super::tlb::flush(addr);
    }
}

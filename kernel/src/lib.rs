#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod devices;
pub mod init;
pub mod logging;
pub mod memory;

pub use devices::serial;

/// Parks the CPU for good.
pub fn idle_loop() -> ! {
    loop {
        #[cfg(target_arch = "x86")]
        // SAFETY: `hlt` only waits for the next interrupt.
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86"))]
        core::hint::spin_loop();
    }
}

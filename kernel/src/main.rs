#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

#[cfg(all(target_arch = "x86", not(test)))]
extern crate alloc;

#[cfg(not(test))]
use kernel_mm::{idle_loop, serial_println};

/// Entered from the multiboot stub with paging still off.
#[cfg(all(target_arch = "x86", not(test)))]
#[no_mangle]
extern "C" fn kernel_main(info: &kernel_mm::init::MultibootInfo) -> ! {
    use alloc::{boxed::Box, vec::Vec};
    use kernel_mm::memory::{
        self,
        address::{PhysAddr, VirtAddr},
        paging::{PageTableFlags, IDENTITY_FLAGS},
    };

    kernel_mm::init::init(info);

    // map and unmap one page, then put the identity mapping back
    let virt = VirtAddr::new(0xE000_0000);
    let phys = PhysAddr::new(0x10_0000);
    memory::with_kernel_memory(|memory| {
        memory
            .map_page(virt, phys, PageTableFlags::PRESENT | PageTableFlags::WRITABLE)
            .expect("Mapping test page failed");
        serial_println!("Mapped {:?} -> {:?}", virt, memory.paging().translate(virt));

        memory.unmap_page(virt);
        match memory.paging().translate(virt) {
            Some(phys_addr) => serial_println!("Mapping still exists at {:?}", phys_addr),
            None => serial_println!("Unmapped {:?}, as expected", virt),
        }

        memory
            .map_page(virt, PhysAddr::new(virt.as_u32()), IDENTITY_FLAGS)
            .expect("Restoring identity mapping failed");
    });

    // testing that the heap allocation works
    let x: Box<u32> = Box::new(10);
    let y: Box<[u8; 64]> = Box::new([0; 64]);
    serial_println!("Heap object allocated at: {:p}", Box::as_ref(&x) as *const u32);
    serial_println!("Heap object allocated at: {:p}", y.as_ptr());

    let frame = memory::frame_allocator::alloc_frame().expect("no free frame after boot");
    serial_println!("Allocated frame {}", frame);
    memory::frame_allocator::dealloc_frame(frame);

    let page = memory::kmalloc_page_aligned(4096);
    serial_println!("Page-aligned block at: {:p}", page);
    unsafe { memory::kfree(page) };

    // Half the initial arena twice forces the heap to grow.
    let halves: Vec<Vec<u8>> = (0..2).map(|_| Vec::with_capacity(512 * 1024)).collect();
    memory::with_kernel_memory(|memory| {
        serial_println!(
            "Heap spans {:?}..{:?} after {} large allocations, {} frames free",
            memory.heap().heap_start(),
            memory.heap().heap_end(),
            halves.len(),
            memory.frames().free_count()
        );
        serial_println!(
            "{:?} -> {:?}",
            VirtAddr::new(0xC000_0000),
            memory.paging().translate(VirtAddr::new(0xC000_0000))
        );
    });

    drop(halves);
    serial_println!("Kernel entering idle loop");
    idle_loop();
}

#[cfg(not(test))]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("Kernel panic: {}", info);
    idle_loop();
}

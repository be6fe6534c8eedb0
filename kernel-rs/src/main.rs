//! A teaching operating system kernel for 32-bit x86 multiprocessors:
//! preemptive multitasking over two-level page tables, a crash-recoverable
//! file system behind a write-ahead log, and the small set of system calls
//! a shell needs.
#![no_std]
#![no_main]

mod bio;
mod console;
mod cpu;
mod elf;
mod exec;
mod fcntl;
mod file;
mod fs;
mod ide;
mod ioapic;
mod kalloc;
mod kbd;
mod kernel;
mod lapic;
mod lock;
mod memlayout;
mod mmu;
mod mp;
mod page;
mod param;
mod picirq;
mod pipe;
mod printf;
mod proc;
mod start;
mod stat;
mod syscall;
mod trap;
mod uart;
mod vm;
mod x86;

use core::ptr;

use kernel::kernel;
use memlayout::{p2v, v2p, PHYSTOP};
use param::KSTACKSIZE;

extern "C" {
    /// First address after the kernel image. Defined by kernel.ld.
    static end: u8;

    /// The AP bootstrap blob: its link address (0x7000), its end, and
    /// where the loader actually put it. Defined by kernel.ld.
    static __entryother_start: u8;
    static __entryother_end: u8;
    static __entryother_load: u8;
}

/// Bootstrap processor starts running Rust code here (from entry, with
/// paging on). Allocate a real stack and set everything up.
#[no_mangle]
pub extern "C" fn main() -> ! {
    let kernel = kernel();

    // SAFETY: boot CPU, single-threaded, addresses from the linker script.
    unsafe {
        // Phase 1: only the pages mapped by entrypgdir.
        let first = &end as *const u8 as usize;
        kernel.kmem.init1(first, p2v(4 * 1024 * 1024));
    }
    vm::kvmalloc(); // kernel page table
    mp::init(); // detect other processors
    lapic::init(); // interrupt controller
    vm::seginit(); // segment descriptors
    picirq::init(); // disable legacy PIC
    ioapic::init(); // another interrupt controller
    console::init(); // console hardware
    uart::init(); // serial port
    trap::tvinit(); // trap vectors
    bio::binit(); // buffer cache
    kernel.ide.init(); // disk
    startothers(); // start other processors
    // SAFETY: the full kernel page table maps all of it on every CPU now.
    unsafe { kernel.kmem.init2(p2v(4 * 1024 * 1024), p2v(PHYSTOP)) };
    kernel.procs.user_proc_init(); // first user process
    mpmain() // finish this processor's setup
}

/// Other CPUs jump here from the bootstrap blob.
extern "C" fn mpenter() -> ! {
    vm::switchkvm();
    vm::seginit();
    lapic::init();
    mpmain()
}

/// Common CPU setup code.
fn mpmain() -> ! {
    crate::println!("cpu{}: starting", cpu::cpuid());
    trap::idtinit(); // load idt register
    cpu::mycpu().set_started(); // tell startothers() we're up
    kernel().procs.scheduler()
}

/// Starts the non-boot (AP) processors: copy the real-mode bootstrap to
/// 0x7000 and poke each AP with the universal startup algorithm.
fn startothers() {
    // SAFETY: boot CPU, single-threaded; the target page is below the
    // kernel and otherwise unused.
    unsafe {
        // Write the bootstrap code to unused memory at 0x7000. The linker
        // placed the image of the blob inside the kernel load segment;
        // __entryother_load is where.
        let code = p2v(0x7000) as *mut u8;
        let load = &__entryother_load as *const u8 as usize;
        let size =
            &__entryother_end as *const u8 as usize - &__entryother_start as *const u8 as usize;
        ptr::copy_nonoverlapping(p2v(load) as *const u8, code, size);

        for c in kernel().cpus.iter() {
            if ptr::eq(c, cpu::mycpu()) {
                // We've started already.
                continue;
            }

            // Tell the bootstrap code which stack to use, where to enter,
            // and which page directory. It runs with paging off, so it
            // needs physical addresses.
            let stack = kernel().kmem.alloc().expect("startothers").into_usize();
            (code.sub(4) as *mut u32).write((stack + KSTACKSIZE) as u32);
            (code.sub(8) as *mut u32).write(mpenter as usize as u32);
            (code.sub(12) as *mut u32).write(v2p(&start::entrypgdir as *const _ as usize) as u32);

            lapic::startap(c.apicid(), v2p(code as usize));

            // Wait for the CPU to finish mpmain().
            while !c.started() {
                core::hint::spin_loop();
            }
        }
    }
}

//! The kernel singleton: every piece of global state, constructed
//! statically and initialized explicitly by boot code before first use.

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::bio::{new_bcache, Bcache};
use crate::console::Console;
use crate::cpu::Cpus;
use crate::file::{new_ftable, Devsw, FileTable};
use crate::fs::FileSystem;
use crate::ide::Ide;
use crate::kalloc::Kmem;
use crate::lock::{new_spinlock, SleepableLock, SpinLock};
use crate::param::NDEV;
use crate::printf::Printer;
use crate::proc::Procs;
use crate::x86::freeze;

pub struct Kernel {
    panicked: AtomicBool,

    /// The physical page frame allocator.
    pub kmem: Kmem,

    /// Per-CPU state, filled in by the MP table scan.
    pub cpus: Cpus,

    /// The process table and scheduler.
    pub procs: Procs,

    /// Clock tick counter; sleepers on its channel wake every tick.
    pub ticks: SleepableLock<u32>,

    printer: SpinLock<Printer>,

    /// Console state (the line-edited input buffer).
    pub console: SleepableLock<Console>,

    /// Device switch table, indexed by major device number. Written during
    /// device init, read-only afterwards.
    devsw: UnsafeCell<[Devsw; NDEV]>,

    /// The system-wide open file table.
    pub ftable: FileTable,

    /// Superblock, log, and inode cache.
    pub file_system: FileSystem,

    /// The buffer cache.
    pub bcache: Bcache,

    /// The disk driver.
    pub ide: Ide,
}

// SAFETY: `devsw` is written only during single-threaded boot.
unsafe impl Sync for Kernel {}

static KERNEL: Kernel = Kernel::zero();

/// The kernel.
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

impl Kernel {
    const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            kmem: Kmem::new(),
            cpus: Cpus::new(),
            procs: Procs::new(),
            ticks: SleepableLock::new("time", 0),
            printer: new_spinlock("pr", Printer::new()),
            console: SleepableLock::new("console", Console::new()),
            devsw: UnsafeCell::new(array![_ => Devsw::zero(); NDEV]),
            ftable: new_ftable(),
            file_system: FileSystem::zero(),
            bcache: new_bcache(),
            ide: Ide::new(),
        }
    }

    pub fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// The device entry for `major`, if the number is in range.
    pub fn devsw(&self, major: i16) -> Option<&Devsw> {
        if !(0..NDEV as i16).contains(&major) {
            return None;
        }
        // SAFETY: read-only after boot.
        Some(unsafe { &(*self.devsw.get())[major as usize] })
    }

    /// Installs a device's entry points. Boot-time only.
    pub fn set_devsw(&self, major: i16, dev: Devsw) {
        // SAFETY: single-threaded boot.
        unsafe { (*self.devsw.get())[major as usize] = dev };
    }

    /// Prints the given formatted string on the console. After a panic the
    /// lock is bypassed, so the dying CPU can always report.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // SAFETY: after a panic, every other CPU stops printing.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            self.printer.lock().write_fmt(args)
        }
    }
}

/// Handles kernel panic: report once, then freeze this CPU; the panicked
/// flag stops the console on every other CPU.
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    // Avoid re-entering the panic path if printing itself panics.
    if !kernel().is_panicked() {
        kernel().panic();
        crate::println!("{}", info);
    }
    freeze()
}

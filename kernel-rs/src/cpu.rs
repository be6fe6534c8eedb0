//! Per-CPU state.

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::kernel::kernel;
use crate::lapic;
use crate::mmu::{SegDesc, TaskState, NSEGS};
use crate::param::NCPU;
use crate::proc::{Context, Proc};
use crate::x86::{cli, intr_get, sti};

/// Per-CPU state.
///
/// # Safety
///
/// Except for `apicid` (written once while only the boot CPU runs) and
/// `started` (atomic), the fields are only accessed by the owning CPU, with
/// interrupts disabled.
pub struct Cpu {
    /// Local APIC ID.
    apicid: Cell<u8>,

    /// swtch() here to enter the scheduler.
    pub scheduler: Cell<*mut Context>,

    /// Used by x86 to find stack for interrupt.
    pub ts: UnsafeCell<TaskState>,

    /// x86 global descriptor table.
    pub gdt: UnsafeCell<[SegDesc; NSEGS]>,

    /// Has the CPU started?
    started: AtomicBool,

    /// Depth of push_off() nesting.
    ncli: Cell<i32>,

    /// Were interrupts enabled before the outermost push_off()?
    intena: Cell<bool>,

    /// The process running on this CPU, or null.
    proc: Cell<*const Proc>,
}

// SAFETY: see the struct invariant.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new() -> Self {
        Self {
            apicid: Cell::new(0),
            scheduler: Cell::new(core::ptr::null_mut()),
            ts: UnsafeCell::new(TaskState::zero()),
            gdt: UnsafeCell::new([SegDesc::zero(); NSEGS]),
            started: AtomicBool::new(false),
            ncli: Cell::new(0),
            intena: Cell::new(false),
            proc: Cell::new(core::ptr::null()),
        }
    }

    pub fn apicid(&self) -> u8 {
        self.apicid.get()
    }

    pub fn set_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The process currently running on this CPU, if any. Must be called
    /// with interrupts disabled (it is per-CPU state).
    pub fn current_proc(&self) -> *const Proc {
        self.proc.get()
    }

    pub fn set_proc(&self, p: *const Proc) {
        self.proc.set(p);
    }

    pub fn ncli(&self) -> i32 {
        self.ncli.get()
    }

    pub fn intena(&self) -> bool {
        self.intena.get()
    }

    pub fn set_intena(&self, v: bool) {
        self.intena.set(v);
    }
}

/// The CPU table, filled in by the MP table scan.
pub struct Cpus {
    list: [Cpu; NCPU],
    ncpu: Cell<usize>,
}

// SAFETY: `ncpu` is written only during single-threaded boot.
unsafe impl Sync for Cpus {}

impl Cpus {
    pub const fn new() -> Self {
        Self {
            list: array![_ => Cpu::new(); NCPU],
            ncpu: Cell::new(0),
        }
    }

    /// Registers a CPU found in the MP configuration table. Boot-time only.
    pub fn add(&self, apicid: u8) {
        let n = self.ncpu.get();
        if n < NCPU {
            self.list[n].apicid.set(apicid);
            self.ncpu.set(n + 1);
        }
    }

    pub fn count(&self) -> usize {
        self.ncpu.get()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Cpu> {
        self.list[..self.ncpu.get()].iter()
    }
}

/// Must be called with interrupts disabled to avoid the caller being moved
/// to a different CPU between reading the APIC ID and looking it up.
pub fn mycpu() -> &'static Cpu {
    assert!(!intr_get(), "mycpu called with interrupts enabled");

    let apicid = lapic::id();
    let cpus = &kernel().cpus;
    // APIC IDs are not guaranteed to be contiguous.
    for c in cpus.iter() {
        if c.apicid() == apicid {
            return c;
        }
    }
    panic!("unknown apicid");
}

pub fn current_raw() -> *mut Cpu {
    mycpu() as *const Cpu as *mut Cpu
}

/// The index of this CPU in the table. Must be called with interrupts
/// disabled.
pub fn cpuid() -> usize {
    let c = mycpu() as *const Cpu;
    let base = kernel().cpus.list.as_ptr();
    (c as usize - base as usize) / core::mem::size_of::<Cpu>()
}

/// push_off/pop_off are like cli()/sti() except that they are matched: it
/// takes two pop_off()s to undo two push_off()s. Also, if interrupts are
/// initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let old = intr_get();
    // SAFETY: disabling interrupts is always safe.
    unsafe { cli() };
    let c = mycpu();
    if c.ncli.get() == 0 {
        c.intena.set(old);
    }
    c.ncli.set(c.ncli.get() + 1);
}

pub fn pop_off() {
    assert!(!intr_get(), "pop_off - interruptible");
    let c = mycpu();
    let n = c.ncli.get() - 1;
    assert!(n >= 0, "pop_off");
    c.ncli.set(n);
    if n == 0 && c.intena.get() {
        // SAFETY: restoring the outermost enable state.
        unsafe { sti() };
    }
}

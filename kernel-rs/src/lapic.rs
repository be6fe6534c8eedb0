//! The local APIC: per-CPU interrupt management, the timer, and AP
//! startup.

// The full canonical register set is kept even where unused.
#![allow(dead_code)]

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::memlayout::p2v;
use crate::trap::{IRQ_ERROR, IRQ_SPURIOUS, IRQ_TIMER, T_IRQ0};
use crate::x86::outb;

// Local APIC registers, divided by 4 for use as u32[] indices.
const ID: usize = 0x0020 / 4; // ID
const VER: usize = 0x0030 / 4; // Version
const TPR: usize = 0x0080 / 4; // Task Priority
const EOI: usize = 0x00B0 / 4; // EOI
const SVR: usize = 0x00F0 / 4; // Spurious Interrupt Vector
const ENABLE: u32 = 0x00000100; // Unit Enable
const ESR: usize = 0x0280 / 4; // Error Status
const ICRLO: usize = 0x0300 / 4; // Interrupt Command
const INIT: u32 = 0x00000500; // INIT/RESET
const STARTUP: u32 = 0x00000600; // Startup IPI
const DELIVS: u32 = 0x00001000; // Delivery status
const ASSERT: u32 = 0x00004000; // Assert interrupt (vs deassert)
const DEASSERT: u32 = 0x00000000;
const LEVEL: u32 = 0x00008000; // Level triggered
const BCAST: u32 = 0x00080000; // Send to all APICs, including self.
const BUSY: u32 = 0x00001000;
const FIXED: u32 = 0x00000000;
const ICRHI: usize = 0x0310 / 4; // Interrupt Command [63:32]
const TIMER: usize = 0x0320 / 4; // Local Vector Table 0 (TIMER)
const X1: u32 = 0x0000000B; // divide counts by 1
const PERIODIC: u32 = 0x00020000; // Periodic
const PCINT: usize = 0x0340 / 4; // Performance Counter LVT
const LINT0: usize = 0x0350 / 4; // Local Vector Table 1 (LINT0)
const LINT1: usize = 0x0360 / 4; // Local Vector Table 2 (LINT1)
const ERROR: usize = 0x0370 / 4; // Local Vector Table 3 (ERROR)
const MASKED: u32 = 0x00010000; // Interrupt masked
const TICR: usize = 0x0380 / 4; // Timer Initial Count
const TDCR: usize = 0x03E0 / 4; // Timer Divide Configuration

/// Kernel virtual address of the local APIC window; set by the MP table
/// scan, before any other CPU runs.
static LAPIC: AtomicUsize = AtomicUsize::new(0);

pub fn set_base(pa: usize) {
    LAPIC.store(p2v(pa), Ordering::Release);
}

fn base() -> *mut u32 {
    LAPIC.load(Ordering::Acquire) as *mut u32
}

fn write(index: usize, value: u32) {
    let lapic = base();
    // SAFETY: the MP scan mapped the window before any write; the register
    // file is per-CPU.
    unsafe {
        lapic.add(index).write_volatile(value);
        // Wait for write to finish, by reading.
        lapic.add(ID).read_volatile();
    }
}

fn read(index: usize) -> u32 {
    // SAFETY: see `write`.
    unsafe { base().add(index).read_volatile() }
}

/// The local APIC ID of the executing CPU. Callers must have interrupts
/// disabled (or be in early boot).
pub fn id() -> u8 {
    if base().is_null() {
        return 0;
    }
    (read(ID) >> 24) as u8
}

/// Acknowledges an interrupt.
pub fn eoi() {
    if !base().is_null() {
        write(EOI, 0);
    }
}

/// Sets up this CPU's local APIC: enables it, programs the periodic timer,
/// and masks what we do not use.
pub fn init() {
    assert!(!base().is_null(), "lapic init: no MP table");

    // Enable local APIC; set spurious interrupt vector.
    write(SVR, ENABLE | (T_IRQ0 + IRQ_SPURIOUS));

    // The timer repeatedly counts down at bus frequency from TICR and then
    // issues an interrupt.
    write(TDCR, X1);
    write(TIMER, PERIODIC | (T_IRQ0 + IRQ_TIMER));
    write(TICR, 10_000_000);

    // Disable logical interrupt lines.
    write(LINT0, MASKED);
    write(LINT1, MASKED);

    // Disable performance counter overflow interrupts on machines that
    // provide that interrupt entry.
    if (read(VER) >> 16) & 0xFF >= 4 {
        write(PCINT, MASKED);
    }

    // Map error interrupt to IRQ_ERROR.
    write(ERROR, T_IRQ0 + IRQ_ERROR);

    // Clear error status register (requires back-to-back writes).
    write(ESR, 0);
    write(ESR, 0);

    // Ack any outstanding interrupts.
    write(EOI, 0);

    // Send an Init Level De-Assert to synchronise arbitration IDs.
    write(ICRHI, 0);
    write(ICRLO, BCAST | INIT | LEVEL);
    while read(ICRLO) & DELIVS != 0 {}

    // Enable interrupts on the APIC (but not on the processor).
    write(TPR, 0);
}

/// Spins for a given number of microseconds. On real hardware this would
/// be calibrated; on emulators we do not need to wait.
pub fn microdelay(_us: u32) {}

const CMOS_PORT: u16 = 0x70;
const CMOS_RETURN: u16 = 0x71;

/// Starts the additional processor `apicid` running the bootstrap code at
/// physical address `addr`, with the universal startup algorithm: a warm
/// reset vector plus INIT followed by two STARTUP IPIs.
pub fn startap(apicid: u8, addr: usize) {
    // The BSP must initialize CMOS shutdown code to 0x0A and the warm reset
    // vector (DWORD based at 40:67) to point at the AP startup code before
    // the [universal startup algorithm].
    // SAFETY: CMOS port I/O and the BDA warm-reset vector, during boot.
    unsafe {
        outb(CMOS_PORT, 0xF); // offset 0xF is shutdown code
        outb(CMOS_RETURN, 0x0A);
        let wrv = p2v(0x40 << 4 | 0x67) as *mut u16; // warm reset vector
        wrv.write_volatile(0);
        wrv.add(1).write_volatile((addr >> 4) as u16);
    }

    // "Universal startup algorithm."
    // Send INIT (level-triggered) interrupt to reset other CPU.
    write(ICRHI, (apicid as u32) << 24);
    write(ICRLO, INIT | LEVEL | ASSERT);
    microdelay(200);
    write(ICRLO, INIT | LEVEL);
    microdelay(100); // should be 10ms, but too slow in Bochs!

    // Send startup IPI (twice!) to enter code. Regular hardware is supposed
    // to only accept a STARTUP when it is in the halted state due to an
    // INIT. So the second should be ignored, but it is part of the official
    // Intel algorithm.
    for _ in 0..2 {
        write(ICRHI, (apicid as u32) << 24);
        write(ICRLO, STARTUP | ((addr >> 12) as u32));
        microdelay(200);
    }
}

//! The I/O APIC: routes device interrupts to local APICs.

// The full canonical flag set is kept even where unused.
#![allow(dead_code)]

use core::sync::atomic::{AtomicU8, Ordering};

use crate::memlayout::p2v;
use crate::println;
use crate::trap::T_IRQ0;

/// Default physical address of the I/O APIC's register window.
const IOAPIC: usize = 0xFEC00000;

const REG_ID: u32 = 0x00; // Register index: ID
const REG_VER: u32 = 0x01; // Register index: version
const REG_TABLE: u32 = 0x10; // Redirection table base

// The redirection table starts at REG_TABLE and uses two registers to
// configure each interrupt. The first (low) register contains the
// interrupt's vector and configuration bits; the second (high) register
// contains which CPUs can serve the interrupt.
const INT_DISABLED: u32 = 0x00010000; // Interrupt disabled
const INT_LEVEL: u32 = 0x00008000; // Level-triggered (vs edge-)
const INT_ACTIVELOW: u32 = 0x00002000; // Active low (vs high)
const INT_LOGICAL: u32 = 0x00000800; // Destination is CPU id (vs APIC ID)

/// The I/O APIC id from the MP configuration table.
static ID: AtomicU8 = AtomicU8::new(0);

pub fn set_id(id: u8) {
    ID.store(id, Ordering::Release);
}

// IO APIC MMIO structure: write reg, then read or write data.
fn read(reg: u32) -> u32 {
    let base = p2v(IOAPIC) as *mut u32;
    // SAFETY: the device window is mapped by every kernel page table.
    unsafe {
        base.write_volatile(reg);
        base.add(4).read_volatile() // IOWIN at offset 0x10
    }
}

fn write(reg: u32, data: u32) {
    let base = p2v(IOAPIC) as *mut u32;
    // SAFETY: see `read`.
    unsafe {
        base.write_volatile(reg);
        base.add(4).write_volatile(data);
    }
}

/// Marks all interrupts edge-triggered, active high, disabled, and not
/// routed to any CPU.
pub fn init() {
    let maxintr = (read(REG_VER) >> 16) & 0xFF;
    let id = (read(REG_ID) >> 24) as u8;
    if id != ID.load(Ordering::Acquire) {
        println!("ioapicinit: id isn't equal to ioapicid; not a MP");
    }

    for i in 0..=maxintr {
        write(REG_TABLE + 2 * i, INT_DISABLED | (T_IRQ0 + i));
        write(REG_TABLE + 2 * i + 1, 0);
    }
}

/// Routes `irq` to the CPU with the given APIC id, edge-triggered, active
/// high.
pub fn enable(irq: u32, cpunum: u32) {
    write(REG_TABLE + 2 * irq, T_IRQ0 + irq);
    write(REG_TABLE + 2 * irq + 1, cpunum << 24);
}

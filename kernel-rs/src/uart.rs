//! Intel 8250 serial port (UART) driver.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::console;
use crate::ioapic;
use crate::lapic::microdelay;
use crate::trap::IRQ_COM1;
use crate::x86::{inb, outb};

const COM1: u16 = 0x3F8;

/// Is there a serial port at all?
static PRESENT: AtomicBool = AtomicBool::new(false);

pub fn init() {
    // SAFETY: UART port I/O during single-threaded boot.
    unsafe {
        // Turn off the FIFO.
        outb(COM1 + 2, 0);

        // 9600 baud, 8 data bits, 1 stop bit, parity off.
        outb(COM1 + 3, 0x80); // Unlock divisor
        outb(COM1, (115200u32 / 9600) as u8);
        outb(COM1 + 1, 0);
        outb(COM1 + 3, 0x03); // Lock divisor, 8 data bits.
        outb(COM1 + 4, 0);
        outb(COM1 + 1, 0x01); // Enable receive interrupts.

        // If status is 0xFF, no serial port.
        if inb(COM1 + 5) == 0xFF {
            return;
        }
        PRESENT.store(true, Ordering::Release);

        // Acknowledge pre-existing interrupt conditions; enable interrupts.
        inb(COM1 + 2);
        inb(COM1);
    }
    ioapic::enable(IRQ_COM1, 0);
}

pub fn putc(c: i32) {
    if !PRESENT.load(Ordering::Acquire) {
        return;
    }
    // SAFETY: UART port I/O; concurrent writers are serialized by the
    // console/printer locks.
    unsafe {
        for _ in 0..128 {
            if inb(COM1 + 5) & 0x20 != 0 {
                break;
            }
            microdelay(10);
        }
        outb(COM1, c as u8);
    }
}

/// One pending input byte, or -1.
pub fn getc() -> i32 {
    if !PRESENT.load(Ordering::Acquire) {
        return -1;
    }
    // SAFETY: UART port I/O.
    unsafe {
        if inb(COM1 + 5) & 0x01 == 0 {
            return -1;
        }
        inb(COM1) as i32
    }
}

pub fn intr() {
    console::intr(getc);
}

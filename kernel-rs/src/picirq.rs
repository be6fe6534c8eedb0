//! The legacy 8259A interrupt controllers, which we disable in favor of
//! the APICs.

use crate::x86::outb;

const IO_PIC1: u16 = 0x20; // Master (IRQs 0-7)
const IO_PIC2: u16 = 0xA0; // Slave (IRQs 8-15)

/// Masks every interrupt on both 8259As.
pub fn init() {
    // SAFETY: PIC port I/O during single-threaded boot.
    unsafe {
        outb(IO_PIC1 + 1, 0xFF);
        outb(IO_PIC2 + 1, 0xFF);
    }
}

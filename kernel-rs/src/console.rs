//! Console input and output.
//!
//! Output goes to both the text-mode screen and the serial port. Input
//! arrives through the keyboard and UART interrupt handlers, gets line
//! editing (backspace, line kill), and wakes readers on newline or
//! end-of-file.

use crate::file::{Devsw, CONSOLE};
use crate::kernel::kernel;
use crate::memlayout::p2v;
use crate::proc::myproc;
use crate::trap::IRQ_KBD;
use crate::x86::{freeze, inb, outb};
use crate::{ioapic, uart};

/// Size of console input buffer.
const INPUT_BUF: usize = 128;

/// The pseudo-character the input layer sends for backspace.
const BACKSPACE: i32 = 0x100;

/// Control-x.
const fn ctrl(x: u8) -> i32 {
    (x - b'@') as i32
}

/// The line-edited console input buffer, protected by the console lock.
pub struct Console {
    buf: [u8; INPUT_BUF],

    /// Read index.
    r: u32,

    /// Write index.
    w: u32,

    /// Edit index.
    e: u32,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

// The CGA text-mode screen.

const CRTPORT: u16 = 0x3D4;
const CGA_BASE: usize = 0xB8000;
const CGA_CELLS: usize = 80 * 25;

fn crt() -> *mut u16 {
    p2v(CGA_BASE) as *mut u16
}

/// Puts one character on the text-mode screen, handling newline, backspace,
/// scrolling, and the hardware cursor.
fn cgaputc(c: i32) {
    // SAFETY: CRT ports and the CGA window are mapped by the kernel page
    // table; the caller serializes through the console/printer locks.
    unsafe {
        // Cursor position: col + 80*row.
        outb(CRTPORT, 14);
        let mut pos = (inb(CRTPORT + 1) as usize) << 8;
        outb(CRTPORT, 15);
        pos |= inb(CRTPORT + 1) as usize;

        match c {
            0x0A => pos += 80 - pos % 80, // '\n'
            BACKSPACE => {
                if pos > 0 {
                    pos -= 1;
                }
            }
            _ => {
                crt().add(pos).write_volatile((c as u8 as u16) | 0x0700); // black on white
                pos += 1;
            }
        }

        assert!(pos <= CGA_CELLS, "pos under/overflow");

        if pos / 80 >= 24 {
            // Scroll up.
            core::ptr::copy(crt().add(80), crt(), 23 * 80);
            pos -= 80;
            for i in pos..24 * 80 {
                crt().add(i).write_volatile(0);
            }
        }

        outb(CRTPORT, 14);
        outb(CRTPORT + 1, (pos >> 8) as u8);
        outb(CRTPORT, 15);
        outb(CRTPORT + 1, pos as u8);
        crt().add(pos).write_volatile(b' ' as u16 | 0x0700);
    }
}

/// Sends one character to the screen and the serial port. Backspace is
/// rendered by rubbing out the previous character.
pub fn consputc(c: i32) {
    if kernel().is_panicked() {
        freeze();
    }

    if c == BACKSPACE {
        uart::putc(8);
        uart::putc(b' ' as i32);
        uart::putc(8);
    } else {
        uart::putc(c);
    }
    cgaputc(c);
}

/// The input interrupt handler. `getc` drains one source (keyboard or
/// UART); line editing happens here, and a completed line wakes readers.
pub fn intr(getc: impl Fn() -> i32) {
    let mut doprocdump = false;

    let mut cons = kernel().console.lock();
    loop {
        let c = getc();
        if c < 0 {
            break;
        }
        match c {
            _ if c == ctrl(b'P') => {
                // procdump() locks the console itself; defer until the
                // lock is released.
                doprocdump = true;
            }
            _ if c == ctrl(b'U') => {
                // Kill line.
                while cons.e != cons.w
                    && cons.buf[cons.e.wrapping_sub(1) as usize % INPUT_BUF] != b'\n'
                {
                    cons.e = cons.e.wrapping_sub(1);
                    consputc(BACKSPACE);
                }
            }
            _ if c == ctrl(b'H') || c == 0x7F => {
                // Backspace.
                if cons.e != cons.w {
                    cons.e = cons.e.wrapping_sub(1);
                    consputc(BACKSPACE);
                }
            }
            _ => {
                if c != 0 && cons.e.wrapping_sub(cons.r) < INPUT_BUF as u32 {
                    let c = if c == b'\r' as i32 { b'\n' as i32 } else { c };
                    let e = cons.e;
                    cons.buf[e as usize % INPUT_BUF] = c as u8;
                    cons.e = cons.e.wrapping_add(1);
                    consputc(c);
                    if c == b'\n' as i32
                        || c == ctrl(b'D')
                        || cons.e == cons.r.wrapping_add(INPUT_BUF as u32)
                    {
                        // Wake up consoleread() if a whole line (or
                        // end-of-file) has arrived.
                        cons.w = cons.e;
                        cons.wakeup();
                    }
                }
            }
        }
    }
    drop(cons);

    if doprocdump {
        kernel().procs.dump();
    }
}

/// The console device read: copies from the line-edited buffer, sleeping
/// until a whole line (or end-of-file) is available.
fn consoleread(dst: usize, n: usize) -> Result<usize, ()> {
    let p = myproc().expect("consoleread");
    let target = n;
    let mut n = n;
    let mut dst = dst;

    let mut cons = kernel().console.lock();
    while n > 0 {
        // Wait until the interrupt handler has put some input into the
        // buffer.
        while cons.r == cons.w {
            if p.killed() {
                return Err(());
            }
            cons.sleep();
        }

        let c = cons.buf[cons.r as usize % INPUT_BUF] as i32;
        cons.r = cons.r.wrapping_add(1);

        if c == ctrl(b'D') {
            // End-of-file. If some of this line was consumed, save ^D for
            // next time, so the caller gets a 0-byte result.
            if n < target {
                cons.r = cons.r.wrapping_sub(1);
            }
            break;
        }

        // SAFETY: `dst..dst + target` was validated by the system-call
        // layer, and the active address space maps it.
        unsafe { *(dst as *mut u8) = c as u8 };
        dst += 1;
        n -= 1;

        if c == b'\n' as i32 {
            // A whole line has arrived; return to the user-level read().
            break;
        }
    }

    Ok(target - n)
}

/// The console device write.
fn consolewrite(src: usize, n: usize) -> Result<usize, ()> {
    let _cons = kernel().console.lock();
    for i in 0..n {
        // SAFETY: `src..src + n` was validated by the system-call layer.
        let c = unsafe { *((src + i) as *const u8) };
        consputc(c as i32);
    }
    Ok(n)
}

/// Hooks the console into the device switch table and routes the keyboard
/// interrupt to the boot CPU.
pub fn init() {
    kernel().set_devsw(
        CONSOLE,
        Devsw {
            read: Some(consoleread),
            write: Some(consolewrite),
        },
    );

    ioapic::enable(IRQ_KBD, 0);
}

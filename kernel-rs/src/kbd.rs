//! PC keyboard: scancode translation and the keyboard interrupt handler.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::console;
use crate::x86::inb;

const KBSTATP: u16 = 0x64; // kbd controller status port
const KBS_DIB: u8 = 0x01; // kbd data in buffer
const KBDATAP: u16 = 0x60; // kbd data port

const SHIFT: u32 = 1 << 0;
const CTL: u32 = 1 << 1;
const CAPSLOCK: u32 = 1 << 2;
const E0ESC: u32 = 1 << 6;

const NO: u8 = 0;

const fn c(x: u8) -> u8 {
    x - b'@'
}

#[rustfmt::skip]
static SHIFTCODE: [u32; 256] = {
    let mut t = [0u32; 256];
    t[0x1D] = CTL;   // left ctrl
    t[0x2A] = SHIFT; // left shift
    t[0x36] = SHIFT; // right shift
    t[0x9D] = CTL;   // right ctrl (E0-escaped)
    t
};

#[rustfmt::skip]
static TOGGLECODE: [u32; 256] = {
    let mut t = [0u32; 256];
    t[0x3A] = CAPSLOCK;
    t
};

#[rustfmt::skip]
static NORMALMAP: [u8; 128] = [
    NO,   0x1B, b'1', b'2', b'3', b'4', b'5', b'6',  // 0x00
    b'7', b'8', b'9', b'0', b'-', b'=', 8,    b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i',  // 0x10
    b'o', b'p', b'[', b']', b'\n', NO, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';',  // 0x20
    b'\'', b'`', NO,  b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', NO,  b'*',   // 0x30
    NO,   b' ', NO,   NO,   NO,   NO,   NO,   NO,
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   b'7',  // 0x40
    b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', NO,   NO,   NO,   NO,    // 0x50
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,    // 0x60
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,    // 0x70
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,
];

#[rustfmt::skip]
static SHIFTMAP: [u8; 128] = [
    NO,   0x1B, b'!', b'@', b'#', b'$', b'%', b'^',  // 0x00
    b'&', b'*', b'(', b')', b'_', b'+', 8,    b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I',  // 0x10
    b'O', b'P', b'{', b'}', b'\n', NO, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':',  // 0x20
    b'"', b'~', NO,  b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', NO,  b'*',   // 0x30
    NO,   b' ', NO,   NO,   NO,   NO,   NO,   NO,
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   b'7',  // 0x40
    b'8', b'9', b'-', b'4', b'5', b'6', b'+', b'1',
    b'2', b'3', b'0', b'.', NO,   NO,   NO,   NO,    // 0x50
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,    // 0x60
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,    // 0x70
    NO,   NO,   NO,   NO,   NO,   NO,   NO,   NO,
];

#[rustfmt::skip]
static CTLMAP: [u8; 128] = {
    let mut t = [NO; 128];
    t[0x10] = c(b'Q'); t[0x11] = c(b'W'); t[0x12] = c(b'E'); t[0x13] = c(b'R');
    t[0x14] = c(b'T'); t[0x15] = c(b'Y'); t[0x16] = c(b'U'); t[0x17] = c(b'I');
    t[0x18] = c(b'O'); t[0x19] = c(b'P'); t[0x1C] = b'\r';
    t[0x1E] = c(b'A'); t[0x1F] = c(b'S'); t[0x20] = c(b'D'); t[0x21] = c(b'F');
    t[0x22] = c(b'G'); t[0x23] = c(b'H'); t[0x24] = c(b'J'); t[0x25] = c(b'K');
    t[0x26] = c(b'L'); t[0x2C] = c(b'Z'); t[0x2D] = c(b'X'); t[0x2E] = c(b'C');
    t[0x2F] = c(b'V'); t[0x30] = c(b'B'); t[0x31] = c(b'N'); t[0x32] = c(b'M');
    t
};

/// Modifier state; only touched from the keyboard interrupt path.
static STATE: AtomicU32 = AtomicU32::new(0);

/// One decoded input character, or -1 if none is pending.
fn getc() -> i32 {
    let mut st = STATE.load(Ordering::Relaxed);

    // SAFETY: keyboard controller port I/O.
    let mut data = unsafe {
        if inb(KBSTATP) & KBS_DIB == 0 {
            return -1;
        }
        inb(KBDATAP) as usize
    };
    if data == 0xE0 {
        st |= E0ESC;
        STATE.store(st, Ordering::Relaxed);
        return 0;
    } else if data & 0x80 != 0 {
        // Key released.
        data = if st & E0ESC != 0 { data } else { data & 0x7F };
        st &= !(SHIFTCODE[data] | E0ESC);
        STATE.store(st, Ordering::Relaxed);
        return 0;
    } else if st & E0ESC != 0 {
        // Last character was an E0 escape; or with 0x80.
        data |= 0x80;
        st &= !E0ESC;
    }

    st |= SHIFTCODE[data];
    st ^= TOGGLECODE[data];
    STATE.store(st, Ordering::Relaxed);

    let map = match st & (CTL | SHIFT) {
        0 => &NORMALMAP,
        SHIFT => &SHIFTMAP,
        _ => &CTLMAP,
    };
    let mut ch = map[data & 0x7F] as i32;
    if st & CAPSLOCK != 0 {
        if (b'a' as i32..=b'z' as i32).contains(&ch) {
            ch += b'A' as i32 - b'a' as i32;
        } else if (b'A' as i32..=b'Z' as i32).contains(&ch) {
            ch += b'a' as i32 - b'A' as i32;
        }
    }
    ch
}

pub fn intr() {
    console::intr(getc);
}

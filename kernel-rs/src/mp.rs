//! Multiprocessor support: searches BIOS memory for the MP description
//! tables and registers the CPUs and interrupt controllers they describe.
//! See the MultiProcessor Specification Version 1.4.

use core::mem;

use crate::ioapic;
use crate::kernel::kernel;
use crate::lapic;
use crate::memlayout::p2v;

/// The MP floating pointer structure ("_MP_").
#[repr(C)]
struct Mp {
    signature: [u8; 4],
    /// Physical address of the MP configuration table.
    physaddr: u32,
    length: u8,
    specrev: u8,
    checksum: u8,
    typ: u8,
    imcrp: u8,
    reserved: [u8; 3],
}

/// The MP configuration table header ("PCMP").
#[repr(C)]
struct MpConf {
    signature: [u8; 4],
    length: u16,
    version: u8,
    checksum: u8,
    product: [u8; 20],
    oemtable: u32,
    oemlength: u16,
    entry: u16,
    /// Physical address of the local APIC window.
    lapicaddr: u32,
    xlength: u16,
    xchecksum: u8,
    reserved: u8,
}

/// A processor entry in the configuration table.
#[repr(C)]
struct MpProc {
    typ: u8,
    apicid: u8,
    version: u8,
    flags: u8,
    signature: [u8; 4],
    feature: u32,
    reserved: [u8; 8],
}

/// An I/O APIC entry in the configuration table.
#[repr(C)]
struct MpIoApic {
    typ: u8,
    apicno: u8,
    version: u8,
    flags: u8,
    addr: u32,
}

// Table entry types.
const MPPROC: u8 = 0x00;
const MPBUS: u8 = 0x01;
const MPIOAPIC: u8 = 0x02;
const MPIOINTR: u8 = 0x03;
const MPLINTR: u8 = 0x04;

fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Looks for an MP structure in the `len` bytes at physical address `pa`.
unsafe fn mpsearch1(pa: usize, len: usize) -> Option<*const Mp> {
    let mut addr = p2v(pa);
    let end = addr + len;
    while addr < end {
        let candidate = core::slice::from_raw_parts(addr as *const u8, mem::size_of::<Mp>());
        if &candidate[..4] == b"_MP_" && sum(candidate) == 0 {
            return Some(addr as *const Mp);
        }
        addr += mem::size_of::<Mp>();
    }
    None
}

/// Searches for the MP floating pointer structure, which according to the
/// spec is in one of the following three locations:
/// 1) in the first KB of the EBDA;
/// 2) in the last KB of system base memory;
/// 3) in the BIOS ROM between 0xF0000 and 0xFFFFF.
unsafe fn mpsearch() -> Option<*const Mp> {
    let bda = p2v(0x400) as *const u8;
    let p = ((*bda.add(0x0F) as usize) << 8 | (*bda.add(0x0E) as usize)) << 4;
    if p != 0 {
        if let Some(mp) = mpsearch1(p, 1024) {
            return Some(mp);
        }
    } else {
        let p = ((*bda.add(0x14) as usize) << 8 | (*bda.add(0x13) as usize)) * 1024;
        if let Some(mp) = mpsearch1(p - 1024, 1024) {
            return Some(mp);
        }
    }
    mpsearch1(0xF0000, 0x10000)
}

/// Searches for an MP configuration table. Only minimally sanity-checked:
/// the right signature, the right checksum, a known version.
unsafe fn mpconfig() -> Option<(*const Mp, *const MpConf)> {
    let mp = mpsearch()?;
    if (*mp).physaddr == 0 {
        return None;
    }
    let conf = p2v((*mp).physaddr as usize) as *const MpConf;
    let raw = core::slice::from_raw_parts(conf as *const u8, (*conf).length as usize);
    if &raw[..4] != b"PCMP" {
        return None;
    }
    if (*conf).version != 1 && (*conf).version != 4 {
        return None;
    }
    if sum(raw) != 0 {
        return None;
    }
    Some((mp, conf))
}

/// Registers every CPU and the I/O APIC found in the MP tables. A machine
/// without them is not one this kernel can run on.
pub fn init() {
    // SAFETY: single-threaded boot; the BIOS areas read are mapped by the
    // boot page directory.
    unsafe {
        let (_mp, conf) = mpconfig().expect("expect to run on an SMP");
        lapic::set_base((*conf).lapicaddr as usize);

        let mut p = conf.add(1) as *const u8;
        let end = (conf as *const u8).add((*conf).length as usize);
        while p < end {
            match *p {
                MPPROC => {
                    let proc = p as *const MpProc;
                    kernel().cpus.add((*proc).apicid);
                    p = p.add(mem::size_of::<MpProc>());
                }
                MPIOAPIC => {
                    let io = p as *const MpIoApic;
                    ioapic::set_id((*io).apicno);
                    p = p.add(mem::size_of::<MpIoApic>());
                }
                MPBUS | MPIOINTR | MPLINTR => p = p.add(8),
                _ => {
                    // Unknown entry type; the table is untrustworthy.
                    panic!("mpinit: unknown config type {:x}", *p);
                }
            }
        }
    }
}

//! x86 memory management unit: paging geometry and segment machinery.

// The canonical x86 descriptor constants are kept whole, used or not.
#![allow(dead_code)]

use bitflags::bitflags;

/// Bytes mapped by a page.
pub const PGSIZE: usize = 4096;

/// # directory entries per page directory.
pub const NPDENTRIES: usize = 1024;

/// # PTEs per page table.
pub const NPTENTRIES: usize = 1024;

/// Offset of PTX in a linear address.
pub const PTXSHIFT: usize = 12;

/// Offset of PDX in a linear address.
pub const PDXSHIFT: usize = 22;

/// Page directory index.
///
/// A virtual address 'va' has a three-part structure as follows:
///
/// ```text
/// +--------10------+-------10-------+---------12----------+
/// | Page Directory |   Page Table   | Offset within Page  |
/// |      Index     |      Index     |                     |
/// +----------------+----------------+---------------------+
/// ```
pub const fn pdx(va: usize) -> usize {
    (va >> PDXSHIFT) & 0x3FF
}

/// Page table index.
pub const fn ptx(va: usize) -> usize {
    (va >> PTXSHIFT) & 0x3FF
}

/// Construct a virtual address from indices and offset.
pub const fn pgaddr(d: usize, t: usize, o: usize) -> usize {
    (d << PDXSHIFT) | (t << PTXSHIFT) | o
}

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

bitflags! {
    /// Page table/directory entry flags.
    pub struct PteFlags: u32 {
        /// Present.
        const P = 0x001;
        /// Writeable.
        const W = 0x002;
        /// User-accessible.
        const U = 0x004;
        /// 4 MiB page (directory entries only).
        const PS = 0x080;
    }
}

/// A page table/directory entry: a frame address plus `PteFlags`.
pub type PteT = u32;

/// Address in a page table or page directory entry.
pub const fn pte_addr(pte: PteT) -> usize {
    (pte & !0xFFF) as usize
}

/// Flags in a page table or page directory entry.
pub const fn pte_flags(pte: PteT) -> PteFlags {
    PteFlags::from_bits_truncate(pte & 0xFFF)
}

// cpu.gdt[NSEGS] holds the segments below.

/// Kernel code.
pub const SEG_KCODE: usize = 1;
/// Kernel data+stack.
pub const SEG_KDATA: usize = 2;
/// User code.
pub const SEG_UCODE: usize = 3;
/// User data+stack.
pub const SEG_UDATA: usize = 4;
/// This process's task state.
pub const SEG_TSS: usize = 5;

pub const NSEGS: usize = 6;

/// User descriptor privilege level.
pub const DPL_USER: u16 = 0x3;

/// Application segment type bits: executable.
pub const STA_X: u8 = 0x8;
/// Application segment type bits: writable (data).
pub const STA_W: u8 = 0x2;
/// Application segment type bits: readable (code).
pub const STA_R: u8 = 0x2;

/// System segment type: available 32-bit TSS.
pub const STS_T32A: u8 = 0x9;
/// System segment type: 32-bit interrupt gate.
pub const STS_IG32: u8 = 0xE;
/// System segment type: 32-bit trap gate.
pub const STS_TG32: u8 = 0xF;

/// EFLAGS interrupt enable.
pub const FL_IF: u32 = 0x0000_0200;

/// Control register flags.
pub const CR0_PE: u32 = 0x0000_0001;
pub const CR0_WP: u32 = 0x0001_0000;
pub const CR0_PG: u32 = 0x8000_0000;
pub const CR4_PSE: u32 = 0x0000_0010;

/// A segment descriptor in the GDT.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct SegDesc(u64);

impl SegDesc {
    pub const fn zero() -> Self {
        Self(0)
    }

    const fn build(typ: u8, base: u32, lim: u32, dpl: u16, s: u64, db: u64, g: u64) -> Self {
        let base = base as u64;
        let lim = lim as u64;
        let mut x = 0u64;
        x |= lim & 0xFFFF; // limit 15:0
        x |= (base & 0xFF_FFFF) << 16; // base 23:0
        x |= ((typ as u64) & 0xF) << 40;
        x |= s << 44; // descriptor type (0 = system)
        x |= ((dpl as u64) & 0x3) << 45;
        x |= 1 << 47; // present
        x |= ((lim >> 16) & 0xF) << 48; // limit 19:16
        x |= db << 54; // 32-bit segment
        x |= g << 55; // limit is scaled by 4K
        x |= ((base >> 24) & 0xFF) << 56; // base 31:24
        Self(x)
    }

    /// A flat application segment with a 4 KiB-granular limit.
    pub const fn seg(typ: u8, base: u32, lim: u32, dpl: u16) -> Self {
        Self::build(typ, base, lim >> 12, dpl, 1, 1, 1)
    }

    /// A byte-granular system segment (the TSS).
    pub const fn seg16(typ: u8, base: u32, lim: u32, dpl: u16) -> Self {
        Self::build(typ, base, lim, dpl, 0, 1, 0)
    }
}

/// An interrupt/trap gate descriptor in the IDT.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct GateDesc(u64);

impl GateDesc {
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Sets up a gate.
    /// * `istrap`: true for a trap (exception) gate, false for an interrupt
    ///   gate. Interrupt gates clear FL_IF on entry.
    /// * `sel`: code segment selector for the handler.
    /// * `off`: offset of the handler in the segment.
    /// * `dpl`: privilege level required to invoke the gate explicitly with
    ///   an int instruction.
    pub const fn new(istrap: bool, sel: u16, off: u32, dpl: u16) -> Self {
        let typ = if istrap { STS_TG32 } else { STS_IG32 };
        let mut x = 0u64;
        x |= (off as u64) & 0xFFFF; // offset 15:0
        x |= (sel as u64) << 16;
        x |= ((typ as u64) & 0xF) << 40;
        x |= ((dpl as u64) & 0x3) << 45;
        x |= 1 << 47; // present
        x |= ((off as u64) >> 16) << 48; // offset 31:16
        Self(x)
    }
}

/// Task state segment format. Only `esp0`/`ss0` (the stack to load on a
/// privilege increase) and `iomb` are ever written; the rest exists for the
/// hardware.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct TaskState {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u16,
    padding1: u16,
    pub esp1: u32,
    pub ss1: u16,
    padding2: u16,
    pub esp2: u32,
    pub ss2: u16,
    padding3: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    padding4: u16,
    pub cs: u16,
    padding5: u16,
    pub ss: u16,
    padding6: u16,
    pub ds: u16,
    padding7: u16,
    pub fs: u16,
    padding8: u16,
    pub gs: u16,
    padding9: u16,
    pub ldt: u16,
    padding10: u16,
    /// Trap on task switch.
    pub t: u16,
    /// I/O map base address.
    pub iomb: u16,
}

impl TaskState {
    pub const fn zero() -> Self {
        // SAFETY: TaskState is plain old data; all-zeroes is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

//! Physical memory layout.
//!
//! The kernel is linked at KERNLINK and loaded at EXTMEM. The high half of
//! every address space maps physical memory [0, PHYSTOP) at KERNBASE, plus
//! the memory-mapped device window at DEVSPACE.

/// Start of extended memory.
pub const EXTMEM: usize = 0x100000;

/// Top of physical memory the kernel will use.
pub const PHYSTOP: usize = 0xE000000;

/// Other devices are at high addresses.
pub const DEVSPACE: usize = 0xFE000000;

/// First kernel virtual address.
pub const KERNBASE: usize = 0x8000_0000;

/// Address where the kernel is linked.
pub const KERNLINK: usize = KERNBASE + EXTMEM;

/// Kernel virtual address to physical address.
pub const fn v2p(a: usize) -> usize {
    a - KERNBASE
}

/// Physical address to kernel virtual address.
pub const fn p2v(a: usize) -> usize {
    a + KERNBASE
}

//! Physical memory allocator, intended to allocate memory for user
//! processes, kernel stacks, page table pages, and pipe buffers. Allocates
//! 4096-byte pages.

use core::cell::Cell;
use core::ptr;

use xr6_kernel_lib::lock::RawLock;

use crate::lock::RawSpinlock;
use crate::memlayout::{v2p, PHYSTOP};
use crate::mmu::{pgroundup, PGSIZE};
use crate::page::Page;

extern "C" {
    /// First address after kernel loaded from ELF file. Defined by kernel.ld.
    static end: u8;
}

struct Run {
    next: *mut Run,
}

/// The page frame freelist.
///
/// # Safety
///
/// * The list has no cycle; every node is the address of a free, page-aligned
///   frame below PHYSTOP.
/// * `freelist` and `use_lock` are only accessed while holding `lock`, except
///   during early boot (`use_lock` is false until the first CPU finishes
///   `init2`, when no other CPU runs yet).
pub struct Kmem {
    lock: RawSpinlock,
    use_lock: Cell<bool>,
    freelist: Cell<*mut Run>,
}

// SAFETY: see the invariants above.
unsafe impl Sync for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            lock: RawSpinlock::new("kmem"),
            use_lock: Cell::new(false),
            freelist: Cell::new(ptr::null_mut()),
        }
    }

    /// Initialization happens in two phases.
    /// 1. main() calls init1() while still using entrypgdir to place just
    ///    the pages mapped by entrypgdir on the free list.
    /// 2. main() calls init2() with the rest of the physical pages after
    ///    installing a full page table that maps them on all cores.
    pub unsafe fn init1(&self, vstart: usize, vend: usize) {
        self.free_range(vstart, vend);
    }

    pub unsafe fn init2(&self, vstart: usize, vend: usize) {
        self.free_range(vstart, vend);
        self.use_lock.set(true);
    }

    unsafe fn free_range(&self, vstart: usize, vend: usize) {
        let mut p = pgroundup(vstart);
        while p + PGSIZE <= vend {
            self.free(Page::from_usize(p));
            p += PGSIZE;
        }
    }

    /// Frees the page of physical memory `pa`, which normally should have
    /// been returned by a call to `alloc()`. (The exception is when
    /// initializing the allocator; see `init1`/`init2` above.)
    pub fn free(&self, mut pa: Page) {
        let addr = pa.addr();
        // SAFETY: `end` is a linker symbol; only its address is taken.
        let kernel_end = unsafe { &end as *const u8 as usize };
        if addr % PGSIZE != 0 || addr < kernel_end || v2p(addr) >= PHYSTOP {
            panic!("kfree");
        }

        // Fill with junk to catch dangling refs.
        pa.write_bytes(1);

        if self.use_lock.get() {
            self.lock.acquire();
        }
        let r = pa.into_usize() as *mut Run;
        // SAFETY: the frame is uniquely owned (it came from a `Page`), so
        // writing the list node into it cannot race, and linking it cannot
        // create a cycle.
        unsafe { (*r).next = self.freelist.get() };
        self.freelist.set(r);
        if self.use_lock.get() {
            self.lock.release();
        }
    }

    /// Allocates one 4096-byte page of physical memory.
    /// Returns a page the kernel can use, or None if the memory is
    /// exhausted.
    pub fn alloc(&self) -> Option<Page> {
        if self.use_lock.get() {
            self.lock.acquire();
        }
        let r = self.freelist.get();
        if !r.is_null() {
            // SAFETY: a non-null head is a valid free frame by the list
            // invariant.
            self.freelist.set(unsafe { (*r).next });
        }
        if self.use_lock.get() {
            self.lock.release();
        }

        if r.is_null() {
            return None;
        }
        // SAFETY: the frame was just unlinked, so it is uniquely owned now.
        Some(unsafe { Page::from_usize(r as usize) })
    }
}

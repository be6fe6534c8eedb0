//! Virtual memory: two-level x86 page tables, the kernel address-space
//! template, and per-process user memory.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cpu::{self, mycpu};
use crate::fs::InodeGuard;
use crate::kernel::kernel;
use crate::memlayout::{p2v, v2p, DEVSPACE, EXTMEM, KERNBASE, KERNLINK, PHYSTOP};
use crate::mmu::{
    pdx, pgaddr, pgrounddown, pgroundup, pte_addr, pte_flags, ptx, PteFlags, PteT, SegDesc,
    NPDENTRIES, PGSIZE, SEG_KCODE, SEG_KDATA, SEG_TSS, SEG_UCODE, SEG_UDATA, STA_R, STA_W, STA_X,
    STS_T32A, DPL_USER,
};
use crate::page::Page;
use crate::param::KSTACKSIZE;
use crate::proc::Proc;
use crate::x86::{lcr3, lgdt, ltr};

extern "C" {
    /// Start of the kernel data segment. Defined by kernel.ld; everything
    /// below it (from KERNLINK) is text and read-only data.
    static data: u8;
}

/// One page table/directory entry.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Pte(PteT);

impl Pte {
    fn present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    fn flags(&self) -> PteFlags {
        pte_flags(self.0)
    }

    fn addr(&self) -> usize {
        pte_addr(self.0)
    }

    fn set(&mut self, pa: usize, perm: PteFlags) {
        debug_assert_eq!(pa % PGSIZE, 0);
        self.0 = pa as PteT | (perm | PteFlags::P).bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    fn clear_flag(&mut self, flag: PteFlags) {
        self.0 &= !flag.bits();
    }
}

/// A page of 1024 entries: a page directory or a second-level page table.
#[repr(C, align(4096))]
pub struct RawPageTable {
    entries: [Pte; NPDENTRIES],
}

/// An address space: an owned page directory. The high half is the shared
/// kernel mapping; the low half is per-process user memory.
pub struct PageTable {
    ptr: *mut RawPageTable,
}

// SAFETY: a `PageTable` is uniquely owned; frames reachable from it are
// owned by it.
unsafe impl Send for PageTable {}

impl PageTable {
    fn dir(&self) -> &RawPageTable {
        // SAFETY: `ptr` is a live, owned directory page.
        unsafe { &*self.ptr }
    }

    fn dir_mut(&mut self) -> &mut RawPageTable {
        // SAFETY: `ptr` is a live, owned directory page.
        unsafe { &mut *self.ptr }
    }

    /// The physical address to load into %cr3.
    fn phys_addr(&self) -> usize {
        v2p(self.ptr as usize)
    }

    fn into_raw(self) -> *mut RawPageTable {
        let ptr = self.ptr;
        core::mem::forget(self);
        ptr
    }

    /// Returns the PTE in this address space that corresponds to virtual
    /// address `va`. If `alloc` is true, creates the required second-level
    /// table if it is absent; returns None if that allocation fails.
    fn walk_mut(&mut self, va: usize, alloc: bool) -> Option<&mut Pte> {
        let pde = &mut self.dir_mut().entries[pdx(va)];
        let pgtab = if pde.present() {
            p2v(pde.addr()) as *mut RawPageTable
        } else {
            if !alloc {
                return None;
            }
            let mut page = kernel().kmem.alloc()?;
            // Make sure all those PTE_P bits are zero.
            page.write_bytes(0);
            let pa = v2p(page.into_usize());
            // The permissions here are overly generous, but they can be
            // further restricted by the permissions in the second-level
            // entries, if necessary.
            pde.set(pa, PteFlags::W | PteFlags::U);
            p2v(pa) as *mut RawPageTable
        };
        // SAFETY: a present directory entry always refers to an owned,
        // live table page.
        Some(unsafe { &mut (*pgtab).entries[ptx(va)] })
    }

    /// Read-only `walk_mut`: never allocates.
    fn walk(&self, va: usize) -> Option<&Pte> {
        let pde = &self.dir().entries[pdx(va)];
        if !pde.present() {
            return None;
        }
        let pgtab = p2v(pde.addr()) as *const RawPageTable;
        // SAFETY: see `walk_mut`.
        Some(unsafe { &(*pgtab).entries[ptx(va)] })
    }

    /// Creates PTEs for virtual addresses starting at `va` that refer to
    /// physical addresses starting at `pa`. `va` and `size` might not be
    /// page-aligned. Every page in the range must be unmapped; remapping is
    /// a fatal error (kernel state is corrupt).
    fn map_pages(&mut self, va: usize, size: usize, mut pa: usize, perm: PteFlags) -> Result<(), ()> {
        let mut a = pgrounddown(va);
        let last = pgrounddown(va.wrapping_add(size).wrapping_sub(1));
        loop {
            let pte = self.walk_mut(a, true).ok_or(())?;
            if pte.present() {
                panic!("remap");
            }
            pte.set(pa, perm);
            if a == last {
                break;
            }
            a += PGSIZE;
            pa += PGSIZE;
        }
        Ok(())
    }

    /// Loads the initcode into address 0 of this address space. `code` must
    /// be less than a page.
    pub fn init_user(&mut self, code: &[u8]) {
        assert!(code.len() < PGSIZE, "init_user: more than a page");
        let mut page = kernel().kmem.alloc().expect("init_user: out of memory");
        page.write_bytes(0);
        page[..code.len()].copy_from_slice(code);
        let pa = v2p(page.into_usize());
        self.map_pages(0, PGSIZE, pa, PteFlags::W | PteFlags::U)
            .expect("init_user: map_pages");
    }

    /// Loads a program segment into this address space. `va` must be
    /// page-aligned and the pages from `va` to `va + sz` must already be
    /// mapped.
    pub fn load_user(
        &mut self,
        va: usize,
        ip: &mut InodeGuard<'_>,
        offset: u32,
        sz: u32,
    ) -> Result<(), ()> {
        assert_eq!(va % PGSIZE, 0, "load_user: addr must be page aligned");
        let mut i: u32 = 0;
        while i < sz {
            let pte = self.walk(va + i as usize).expect("load_user: address should exist");
            let pa = pte.addr();
            let n = core::cmp::min(sz - i, PGSIZE as u32);
            if ip.read(p2v(pa), offset + i, n)? != n as usize {
                return Err(());
            }
            i += PGSIZE as u32;
        }
        Ok(())
    }

    /// Allocates page frames and PTEs to grow the process from `oldsz` to
    /// `newsz`, which need not be page-aligned. Rolls back on failure.
    pub fn alloc_user(&mut self, oldsz: usize, newsz: usize) -> Result<usize, ()> {
        if newsz >= KERNBASE {
            return Err(());
        }
        if newsz < oldsz {
            return Ok(oldsz);
        }

        let mut a = pgroundup(oldsz);
        while a < newsz {
            let Some(mut page) = kernel().kmem.alloc() else {
                self.dealloc_user(newsz, oldsz);
                return Err(());
            };
            page.write_bytes(0);
            let pa = v2p(page.into_usize());
            if self
                .map_pages(a, PGSIZE, pa, PteFlags::W | PteFlags::U)
                .is_err()
            {
                // SAFETY: the frame was ours and is unmapped.
                kernel().kmem.free(unsafe { Page::from_usize(p2v(pa)) });
                self.dealloc_user(newsz, oldsz);
                return Err(());
            }
            a += PGSIZE;
        }
        Ok(newsz)
    }

    /// Deallocates user pages to bring the process size from `oldsz` down
    /// to `newsz`. `oldsz` can be larger than the actual process size.
    /// Absent entries are skipped; an absent second-level table skips the
    /// whole directory slot.
    pub fn dealloc_user(&mut self, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }

        let mut a = pgroundup(newsz);
        while a < oldsz {
            match self.walk_mut(a, false) {
                None => {
                    // No table page here: jump to the next directory entry.
                    a = pgaddr(pdx(a) + 1, 0, 0);
                    continue;
                }
                Some(pte) => {
                    if pte.present() {
                        let pa = pte.addr();
                        assert_ne!(pa, 0, "dealloc_user");
                        pte.clear();
                        // SAFETY: the frame was owned by this mapping.
                        kernel().kmem.free(unsafe { Page::from_usize(p2v(pa)) });
                    }
                }
            }
            a += PGSIZE;
        }
        newsz
    }

    /// Marks a PTE invalid for user access; used for the stack guard page.
    pub fn clear_user(&mut self, va: usize) {
        let pte = self.walk_mut(va, false).expect("clear_user");
        pte.clear_flag(PteFlags::U);
    }

    /// Returns a deep copy of the user half of this address space for a
    /// child process: fresh frames holding copies of the parent's memory,
    /// over a fresh kernel template.
    pub fn copy_user(&self, sz: usize) -> Option<PageTable> {
        let mut d = setupkvm()?;
        let mut i = 0;
        while i < sz {
            let pte = self.walk(i).expect("copy_user: pte should exist");
            assert!(pte.present(), "copy_user: page not present");
            let pa = pte.addr();
            let flags = pte.flags();
            let Some(mut page) = kernel().kmem.alloc() else {
                d.free();
                return None;
            };
            // SAFETY: `pa` is a frame mapped in this address space; both
            // sides are PGSIZE long.
            unsafe {
                ptr::copy_nonoverlapping(p2v(pa) as *const u8, page.as_mut_ptr(), PGSIZE);
            }
            let mem = v2p(page.into_usize());
            if d.map_pages(i, PGSIZE, mem, flags).is_err() {
                // SAFETY: the frame is ours and unmapped.
                kernel().kmem.free(unsafe { Page::from_usize(p2v(mem)) });
                d.free();
                return None;
            }
            i += PGSIZE;
        }
        Some(d)
    }

    /// Maps user virtual address to kernel address, requiring a present,
    /// user-accessible page.
    fn uva2ka(&self, uva: usize) -> Option<*mut u8> {
        let pte = self.walk(uva)?;
        if !pte.present() || !pte.flags().contains(PteFlags::U) {
            return None;
        }
        Some(p2v(pte.addr()) as *mut u8)
    }

    /// Copies `src` into this address space at virtual address `va`. Works
    /// even when this is not the active address space (exec builds the new
    /// image while the old one is still installed). Refuses non-user pages.
    pub fn copy_out(&mut self, va: usize, src: &[u8]) -> Result<(), ()> {
        let mut len = src.len();
        let mut offset = 0;
        let mut va = va;
        while len > 0 {
            let va0 = pgrounddown(va);
            let pa0 = self.uva2ka(va0).ok_or(())?;
            let n = core::cmp::min(PGSIZE - (va - va0), len);
            // SAFETY: `pa0` is a mapped frame; `va - va0 + n <= PGSIZE`.
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr().add(offset), pa0.add(va - va0), n);
            }
            len -= n;
            offset += n;
            va = va0 + PGSIZE;
        }
        Ok(())
    }

    /// Frees every frame of user memory, every second-level table page, and
    /// the directory itself.
    pub fn free(mut self) {
        self.dealloc_user(KERNBASE, 0);
        for i in 0..NPDENTRIES {
            let pde = self.dir().entries[i];
            if pde.present() {
                // SAFETY: present directory entries own their table pages.
                kernel()
                    .kmem
                    .free(unsafe { Page::from_usize(p2v(pde.addr())) });
            }
        }
        let ptr = self.into_raw();
        // SAFETY: the directory page is owned by this `PageTable`.
        kernel().kmem.free(unsafe { Page::from_usize(ptr as usize) });
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        panic!("page table must be freed via PageTable::free");
    }
}

/// A mapping for `setupkvm`: one contiguous region of the kernel half.
struct Kmap {
    virt: usize,
    phys_start: usize,
    phys_end: usize,
    perm: PteFlags,
}

/// The kernel's mappings, present in every address space:
///  - I/O space below EXTMEM,
///  - kernel text and read-only data,
///  - kernel data and all remaining physical memory,
///  - the memory-mapped device window above DEVSPACE.
fn kmap() -> [Kmap; 4] {
    // SAFETY: `data` is a linker symbol; only its address is taken.
    let data_addr = unsafe { &data as *const u8 as usize };
    [
        Kmap {
            virt: KERNBASE,
            phys_start: 0,
            phys_end: EXTMEM,
            perm: PteFlags::W,
        },
        Kmap {
            virt: KERNLINK,
            phys_start: v2p(KERNLINK),
            phys_end: v2p(data_addr),
            perm: PteFlags::empty(),
        },
        Kmap {
            virt: data_addr,
            phys_start: v2p(data_addr),
            phys_end: PHYSTOP,
            perm: PteFlags::W,
        },
        Kmap {
            virt: DEVSPACE,
            phys_start: DEVSPACE,
            phys_end: 0, // wraps: map to the end of the 4 GiB space
            perm: PteFlags::W,
        },
    ]
}

/// Builds a fresh page directory with the kernel half populated and the
/// user half empty. Returns None if out of memory.
pub fn setupkvm() -> Option<PageTable> {
    let mut page = kernel().kmem.alloc()?;
    page.write_bytes(0);
    let mut pgdir = PageTable {
        ptr: page.into_usize() as *mut RawPageTable,
    };

    assert!(p2v(PHYSTOP) <= DEVSPACE, "PHYSTOP too high");
    for k in kmap() {
        if pgdir
            .map_pages(
                k.virt,
                k.phys_end.wrapping_sub(k.phys_start),
                k.phys_start,
                k.perm,
            )
            .is_err()
        {
            pgdir.free();
            return None;
        }
    }
    Some(pgdir)
}

/// The kernel's own page directory, used when no process runs.
static KPGDIR: AtomicUsize = AtomicUsize::new(0);

/// Allocates one page directory for the scheduler context of each CPU.
pub fn kvmalloc() {
    let pgdir = setupkvm().expect("kvmalloc");
    KPGDIR.store(pgdir.into_raw() as usize, Ordering::Release);
    switchkvm();
}

/// Switches the hardware page directory register to the kernel-only page
/// directory, for when no process is running.
pub fn switchkvm() {
    let kpgdir = KPGDIR.load(Ordering::Acquire);
    // SAFETY: `kpgdir` was built by kvmalloc and maps the kernel.
    unsafe { lcr3(v2p(kpgdir)) };
}

/// Switches the TSS and the hardware page directory to process `p`'s.
pub fn switchuvm(p: &Proc) {
    // SAFETY: the caller guarantees `p` is the process this CPU is about to
    // run (or is running), so its data is stable.
    let pdata = unsafe { p.data() };
    assert_ne!(pdata.kstack, 0, "switchuvm: no kstack");
    let pgdir = pdata.pgdir.as_ref().expect("switchuvm: no pgdir");

    cpu::push_off();
    let c = mycpu();
    // SAFETY: per-CPU structures, interrupts off.
    unsafe {
        let ts = &mut *c.ts.get();
        let gdt = &mut *c.gdt.get();
        gdt[SEG_TSS] = SegDesc::seg16(
            STS_T32A,
            ts as *const _ as u32,
            (core::mem::size_of::<crate::mmu::TaskState>() - 1) as u32,
            0,
        );
        ts.ss0 = (SEG_KDATA << 3) as u16;
        ts.esp0 = (pdata.kstack + KSTACKSIZE) as u32;
        // Setting IOMB beyond the TSS limit forbids I/O instructions (e.g.,
        // inb and outb) from user space.
        ts.iomb = 0xFFFF;
        ltr((SEG_TSS << 3) as u16);
        lcr3(pgdir.phys_addr());
    }
    cpu::pop_off();
}

/// Sets up this CPU's segment descriptors: flat mappings differing only in
/// privilege level.
pub fn seginit() {
    cpu::push_off();
    let c = mycpu();
    // SAFETY: per-CPU structure, interrupts off.
    unsafe {
        let gdt = &mut *c.gdt.get();
        gdt[SEG_KCODE] = SegDesc::seg(STA_X | STA_R, 0, 0xFFFF_FFFF, 0);
        gdt[SEG_KDATA] = SegDesc::seg(STA_W, 0, 0xFFFF_FFFF, 0);
        gdt[SEG_UCODE] = SegDesc::seg(STA_X | STA_R, 0, 0xFFFF_FFFF, DPL_USER);
        gdt[SEG_UDATA] = SegDesc::seg(STA_W, 0, 0xFFFF_FFFF, DPL_USER);
        lgdt(
            gdt.as_ptr() as *const u8,
            core::mem::size_of_val(gdt) as u16,
        );
    }
    cpu::pop_off();
}

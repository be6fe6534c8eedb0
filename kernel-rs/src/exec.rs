//! exec(): replace the current process image with a program loaded from
//! the file system.

use core::mem;

use cstr_core::CStr;
use scopeguard::ScopeGuard;
use zerocopy::{AsBytes, FromZeroes};

use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::{InodeGuard, Path, RcInodeExt};
use crate::kernel::kernel;
use crate::mmu::{pgroundup, PGSIZE};
use crate::param::{MAXARG, MAXPROCNAME};
use crate::proc::myproc;
use crate::vm::{self, PageTable};

pub fn exec(path: &Path, argv: &[&CStr]) -> Result<(), ()> {
    let fs = &kernel().file_system;

    // The pathname walk and the final inode release may both free inode
    // references, so the load runs inside a transaction.
    fs.begin_op();
    let image = (|| {
        let ip = path.namei()?;
        let mut guard = ip.lock();
        load_image(&mut guard)
    })();
    fs.end_op();
    let (pgdir, sz, entry) = image?;

    // Free the half-built image if anything below fails.
    let mut pgdir = scopeguard::guard(pgdir, |pgdir| pgdir.free());

    // Allocate two pages at the next page boundary; use the second as the
    // user stack, and make the first inaccessible to catch overflow.
    let sz = pgroundup(sz);
    let sz = pgdir.alloc_user(sz, sz + 2 * PGSIZE)?;
    pgdir.clear_user(sz - 2 * PGSIZE);
    let mut sp = sz;

    // Push argument strings, prepare rest of stack in ustack.
    let mut ustack = [0u32; 3 + MAXARG + 1];
    let mut argc = 0;
    for arg in argv {
        let bytes = arg.to_bytes_with_nul();
        sp = (sp - bytes.len()) & !3;
        pgdir.copy_out(sp, bytes)?;
        ustack[3 + argc] = sp as u32;
        argc += 1;
    }
    ustack[3 + argc] = 0;

    ustack[0] = 0xFFFF_FFFF; // fake return PC
    ustack[1] = argc as u32;
    ustack[2] = (sp - (argc + 1) * 4) as u32; // argv pointer

    sp -= (3 + argc + 1) * 4;
    pgdir.copy_out(sp, &ustack.as_bytes()[..(3 + argc + 1) * 4])?;

    // Committed: nothing can fail from here on.
    let pgdir = ScopeGuard::into_inner(pgdir);

    let p = myproc().expect("exec");
    // SAFETY: we are the current process.
    let data = unsafe { p.data_mut() };

    // Save program name for debugging.
    let name = path_basename(path);
    data.name = [0; MAXPROCNAME];
    let n = name.len().min(MAXPROCNAME - 1);
    data.name[..n].copy_from_slice(&name[..n]);

    // Commit to the user image.
    let oldpgdir = data.pgdir.replace(pgdir);
    data.sz = sz;
    // SAFETY: the trap frame lives on this process's kernel stack.
    unsafe {
        (*data.trap_frame).eip = entry; // main
        (*data.trap_frame).esp = sp as u32;
    }
    vm::switchuvm(p);
    if let Some(old) = oldpgdir {
        old.free();
    }
    Ok(())
}

/// Reads the ELF image into a fresh address space. Returns the address
/// space, its size, and the entry point; on any failure the partial
/// address space is freed.
fn load_image(ip: &mut InodeGuard<'_>) -> Result<(PageTable, usize, u32), ()> {
    // Check ELF header.
    let mut elf = ElfHdr::new_zeroed();
    if ip.read_bytes(elf.as_bytes_mut(), 0)? != mem::size_of::<ElfHdr>() {
        return Err(());
    }
    if elf.magic != ELF_MAGIC {
        return Err(());
    }

    let mut pgdir = scopeguard::guard(vm::setupkvm().ok_or(())?, |pgdir| pgdir.free());

    // Load each program segment.
    let mut sz = 0;
    for i in 0..elf.phnum as usize {
        let off = elf.phoff as usize + i * mem::size_of::<ProgHdr>();
        let mut ph = ProgHdr::new_zeroed();
        if ip.read_bytes(ph.as_bytes_mut(), off as u32)? != mem::size_of::<ProgHdr>() {
            return Err(());
        }
        if ph.typ != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(());
        }
        if ph.vaddr.wrapping_add(ph.memsz) < ph.vaddr {
            return Err(());
        }
        if ph.vaddr as usize % PGSIZE != 0 {
            return Err(());
        }
        sz = pgdir.alloc_user(sz, (ph.vaddr + ph.memsz) as usize)?;
        pgdir.load_user(ph.vaddr as usize, ip, ph.off, ph.filesz)?;
    }

    Ok((ScopeGuard::into_inner(pgdir), sz, elf.entry))
}

/// The last component of a path, for the process name.
fn path_basename(path: &Path) -> &[u8] {
    let bytes = path.as_bytes();
    let start = bytes
        .iter()
        .rposition(|&c| c == b'/')
        .map_or(0, |i| i + 1);
    &bytes[start..]
}

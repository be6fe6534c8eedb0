//! Open files: reference-counted objects over a pipe or an inode, plus the
//! device switch table.

use core::cell::UnsafeCell;
use core::mem;

use array_macro::array;
use xr6_kernel_lib::arena::{Arena, ArenaObject, ArenaRc, ArrayArena};
use xr6_kernel_lib::lock::Pause;
use xr6_kernel_lib::rc_cell::RcCell;

use crate::fs::{RcInode, RcInodeExt};
use crate::kernel::kernel;
use crate::lock::{new_spinlock, SpinLock};
use crate::param::{BSIZE, MAXOPBLOCKS, NFILE};
use crate::pipe::AllocatedPipe;
use crate::proc::myproc;
use crate::stat::T_DEV;

/// What an open file refers to.
pub enum FileType {
    None,
    Pipe {
        pipe: AllocatedPipe,
    },
    Inode {
        ip: RcInode,
        /// Current offset; accessed only while holding the inode's
        /// sleep-lock.
        off: UnsafeCell<u32>,
    },
}

/// An open file object, shared by every descriptor that `dup`ed it.
pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

// SAFETY: `off` is only touched under the backing inode's sleep-lock.
unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    pub const fn zero() -> Self {
        Self {
            typ: FileType::None,
            readable: false,
            writable: false,
        }
    }

    /// Copies file metadata into the user address `addr` (already validated
    /// by the system-call layer).
    pub fn stat(&self, addr: usize) -> Result<(), ()> {
        match &self.typ {
            FileType::Inode { ip, .. } => {
                let st = ip.lock().stat();
                // SAFETY: `addr` was validated against the process size,
                // and the user half of the active address space maps it.
                unsafe { core::ptr::write_unaligned(addr as *mut crate::stat::Stat, st) };
                Ok(())
            }
            _ => Err(()),
        }
    }

    /// Reads up to `n` bytes into `addr`, advancing the offset by the bytes
    /// actually transferred.
    pub fn read(&self, addr: usize, n: usize) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(addr, n),
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock();
                if guard.typ == T_DEV {
                    // Release the inode while waiting on the device, so a
                    // blocked console read doesn't lock out writers of the
                    // same device file.
                    let major = guard.major;
                    drop(guard);
                    let read = kernel().devsw(major).and_then(|d| d.read).ok_or(())?;
                    return read(addr, n);
                }
                // SAFETY: the inode lock is held.
                let cur = unsafe { *off.get() };
                let r = guard.read(addr, cur, n as u32)?;
                // SAFETY: the inode lock is held.
                unsafe { *off.get() = cur + r as u32 };
                Ok(r)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Writes `n` bytes from `addr`, advancing the offset. Inode writes are
    /// chunked into several transactions so one write cannot overflow the
    /// log.
    pub fn write(&self, addr: usize, n: usize) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(addr, n),
            FileType::Inode { ip, off } => {
                {
                    let guard = ip.lock();
                    if guard.typ == T_DEV {
                        let major = guard.major;
                        drop(guard);
                        let write = kernel().devsw(major).and_then(|d| d.write).ok_or(())?;
                        return write(addr, n);
                    }
                }

                // Write a few blocks at a time to avoid exceeding the
                // maximum log transaction size, including inode, indirect
                // block, allocation blocks, and 2 blocks of slop for
                // non-aligned writes.
                let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
                let fs = &kernel().file_system;
                let mut i = 0;
                while i < n {
                    let n1 = (n - i).min(max);
                    fs.begin_op();
                    let mut guard = ip.lock();
                    // SAFETY: the inode lock is held.
                    let cur = unsafe { *off.get() };
                    let r = guard.write(addr + i, cur, n1 as u32);
                    if let Ok(r) = r {
                        // SAFETY: the inode lock is held.
                        unsafe { *off.get() = cur + r as u32 };
                    }
                    drop(guard);
                    fs.end_op();

                    let r = r?;
                    if r != n1 {
                        panic!("short File::write");
                    }
                    i += r;
                }
                Ok(n)
            }
            FileType::None => panic!("File::write"),
        }
    }
}

impl ArenaObject for File {
    /// Runs when the last descriptor for this file closes: releases the
    /// backing object. Closing an inode file drops an inode reference,
    /// which must happen inside a transaction; the pause releases the file
    /// table lock around it.
    fn finalize<P: Pause>(&mut self, pause: &mut P) {
        let typ = mem::replace(&mut self.typ, FileType::None);
        let writable = self.writable;
        pause.pause(move || match typ {
            FileType::Pipe { pipe } => pipe.close(writable),
            FileType::Inode { ip, .. } => {
                let fs = &kernel().file_system;
                fs.begin_op();
                drop(ip);
                fs.end_op();
            }
            FileType::None => {}
        });
    }
}

/// The system-wide table of open files.
pub type FileTable = SpinLock<ArrayArena<File, NFILE>>;

pub const fn new_ftable() -> FileTable {
    new_spinlock(
        "ftable",
        ArrayArena::from_cells(array![_ => RcCell::new(File::zero()); NFILE]),
    )
}

/// A reference-counted handle to an open file.
pub type RcFile = ArenaRc<FileTable>;

/// Operations on the file table. (An extension trait: `FileTable` is an
/// alias of the generic arena lock.)
pub trait FileTableExt {
    /// Allocates a file object with a reference count of one.
    fn alloc_file(&self, typ: FileType, readable: bool, writable: bool) -> Result<RcFile, ()>;
}

impl FileTableExt for FileTable {
    fn alloc_file(&self, typ: FileType, readable: bool, writable: bool) -> Result<RcFile, ()> {
        self.alloc(|f| {
            f.typ = typ;
            f.readable = readable;
            f.writable = writable;
        })
        .ok_or(())
    }
}

/// Allocates a file descriptor in the current process for `f`. Returns the
/// file on failure so the caller can unwind.
pub fn fdalloc(f: RcFile) -> Result<usize, RcFile> {
    let p = myproc().expect("fdalloc");
    // SAFETY: we are the current process.
    let data = unsafe { p.data_mut() };
    for (fd, slot) in data.open_files.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(f);
            return Ok(fd);
        }
    }
    Err(f)
}

/// A device's read/write entry points in the switch table.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(usize, usize) -> Result<usize, ()>>,
    pub write: Option<fn(usize, usize) -> Result<usize, ()>>,
}

impl Devsw {
    pub const fn zero() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

/// Major device number of the console.
pub const CONSOLE: i16 = 1;

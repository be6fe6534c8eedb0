//! Inodes: the on-disk structure, the in-memory cache, and the operations
//! on locked inodes.
//!
//! An inode describes a single unnamed file: its type, size, link count,
//! and the list of blocks holding its content.
//!
//! The inodes are laid out sequentially on disk at `sb.inodestart`. The
//! kernel keeps a cache of in-use inodes in memory to provide a place for
//! synchronizing access to inodes used by multiple processes. The cached
//! inodes include book-keeping information that is not stored on disk: the
//! reference count (in the arena slot) and `valid`.
//!
//! States of an inode and its in-memory representation:
//!
//! * Allocation: an inode is allocated if its type (on disk) is non-zero.
//!   `Itable::alloc_inode` allocates; dropping the last reference to an
//!   inode whose link count is zero frees it on disk.
//! * Referencing in cache: `Itable::get` finds or creates a cache entry;
//!   the entry is freed when the last `RcInode` drops.
//! * Valid: the information in a cache entry is only correct when `valid`
//!   is true. `RcInode::lock` reads the inode from disk and sets `valid`.
//! * Locked: file system code may only examine and modify an inode's
//!   metadata and content while holding its sleep-lock, i.e., through an
//!   `InodeGuard`.
//!
//! `lock` is separate from `get` so that system calls can hold a long-term
//! reference to an inode (as an open file or cwd) and only lock it for
//! short periods (e.g., in read()). The separation also helps avoid
//! deadlock during pathname lookup.
//!
//! Every change to an inode that lives on disk is written back with
//! `InodeGuard::update` inside the caller's transaction; dropping the last
//! reference to an unlinked inode must therefore also happen inside a
//! transaction.

use core::mem;
use core::ops::{Deref, DerefMut};

use array_macro::array;
use xr6_kernel_lib::arena::{Arena, ArenaObject, ArenaRc, ArrayArena};
use xr6_kernel_lib::lock::Pause;
use xr6_kernel_lib::rc_cell::RcCell;

use super::superblock::IPB;
use super::{balloc, bfree, Dirent, FileName, DIRENT_SIZE};
use crate::bio::bread;
use crate::kernel::kernel;
use crate::lock::{new_sleeplock, new_spinlock, SleepLock, SpinLock};
use crate::param::{BSIZE, NINODE};
use crate::stat::{Stat, T_DEV, T_DIR};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Direct block pointers per inode.
pub const NDIRECT: usize = 12;

/// Block pointers in the indirect block.
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// Maximum file size in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// On-disk inode structure.
#[derive(Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Dinode {
    /// File type.
    pub typ: i16,

    /// Major device number (T_DEV only).
    pub major: i16,

    /// Minor device number (T_DEV only).
    pub minor: i16,

    /// Number of links to inode in file system.
    pub nlink: i16,

    /// Size of file (bytes).
    pub size: u32,

    /// Data block addresses: NDIRECT direct slots plus one indirect block.
    pub addrs: [u32; NDIRECT + 1],
}

/// In-memory copy of the disk inode, plus the `valid` flag. Protected by
/// the inode's sleep-lock.
pub struct InodeInner {
    /// Inode has been read from disk?
    pub valid: bool,

    pub typ: i16,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

/// In-memory inode.
pub struct Inode {
    /// Device number. Stable while any reference exists.
    pub dev: u32,

    /// Inode number.
    pub inum: u32,

    pub inner: SleepLock<InodeInner>,
}

impl Inode {
    pub const fn zero() -> Self {
        Self {
            dev: 0,
            inum: 0,
            inner: new_sleeplock(
                "inode",
                InodeInner {
                    valid: false,
                    typ: 0,
                    major: 0,
                    minor: 0,
                    nlink: 0,
                    size: 0,
                    addrs: [0; NDIRECT + 1],
                },
            ),
        }
    }

    /// Locks the inode, reading it in from disk if necessary.
    pub fn lock(&self) -> InodeGuard<'_> {
        // SAFETY: paired with the release in `InodeGuard::drop`.
        unsafe { self.inner.acquire() };
        let mut guard = InodeGuard { inode: self };
        if !guard.valid {
            let bp = bread(self.dev, kernel().file_system.superblock().iblock(self.inum));
            let off = (self.inum as usize % IPB) * mem::size_of::<Dinode>();
            let dip = Dinode::read_from_prefix(&bp.deref_inner().bytes()[off..]).unwrap();
            guard.typ = dip.typ;
            guard.major = dip.major;
            guard.minor = dip.minor;
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addrs = dip.addrs;
            drop(bp);
            guard.valid = true;
            assert_ne!(guard.typ, 0, "ilock: no type");
        }
        guard
    }
}

impl ArenaObject for Inode {
    /// Runs when the last in-memory reference goes away. If the on-disk
    /// inode has no links either, the contents are freed here; the caller
    /// dropping the last reference must be inside a transaction.
    fn finalize<P: Pause>(&mut self, pause: &mut P) {
        let inner = self.inner.get_mut();
        if inner.valid && inner.nlink == 0 {
            // The inode has no links and no other references: truncate and
            // free. With a reference count of one, no other process can
            // have the inode locked, so this sleep-lock acquisition will
            // not block. Disk I/O must not happen under the cache spinlock,
            // so the finalizer pauses it.
            let ptr = self as *const Inode;
            pause.pause(|| {
                // SAFETY: the slot stays unreachable while it is being
                // finalized (its count is still one).
                let ip = unsafe { &*ptr };
                let mut guard = ip.lock();
                guard.trunc();
                guard.typ = 0;
                guard.update();
                guard.valid = false;
            });
        }
    }
}

/// The inode cache.
pub type Itable = SpinLock<ArrayArena<Inode, NINODE>>;

pub const fn new_itable() -> Itable {
    new_spinlock(
        "icache",
        ArrayArena::from_cells(array![_ => RcCell::new(Inode::zero()); NINODE]),
    )
}

/// A long-term reference to a cached inode: keeps the slot alive, does not
/// hold the lock, and does not imply the contents were read.
pub type RcInode = ArenaRc<Itable>;

/// Operations on the inode cache. (An extension trait: `Itable` is an alias
/// of the generic arena lock.)
pub trait ItableExt {
    /// Finds the inode with number `inum` on device `dev` and returns an
    /// in-memory reference to it. Does not lock the inode and does not read
    /// it from disk.
    fn get(&self, dev: u32, inum: u32) -> RcInode;

    /// Allocates a fresh inode of the given type on device `dev`.
    fn alloc_inode(&self, dev: u32, typ: i16) -> RcInode;
}

impl ItableExt for Itable {
    fn get(&self, dev: u32, inum: u32) -> RcInode {
        self.find_or_alloc(
            |ip| ip.dev == dev && ip.inum == inum,
            |ip| {
                ip.dev = dev;
                ip.inum = inum;
                ip.inner.get_mut().valid = false;
            },
        )
        .expect("iget: no inodes")
    }

    fn alloc_inode(&self, dev: u32, typ: i16) -> RcInode {
        let sb = kernel().file_system.superblock();
        for inum in 1..sb.ninodes {
            let mut bp = bread(dev, sb.iblock(inum));
            let off = (inum as usize % IPB) * mem::size_of::<Dinode>();
            let dip =
                Dinode::mut_from_prefix(&mut bp.deref_mut_inner().bytes_mut()[off..]).unwrap();
            if dip.typ == 0 {
                // A free inode: claim it.
                *dip = Dinode::new_zeroed();
                dip.typ = typ;
                // Mark it allocated on the disk.
                kernel().file_system.log_write(&mut bp);
                drop(bp);
                return self.get(dev, inum);
            }
        }
        panic!("ialloc: no inodes");
    }
}

/// A locked inode: proof that the sleep-lock is held and `valid` is set
/// (when locked through `Inode::lock`).
pub struct InodeGuard<'a> {
    pub inode: &'a Inode,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        // SAFETY: we hold the inode's sleep-lock.
        unsafe { &*self.inode.inner.get_mut_raw() }
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: we hold the inode's sleep-lock; `&mut self` is exclusive.
        unsafe { &mut *self.inode.inner.get_mut_raw() }
    }
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: paired with the acquire in `Inode::lock`.
        unsafe { self.inode.inner.unlock() };
    }
}

impl InodeGuard<'_> {
    pub fn dev(&self) -> u32 {
        self.inode.dev
    }

    pub fn inum(&self) -> u32 {
        self.inode.inum
    }

    /// Copies a modified in-memory inode to disk (inside the caller's
    /// transaction). Must be called after every change to a field that
    /// lives on disk, since the cache is write-through.
    pub fn update(&self) {
        let fs = &kernel().file_system;
        let mut bp = bread(self.dev(), fs.superblock().iblock(self.inum()));
        let off = (self.inum() as usize % IPB) * mem::size_of::<Dinode>();
        let dip = Dinode::mut_from_prefix(&mut bp.deref_mut_inner().bytes_mut()[off..]).unwrap();
        dip.typ = self.typ;
        dip.major = self.major;
        dip.minor = self.minor;
        dip.nlink = self.nlink;
        dip.size = self.size;
        dip.addrs = self.addrs;
        fs.log_write(&mut bp);
    }

    /// Truncates the inode: discards all content blocks. Only called when
    /// the inode has no links and no other in-memory references.
    pub fn trunc(&mut self) {
        let dev = self.dev();
        for addr in self.addrs[..NDIRECT].iter_mut() {
            if *addr != 0 {
                bfree(dev, *addr);
                *addr = 0;
            }
        }

        if self.addrs[NDIRECT] != 0 {
            let bp = bread(dev, self.addrs[NDIRECT]);
            for j in 0..NINDIRECT {
                // SAFETY: block data is 4-byte aligned and BSIZE long.
                let a = unsafe {
                    *(bp.deref_inner().bytes().as_ptr() as *const u32).add(j)
                };
                if a != 0 {
                    bfree(dev, a);
                }
            }
            drop(bp);
            bfree(dev, self.addrs[NDIRECT]);
            self.addrs[NDIRECT] = 0;
        }

        self.size = 0;
        self.update();
    }

    /// Returns the disk block backing file block `bn`, allocating it (and
    /// the indirect block) on demand.
    fn bmap(&mut self, bn: usize) -> u32 {
        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = balloc(self.dev());
                self.addrs[bn] = addr;
            }
            return addr;
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");

        // Load the indirect block, allocating if necessary.
        let mut addr = self.addrs[NDIRECT];
        if addr == 0 {
            addr = balloc(self.dev());
            self.addrs[NDIRECT] = addr;
        }
        let mut bp = bread(self.dev(), addr);
        // SAFETY: block data is 4-byte aligned and BSIZE long.
        let a = unsafe { (bp.deref_mut_inner().bytes_mut().as_mut_ptr() as *mut u32).add(bn) };
        // SAFETY: `a` points inside the locked buffer.
        let mut addr = unsafe { *a };
        if addr == 0 {
            addr = balloc(self.dev());
            // SAFETY: `a` points inside the locked buffer.
            unsafe { *a = addr };
            kernel().file_system.log_write(&mut bp);
        }
        addr
    }

    /// Copies stat information from the inode.
    pub fn stat(&self) -> Stat {
        Stat {
            typ: self.typ,
            dev: self.dev() as i32,
            ino: self.inum(),
            nlink: self.nlink,
            size: self.size,
        }
    }

    /// Reads up to `n` bytes starting at byte offset `off` into memory at
    /// `dst` (a kernel address, or a user address in the active address
    /// space). Device inodes are dispatched by the file layer, which drops
    /// the inode lock around the device wait.
    pub fn read(&mut self, dst: usize, off: u32, n: u32) -> Result<usize, ()> {
        if off > self.size || off.checked_add(n).is_none() {
            return Err(());
        }
        let n = n.min(self.size - off);

        let mut tot: u32 = 0;
        let mut off = off;
        let mut dst = dst;
        while tot < n {
            let bp = bread(self.dev(), self.bmap(off as usize / BSIZE));
            let begin = off as usize % BSIZE;
            let m = (n - tot).min((BSIZE - begin) as u32);
            // SAFETY: `dst` was validated by the system-call layer (or is a
            // kernel buffer of sufficient size).
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bp.deref_inner().bytes().as_ptr().add(begin),
                    dst as *mut u8,
                    m as usize,
                );
            }
            tot += m;
            off += m;
            dst += m as usize;
        }
        Ok(n as usize)
    }

    /// Reads into a kernel byte buffer; returns the bytes actually read.
    pub fn read_bytes(&mut self, dst: &mut [u8], off: u32) -> Result<usize, ()> {
        self.read(dst.as_mut_ptr() as usize, off, dst.len() as u32)
    }

    /// Writes `n` bytes from `src` starting at byte offset `off`. May grow
    /// the file, up to MAXFILE blocks. Device inodes are dispatched by the
    /// file layer, which drops the inode lock around the device wait.
    pub fn write(&mut self, src: usize, off: u32, n: u32) -> Result<usize, ()> {
        if off > self.size || off.checked_add(n).is_none() {
            return Err(());
        }
        if (off + n) as usize > MAXFILE * BSIZE {
            return Err(());
        }

        let fs = &kernel().file_system;
        let mut tot: u32 = 0;
        let mut off = off;
        let mut src = src;
        while tot < n {
            let mut bp = bread(self.dev(), self.bmap(off as usize / BSIZE));
            let begin = off as usize % BSIZE;
            let m = (n - tot).min((BSIZE - begin) as u32);
            // SAFETY: `src` was validated by the system-call layer (or is a
            // kernel buffer of sufficient size).
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src as *const u8,
                    bp.deref_mut_inner().bytes_mut().as_mut_ptr().add(begin),
                    m as usize,
                );
            }
            fs.log_write(&mut bp);
            tot += m;
            off += m;
            src += m as usize;
        }

        if n > 0 {
            if off > self.size {
                self.size = off;
            }
            // Write the inode back even if the size didn't change, because
            // bmap() may have added a new block to addrs[].
            self.update();
        }
        Ok(n as usize)
    }

    /// Writes a kernel byte buffer; returns the bytes actually written.
    pub fn write_bytes(&mut self, src: &[u8], off: u32) -> Result<usize, ()> {
        self.write(src.as_ptr() as usize, off, src.len() as u32)
    }

    /// Looks for a directory entry by name. If found, returns the entry's
    /// inode and the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(RcInode, u32), ()> {
        assert_eq!(self.typ, T_DIR, "dirlookup not DIR");

        for off in (0..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::new_zeroed();
            let read = self.read_bytes(de.as_bytes_mut(), off);
            assert_eq!(read, Ok(DIRENT_SIZE), "dirlookup read");
            if de.inum != 0 && de.name() == *name {
                // Entry matches path element.
                let dev = self.dev();
                return Ok((kernel().file_system.itable.get(dev, de.inum as u32), off));
            }
        }
        Err(())
    }

    /// Writes a new directory entry (name, inum) into this directory.
    /// Fails if `name` is already present.
    pub fn dirlink(&mut self, name: &FileName, inum: u32) -> Result<(), ()> {
        // Check that the name is not present.
        if let Ok((_ip, _off)) = self.dirlookup(name) {
            // The returned inode reference drops here; the caller holds a
            // transaction, as dirlink requires.
            return Err(());
        }

        // Look for an empty Dirent.
        let mut de = Dirent::new_zeroed();
        let mut off = 0;
        while off < self.size {
            let read = self.read_bytes(de.as_bytes_mut(), off);
            assert_eq!(read, Ok(DIRENT_SIZE), "dirlink read");
            if de.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        de.inum = inum as u16;
        de.set_name(name);
        let written = self.write_bytes(de.as_bytes(), off);
        assert_eq!(written, Ok(DIRENT_SIZE), "dirlink");
        Ok(())
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = Dirent::new_zeroed();
        for off in ((2 * DIRENT_SIZE as u32)..self.size).step_by(DIRENT_SIZE) {
            let read = self.read_bytes(de.as_bytes_mut(), off);
            assert_eq!(read, Ok(DIRENT_SIZE), "is_dir_empty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

/// Lets a long-term inode reference acquire the sleep-lock.
pub trait RcInodeExt {
    fn lock(&self) -> InodeGuard<'_>;
}

impl RcInodeExt for RcInode {
    fn lock(&self) -> InodeGuard<'_> {
        Inode::lock(self)
    }
}

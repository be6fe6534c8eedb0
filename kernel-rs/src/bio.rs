//! The buffer cache: a pool of cached copies of disk blocks, kept in
//! most-recently-used order.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `bread`.
//! * After changing buffer data, call `bwrite` to write it to disk.
//! * When done with the buffer, drop it (brelse).
//! * Do not keep buffers longer than necessary.
//!
//! A locked buffer (`Buf`) holds the block's sleep-lock, so only one
//! process at a time uses a given block. A block whose `dirty` flag is set
//! is pinned: it carries a change the log has not installed yet, and the
//! cache will not recycle it.

use core::cell::Cell;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use xr6_kernel_lib::arena::{Arena, ArenaObject, ArenaRc, MruArena, MruEntry};
use xr6_kernel_lib::lock::Pause;

use crate::kernel::kernel;
use crate::lock::{new_sleeplock, new_spinlock, SleepLock, SpinLock};
use crate::param::{BSIZE, NBUF};
use crate::proc::WaitChannel;

/// The contents of one disk block. 4-byte aligned so the IDE driver can
/// move it with dword string instructions.
#[repr(C, align(4))]
pub struct BufData {
    inner: [u8; BSIZE],
}

impl BufData {
    pub fn bytes(&self) -> &[u8; BSIZE] {
        &self.inner
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.inner
    }
}

pub struct BufEntry {
    /// Device and block number; set when the slot is (re)targeted, stable
    /// while any reference exists.
    pub(crate) dev: u32,
    pub(crate) blockno: u32,

    /// Data has been read from disk.
    pub(crate) valid: AtomicBool,

    /// Data needs to be written to disk; pins the buffer in the cache.
    pub(crate) dirty: AtomicBool,

    /// Next buffer in the IDE request queue. Guarded by the IDE lock.
    pub(crate) qnext: Cell<*const BufEntry>,

    /// Signalled by the disk interrupt when this buffer's request is done.
    pub(crate) io_wait: WaitChannel,

    /// The block contents, under the buffer's sleep-lock.
    pub(crate) inner: SleepLock<BufData>,
}

// SAFETY: `qnext` is only accessed under the IDE queue lock.
unsafe impl Sync for BufEntry {}
unsafe impl Send for BufEntry {}

impl BufEntry {
    pub const fn zero() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            qnext: Cell::new(ptr::null()),
            io_wait: WaitChannel::new(),
            inner: new_sleeplock("buffer", BufData { inner: [0; BSIZE] }),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

impl ArenaObject for BufEntry {
    fn finalize<P: Pause>(&mut self, _pause: &mut P) {
        // A buffer carries no owned resources; the data stays cached.
    }

    fn evictable(&self) -> bool {
        // A dirty buffer holds a change the log has not installed yet.
        !self.dirty()
    }
}

pub type Bcache = SpinLock<MruArena<BufEntry, NBUF>>;

/// Returns a new buffer cache; `binit` links its MRU list at boot.
pub const fn new_bcache() -> Bcache {
    new_spinlock(
        "bcache",
        MruArena::from_entries(array![_ => MruEntry::new(BufEntry::zero()); NBUF]),
    )
}

/// A reference to a cached block whose sleep-lock is not held.
pub type BufUnlocked = ArenaRc<Bcache>;

/// A reference to a cached block whose sleep-lock is held: exclusive access
/// to the block's data.
pub struct Buf {
    inner: ManuallyDrop<BufUnlocked>,
}

impl Buf {
    pub fn deref_inner(&self) -> &BufData {
        // SAFETY: we hold the buffer's sleep-lock.
        unsafe { &*self.inner.inner.get_mut_raw() }
    }

    pub fn deref_mut_inner(&mut self) -> &mut BufData {
        // SAFETY: we hold the buffer's sleep-lock, and `&mut self` is
        // exclusive.
        unsafe { &mut *self.inner.inner.get_mut_raw() }
    }

    pub fn set_dirty(&self, v: bool) {
        self.inner.dirty.store(v, Ordering::Release);
    }
}

impl Deref for Buf {
    type Target = BufEntry;

    fn deref(&self) -> &BufEntry {
        &self.inner
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // SAFETY: we hold the sleep-lock; dropping the inner reference
        // afterwards releases the cache slot (brelse).
        unsafe {
            self.inner.inner.unlock();
            ManuallyDrop::drop(&mut self.inner);
        }
    }
}

/// Lets an unlocked buffer reference acquire its sleep-lock. (An extension
/// trait: `BufUnlocked` is an alias of the generic arena handle.)
pub trait BufUnlockedExt {
    fn lock(self) -> Buf;
}

impl BufUnlockedExt for BufUnlocked {
    /// Acquires the buffer's sleep-lock.
    fn lock(self) -> Buf {
        // SAFETY: paired with the release in `Buf::drop`/`Buf::unlock`.
        unsafe { self.inner.acquire() };
        Buf {
            inner: ManuallyDrop::new(self),
        }
    }
}

/// Links the buffer cache's MRU list. Called once at boot.
pub fn binit() {
    kernel().bcache.lock().init();
}

/// Looks through the cache for block `blockno` on device `dev`; if absent,
/// recycles the least recently used unpinned buffer. Either way, returns a
/// locked buffer. Running out of buffers means the sizing contract was
/// violated, which is fatal.
fn bget(dev: u32, blockno: u32) -> Buf {
    let entry = kernel()
        .bcache
        .find_or_alloc(
            |b| b.dev == dev && b.blockno == blockno,
            |b| {
                b.dev = dev;
                b.blockno = blockno;
                *b.valid.get_mut() = false;
            },
        )
        .expect("bget: no buffers");
    entry.lock()
}

/// Returns a locked buffer with the contents of the indicated block.
pub fn bread(dev: u32, blockno: u32) -> Buf {
    let mut b = bget(dev, blockno);
    if !b.valid() {
        kernel().ide.rw(&mut b);
    }
    b
}

/// Writes the buffer's contents to disk. The caller holds the buffer's
/// sleep-lock (it owns a `Buf`).
pub fn bwrite(b: &mut Buf) {
    b.set_dirty(true);
    kernel().ide.rw(b);
}

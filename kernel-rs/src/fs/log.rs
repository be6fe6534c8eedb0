//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls. The
//! logging system only commits when there are no FS system calls active.
//! Thus there is never any reasoning required about whether a commit might
//! write an uncommitted system call's updates to disk.
//!
//! A system call should call begin_op()/end_op() to mark its start and end.
//! Usually begin_op() just increments the count of in-progress FS system
//! calls and returns. But if it thinks the log is close to running out, it
//! sleeps until the last outstanding end_op() commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::{bread, bwrite, Buf};
use crate::lock::SleepableLock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

/// Contents of the header block, used for the on-disk header block.
#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

// The header must fit in the first log block.
const_assert!(core::mem::size_of::<LogHeader>() < BSIZE);

pub struct Log {
    dev: u32,

    /// First block of the on-disk log (the header block).
    start: u32,

    /// Number of log blocks, including the header.
    size: u32,

    /// How many FS system calls are executing?
    outstanding: u32,

    /// In commit(); please wait.
    committing: bool,

    /// The staged header: block numbers to be installed by the next commit.
    lh: ArrayVec<u32, LOGSIZE>,
}

impl Log {
    pub const fn zero() -> Self {
        Self {
            dev: 0,
            start: 0,
            size: 0,
            outstanding: 0,
            committing: false,
            lh: ArrayVec::new_const(),
        }
    }

    /// Sets the on-disk location and recovers any committed transaction.
    /// Called once at mount, from the first process (recovery reads the
    /// disk, so it cannot run before the scheduler).
    pub fn init(&mut self, dev: u32, start: u32, size: u32) {
        self.dev = dev;
        self.start = start;
        self.size = size;
        self.recover();
    }

    /// Reads the on-disk log header into the staged header.
    fn read_head(&mut self) {
        let buf = bread(self.dev, self.start);
        let lh = LogHeader::read_from_prefix(buf.deref_inner().bytes()).unwrap();
        self.lh.clear();
        for &b in &lh.block[..lh.n as usize] {
            self.lh.push(b);
        }
    }

    /// Writes the staged header to disk. This is the true point at which
    /// the current transaction commits: a crash before this write yields
    /// no change; a crash after it yields all changes.
    fn write_head(&mut self) {
        let mut buf = bread(self.dev, self.start);
        let mut hb = LogHeader::new_zeroed();
        hb.n = self.lh.len() as u32;
        hb.block[..self.lh.len()].copy_from_slice(&self.lh);
        hb.write_to_prefix(buf.deref_mut_inner().bytes_mut()).unwrap();
        bwrite(&mut buf);
    }

    /// Copies committed blocks from the log to their home locations. The
    /// destination is always the target block's own buffer; block numbers
    /// are never retargeted.
    fn install_trans(&mut self) {
        for (tail, blockno) in self.lh.drain(..).enumerate() {
            // Read log block.
            let lbuf = bread(self.dev, self.start + tail as u32 + 1);
            // Read dst.
            let mut dbuf = bread(self.dev, blockno);
            // Copy block to dst.
            dbuf.deref_mut_inner()
                .bytes_mut()
                .copy_from_slice(lbuf.deref_inner().bytes());
            // Write dst to disk; its dirty pin is cleared on completion.
            bwrite(&mut dbuf);
        }
    }

    /// Replays a committed but uninstalled transaction, if any. Idempotent:
    /// installing absorbs repeated runs, and the header clear is atomic.
    fn recover(&mut self) {
        self.read_head();
        self.install_trans();
        // Clear the log.
        self.write_head();
    }

    /// Copies modified blocks from the cache into the on-disk log area.
    fn write_log(&mut self) {
        for (tail, &blockno) in self.lh.iter().enumerate() {
            // The log block, at its own block number.
            let mut to = bread(self.dev, self.start + tail as u32 + 1);
            // The cache block holding the pending change.
            let from = bread(self.dev, blockno);
            to.deref_mut_inner()
                .bytes_mut()
                .copy_from_slice(from.deref_inner().bytes());
            bwrite(&mut to);
        }
    }

    fn commit(&mut self) {
        if !self.lh.is_empty() {
            // Write modified blocks from cache to log.
            self.write_log();
            // Write header to disk -- the real commit.
            self.write_head();
            // Now install writes to home locations.
            self.install_trans();
            // Erase the transaction from the log.
            self.write_head();
        }
    }
}

/// Called at the start of each FS system call. Blocks while a commit is in
/// progress, or while this operation could exhaust the log space if every
/// outstanding operation wrote its full MAXOPBLOCKS reservation.
pub fn begin_op(this: &SleepableLock<Log>) {
    let mut guard = this.lock();
    loop {
        if guard.committing
            || guard.lh.len() + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
        {
            guard.sleep();
        } else {
            guard.outstanding += 1;
            break;
        }
    }
}

/// Called at the end of each FS system call; commits if this was the last
/// outstanding operation.
pub fn end_op(this: &SleepableLock<Log>) {
    let mut guard = this.lock();
    assert!(guard.outstanding >= 1, "end_op");
    guard.outstanding -= 1;
    assert!(!guard.committing, "end_op: committing");

    let do_commit = if guard.outstanding == 0 {
        guard.committing = true;
        true
    } else {
        // begin_op() may be waiting for log space, and decrementing
        // `outstanding` has decreased the amount of reserved space.
        guard.wakeup();
        false
    };
    drop(guard);

    if do_commit {
        // Call commit without holding any lock, since commit sleeps on
        // disk I/O. The `committing` flag keeps everyone else out.
        // SAFETY: `committing` is set, so no other thread touches the log.
        unsafe { (*this.get_mut_raw()).commit() };
        let mut guard = this.lock();
        guard.committing = false;
        guard.wakeup();
    }
}

/// Records that `b` belongs to the current transaction and pins it in the
/// cache. The caller has modified b's data and is done with the buffer;
/// commit()/write_log() will do the disk write.
///
/// log_write() replaces bwrite(); a typical use is:
///   let mut b = bread(...);
///   // modify b's data
///   log_write(&log, &mut b);
pub fn log_write(this: &SleepableLock<Log>, b: &mut Buf) {
    let mut guard = this.lock();
    assert!(
        guard.lh.len() < LOGSIZE && (guard.lh.len() as u32) < guard.size - 1,
        "too big a transaction"
    );
    assert!(guard.outstanding >= 1, "log_write outside of trans");

    // Log absorption: repeated writes of one block in a transaction take a
    // single log slot.
    if !guard.lh.iter().any(|&bn| bn == b.blockno()) {
        guard.lh.push(b.blockno());
    }
    // Pin the block in the cache until the commit installs it.
    b.set_dirty(true);
}

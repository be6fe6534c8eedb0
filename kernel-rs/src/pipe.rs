//! Pipes: a bounded in-memory byte FIFO between processes, living in one
//! page frame.

use core::ops::Deref;
use core::ptr::NonNull;

use crate::file::{FileTableExt, FileType, RcFile};
use crate::kernel::kernel;
use crate::lock::{new_spinlock, SpinLock};
use crate::page::Page;
use crate::proc::{myproc, WaitChannel};

const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read (an unbounded counter, used modulo PIPESIZE).
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,

    /// Signalled when there are unread bytes in `data`.
    read_waitchannel: WaitChannel,

    /// Signalled when bytes have been consumed from a full `data`.
    write_waitchannel: WaitChannel,
}

impl Pipe {
    /// Reads up to `n` bytes into the user address `addr` (validated by the
    /// system-call layer). Blocks while the pipe is empty and the write end
    /// is open; at end-of-file returns the bytes read so far.
    pub fn read(&self, addr: usize, n: usize) -> Result<usize, ()> {
        let p = myproc().expect("pipe read");
        let mut inner = self.inner.lock();

        while inner.nread == inner.nwrite && inner.writeopen {
            if p.killed() {
                return Err(());
            }
            self.read_waitchannel.sleep(&mut inner);
        }

        let mut i = 0;
        while i < n {
            if inner.nread == inner.nwrite {
                break;
            }
            let ch = inner.data[inner.nread as usize % PIPESIZE];
            inner.nread = inner.nread.wrapping_add(1);
            // SAFETY: `addr..addr + n` was validated against the process
            // size, and the active address space maps it.
            unsafe { *((addr + i) as *mut u8) = ch };
            i += 1;
        }

        self.write_waitchannel.wakeup();
        Ok(i)
    }

    /// Writes `n` bytes from the user address `addr`. Blocks while the pipe
    /// is full and the read end is open; fails if the read end closes or
    /// the writer is killed.
    pub fn write(&self, addr: usize, n: usize) -> Result<usize, ()> {
        let p = myproc().expect("pipe write");
        let mut inner = self.inner.lock();

        let mut i = 0;
        while i < n {
            while inner.nwrite == inner.nread.wrapping_add(PIPESIZE as u32) {
                if !inner.readopen || p.killed() {
                    return Err(());
                }
                self.read_waitchannel.wakeup();
                self.write_waitchannel.sleep(&mut inner);
            }
            // SAFETY: see `read`.
            let ch = unsafe { *((addr + i) as *const u8) };
            let slot = inner.nwrite as usize % PIPESIZE;
            inner.data[slot] = ch;
            inner.nwrite = inner.nwrite.wrapping_add(1);
            i += 1;
        }

        self.read_waitchannel.wakeup();
        Ok(n)
    }

    /// Closes one side. Returns true when both sides are closed and the
    /// pipe should be freed.
    fn close(&self, writable: bool) -> bool {
        let mut inner = self.inner.lock();

        if writable {
            inner.writeopen = false;
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup();
        }

        !inner.readopen && !inner.writeopen
    }
}

/// An owning pointer to a `Pipe` stored in a page frame.
///
/// # Safety
///
/// `ptr` always refers to a live `Pipe` in a page allocated from the frame
/// allocator. There is exactly one read-only and one write-only
/// `AllocatedPipe` per pipe; the `readopen`/`writeopen` flags record which
/// are still open, so the page is freed exactly once, after both closes.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

// SAFETY: access to the pipe goes through its spinlock.
unsafe impl Send for AllocatedPipe {}
unsafe impl Sync for AllocatedPipe {}

impl Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Self::Target {
        // SAFETY: `ptr` refers to a live `Pipe` (struct invariant).
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Allocates a pipe and the two file objects for its ends (read end
    /// first). Unwinds on any failure.
    pub fn alloc() -> Result<(RcFile, RcFile), ()> {
        let mut page = kernel().kmem.alloc().ok_or(())?;
        let ptr = NonNull::from(page.as_uninit_mut::<Pipe>().write(Pipe {
            inner: new_spinlock(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            read_waitchannel: WaitChannel::new(),
            write_waitchannel: WaitChannel::new(),
        }));
        let addr = page.into_usize();

        let f0 = kernel().ftable.alloc_file(
            FileType::Pipe {
                pipe: AllocatedPipe { ptr },
            },
            true,
            false,
        );
        let f0 = match f0 {
            Ok(f0) => f0,
            Err(()) => {
                // SAFETY: the page is ours again; nothing refers to it.
                kernel().kmem.free(unsafe { Page::from_usize(addr) });
                return Err(());
            }
        };
        let f1 = kernel().ftable.alloc_file(
            FileType::Pipe {
                pipe: AllocatedPipe { ptr },
            },
            false,
            true,
        );
        let f1 = match f1 {
            Ok(f1) => f1,
            Err(()) => {
                // The write side never became a file; record it closed so
                // the read side's close below frees the page.
                AllocatedPipe { ptr }.close(true);
                drop(f0);
                return Err(());
            }
        };

        Ok((f0, f1))
    }

    /// Closes this end; frees the pipe's page when both ends are closed.
    pub fn close(self, writable: bool) {
        if self.deref().close(writable) {
            // SAFETY: both ends are closed, so no references remain; the
            // pipe lives in a page from the frame allocator.
            kernel()
                .kmem
                .free(unsafe { Page::from_usize(self.ptr.as_ptr() as usize) });
        }
    }
}

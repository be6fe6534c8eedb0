//! Simple PIO-based (non-DMA) IDE driver.
//!
//! Requests are queued FIFO per controller; the queue head is the active
//! request. The requesting process sleeps on its buffer until the
//! completion interrupt marks the buffer valid/clean and wakes it.

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::bio::{Buf, BufEntry};
use crate::kernel::kernel;
use crate::lock::{new_spinlock, SpinLock};
use crate::param::BSIZE;
use crate::println;
use crate::x86::{inb, insl, outb, outsl};

const SECTOR_SIZE: usize = 512;
const IDE_BSY: u8 = 0x80;
const IDE_DRDY: u8 = 0x40;
const IDE_DF: u8 = 0x20;
const IDE_ERR: u8 = 0x01;

const IDE_CMD_READ: u8 = 0x20;
const IDE_CMD_WRITE: u8 = 0x30;
const IDE_CMD_RDMUL: u8 = 0xC4;
const IDE_CMD_WRMUL: u8 = 0xC5;

const SECTORS_PER_BLOCK: usize = BSIZE / SECTOR_SIZE;

/// The request queue: a singly-linked list of buffers threaded through
/// `BufEntry::qnext`. The head is the request the controller is working on.
struct IdeQueue {
    head: *const BufEntry,
}

// SAFETY: only reachable through the IDE lock.
unsafe impl Send for IdeQueue {}

pub struct Ide {
    queue: SpinLock<IdeQueue>,
    havedisk1: AtomicBool,
}

impl Ide {
    pub const fn new() -> Self {
        Self {
            queue: new_spinlock("ide", IdeQueue { head: ptr::null() }),
            havedisk1: AtomicBool::new(false),
        }
    }

    /// Waits for the controller to become ready; optionally checks for
    /// error bits.
    fn wait(checkerr: bool) -> Result<(), ()> {
        loop {
            // SAFETY: IDE status port read.
            let r = unsafe { inb(0x1F7) };
            if r & (IDE_BSY | IDE_DRDY) == IDE_DRDY {
                if checkerr && r & (IDE_DF | IDE_ERR) != 0 {
                    return Err(());
                }
                return Ok(());
            }
        }
    }

    /// Routes the disk interrupt to the last CPU, then probes the
    /// controller and disk 1. Called once at boot.
    pub fn init(&self) {
        let ncpu = kernel().cpus.count() as u32;
        crate::ioapic::enable(crate::trap::IRQ_IDE, ncpu - 1);
        let _ = Self::wait(false);

        // Check if disk 1 is present.
        // SAFETY: IDE port I/O.
        unsafe {
            outb(0x1F6, 0xE0 | (1 << 4));
            for _ in 0..1000 {
                if inb(0x1F7) != 0 {
                    self.havedisk1.store(true, Ordering::Release);
                    break;
                }
            }

            // Switch back to disk 0.
            outb(0x1F6, 0xE0);
        }
    }

    /// Starts the request for the queue head. The IDE lock must be held.
    unsafe fn start(b: *const BufEntry) {
        assert!(!b.is_null(), "idestart");
        let b = &*b;
        let sector = b.blockno() as usize * SECTORS_PER_BLOCK;
        let (read_cmd, write_cmd) = if SECTORS_PER_BLOCK == 1 {
            (IDE_CMD_READ, IDE_CMD_WRITE)
        } else {
            (IDE_CMD_RDMUL, IDE_CMD_WRMUL)
        };
        assert!(SECTORS_PER_BLOCK < 8, "idestart");

        let _ = Self::wait(false);
        outb(0x3F6, 0); // generate interrupt
        outb(0x1F2, SECTORS_PER_BLOCK as u8); // number of sectors
        outb(0x1F3, (sector & 0xFF) as u8);
        outb(0x1F4, ((sector >> 8) & 0xFF) as u8);
        outb(0x1F5, ((sector >> 16) & 0xFF) as u8);
        outb(
            0x1F6,
            0xE0 | (((b.dev() & 1) as u8) << 4) | (((sector >> 24) & 0x0F) as u8),
        );
        if b.dirty() {
            outb(0x1F7, write_cmd);
            // SAFETY: the requesting process holds the buffer's sleep-lock
            // and is parked; nothing else touches the data.
            outsl(0x1F0, (*b.inner.get_mut_raw()).bytes().as_ptr() as *const u32, BSIZE / 4);
        } else {
            outb(0x1F7, read_cmd);
        }
    }

    /// Synchronously performs the buffer's pending operation: read the
    /// block into the buffer if it is not valid, or write it out if it is
    /// dirty. The caller holds the buffer's sleep-lock (it owns the `Buf`).
    pub fn rw(&self, b: &mut Buf) {
        assert!(
            b.dirty() || !b.valid(),
            "ide rw: nothing to do"
        );
        if b.dev() != 0 && !self.havedisk1.load(Ordering::Acquire) {
            panic!("ide rw: disk 1 not present");
        }

        let mut guard = self.queue.lock();

        // Append to the request queue.
        let entry: &BufEntry = &**b;
        entry.qnext.set(ptr::null());
        if guard.head.is_null() {
            guard.head = entry;
            // Send the request to the controller.
            // SAFETY: the IDE lock is held.
            unsafe { Self::start(entry) };
        } else {
            // SAFETY: queue links are guarded by the IDE lock; every queued
            // entry is kept alive by its requester.
            unsafe {
                let mut q = guard.head;
                while !(*q).qnext.get().is_null() {
                    q = (*q).qnext.get();
                }
                (*q).qnext.set(entry);
            }
        }

        // Wait for the request to finish.
        while !(b.valid() && !b.dirty()) {
            b.io_wait.sleep(&mut guard);
        }
    }

    /// The disk interrupt: completes the head request, wakes its owner, and
    /// kicks off the next one.
    pub fn intr(&self) {
        let mut guard = self.queue.lock();

        let b = guard.head;
        if b.is_null() {
            println!("spurious IDE interrupt");
            return;
        }
        // SAFETY: queued entries stay alive until their requester is woken.
        let b = unsafe { &*b };
        guard.head = b.qnext.get();

        // Read data if needed.
        if !b.dirty() && Self::wait(true).is_ok() {
            // SAFETY: the requester holds the sleep-lock and is parked;
            // the data is ours until we wake it.
            unsafe {
                insl(
                    0x1F0,
                    (*b.inner.get_mut_raw()).bytes_mut().as_mut_ptr() as *mut u32,
                    BSIZE / 4,
                )
            };
        }

        // Wake the process waiting for this buffer.
        b.valid.store(true, Ordering::Release);
        b.dirty.store(false, Ordering::Release);
        // Wakeup takes the process-table lock inside the IDE lock; neither
        // sleeps.
        kernel().procs.wakeup(&b.io_wait);

        // Start disk on next buffer in queue.
        if !guard.head.is_null() {
            // SAFETY: the IDE lock is held.
            unsafe { Self::start(guard.head) };
        }
    }
}

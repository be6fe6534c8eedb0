use core::ptr;

use xr6_kernel_lib::lock::{Guard, RawLock};

use super::{myproc, ProcState};
use crate::kernel::kernel;

/// A rendezvous point between sleepers and wakers. The channel's address is
/// its identity; waiters re-check their condition after every wakeup, so a
/// channel can be reused for unrelated events without confusion.
pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels could share an address, spuriously waking up
    /// more threads.
    _padding: u8,
}

/// A held lock that `sleep` can let go of atomically: release the raw lock,
/// but keep the guard so it can be reacquired on wakeup.
pub trait Waitable {
    /// Releases the raw lock without dropping the guard.
    ///
    /// # Safety
    ///
    /// Must be paired with exactly one `raw_acquire` before the guard is
    /// used or dropped.
    unsafe fn raw_release(&mut self);

    /// Reacquires the raw lock released by `raw_release`.
    ///
    /// # Safety
    ///
    /// See `raw_release`.
    unsafe fn raw_acquire(&mut self);

    /// The identity of the underlying raw lock, used to recognize the
    /// process-table lock.
    fn raw_addr(&self) -> usize;
}

impl<R: RawLock, T> Waitable for Guard<'_, R, T> {
    unsafe fn raw_release(&mut self) {
        Guard::raw_release(self);
    }

    unsafe fn raw_acquire(&mut self) {
        Guard::raw_acquire(self);
    }

    fn raw_addr(&self) -> usize {
        Guard::raw_addr(self)
    }
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically releases `lk` and sleeps on this channel. Reacquires `lk`
    /// when awakened.
    pub fn sleep<W: Waitable>(&self, lk: &mut W) {
        let p = myproc().expect("sleep without a process");
        let procs = &kernel().procs;

        // Must acquire the process-table lock in order to change p's state
        // and then call sched(). Once it is held, we are guaranteed not to
        // miss any wakeup (wakeup runs under the same lock), so it is fine
        // to release `lk`.
        //
        // If `lk` is the process-table lock itself, there is nothing to
        // swap.
        let swap = lk.raw_addr() != procs.lock_addr();
        if swap {
            // SAFETY: acquire/release are strictly bracketed around the
            // sleep below.
            unsafe {
                procs.acquire_lock();
                lk.raw_release();
            }
        }

        // SAFETY: the process-table lock is held either way.
        unsafe {
            let info = p.info_mut();
            info.waitchannel = self;
            info.state = ProcState::Sleeping;
        }

        // SAFETY: we hold the table lock, the state was changed, and
        // interrupts are off (the lock is a spinlock).
        unsafe { super::sched() };

        // Tidy up.
        // SAFETY: still holding the table lock after sched() returns.
        unsafe { p.info_mut().waitchannel = ptr::null() };

        if swap {
            // SAFETY: paired with the acquire/release above.
            unsafe {
                procs.release_lock();
                lk.raw_acquire();
            }
        }
    }

    /// Wakes up all processes sleeping on this channel. Must not be called
    /// while holding the process-table lock (use `Procs::wakeup1` there).
    pub fn wakeup(&self) {
        kernel().procs.wakeup(self);
    }
}

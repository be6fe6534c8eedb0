//! Long-term locks for processes. Acquisition may block (sleep); holding one
//! across a disk read is fine, unlike a spinlock.

use xr6_kernel_lib::lock::{Guard, Lock, RawLock};

use super::{RawSpinlock, SpinLock, SpinLockGuard};
use crate::proc::{self, Pid, WaitChannel};

struct SleepLockInfo {
    /// Is the lock held?
    locked: bool,

    /// Process holding the lock.
    pid: Pid,
}

/// The raw sleeping lock: a held flag protected by a spinlock, plus the
/// channel contenders sleep on.
pub struct RawSleepLock {
    lk: SpinLock<SleepLockInfo>,
    waitchannel: WaitChannel,
}

/// Locks that sleep when contended. The per-buffer and per-inode locks.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
/// Guards of `SleepLock<T>`.
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

/// Returns a new `SleepLock` with name `name` and data `data`.
pub const fn new_sleeplock<T>(name: &'static str, data: T) -> SleepLock<T> {
    Lock::new(RawSleepLock::new(name), data)
}

impl RawSleepLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            lk: SpinLock::new(
                RawSpinlock::new(name),
                SleepLockInfo {
                    locked: false,
                    pid: 0,
                },
            ),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        let mut guard: SpinLockGuard<'_, SleepLockInfo> = self.lk.lock();
        while guard.locked {
            self.waitchannel.sleep(&mut guard);
        }
        guard.locked = true;
        guard.pid = proc::myproc().map_or(0, |p| p.pid());
        drop(guard);
    }

    fn release(&self) {
        let mut guard = self.lk.lock();
        guard.locked = false;
        guard.pid = 0;
        self.waitchannel.wakeup();
        drop(guard);
    }

    fn holding(&self) -> bool {
        let guard = self.lk.lock();
        guard.locked && guard.pid == proc::myproc().map_or(0, |p| p.pid())
    }
}

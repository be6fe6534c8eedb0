//! Locks that can block: on a CPU (spinning, interrupts disabled) or on a
//! process (sleeping). The generic `Lock`/`Guard` plumbing lives in
//! `xr6_kernel_lib::lock`; this module provides the raw primitives.

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{SleepableLock, SleepableLockGuard};
pub use sleeplock::{new_sleeplock, RawSleepLock, SleepLock, SleepLockGuard};
pub use spinlock::{new_spinlock, RawSpinlock, SpinLock, SpinLockGuard};

pub use xr6_kernel_lib::lock::{Guard, Lock, Pause, RawLock};

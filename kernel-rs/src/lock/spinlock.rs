//! Mutual exclusion spin locks.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use xr6_kernel_lib::lock::{Guard, Lock, RawLock};

use crate::cpu::{self, Cpu};
use crate::x86::{getcallerpcs, read_ebp, spin_hint};

/// Mutual exclusion lock that busy-waits (spins).
pub struct RawSpinlock {
    /// Name of lock, for debugging.
    name: &'static str,

    /// If the lock is held, contains the pointer of the holding `Cpu`;
    /// otherwise, contains null.
    locked: AtomicPtr<Cpu>,

    /// The call stack that acquired the lock, for debugging. Written only
    /// by the holder.
    pcs: UnsafeCell<[usize; 10]>,
}

// SAFETY: `pcs` is only written between a successful acquire and the
// release, i.e. by the holding CPU.
unsafe impl Sync for RawSpinlock {}

/// Locks that busy-wait (spin). Interrupts stay disabled on this CPU while
/// any spinlock is held.
pub type SpinLock<T> = Lock<RawSpinlock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

/// Returns a new `SpinLock` with name `name` and data `data`.
pub const fn new_spinlock<T>(name: &'static str, data: T) -> SpinLock<T> {
    Lock::new(RawSpinlock::new(name), data)
}

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicPtr::new(ptr::null_mut()),
            pcs: UnsafeCell::new([0; 10]),
        }
    }

    /// Checks whether this CPU is holding the lock. Interrupts must be off.
    fn holding_unchecked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == cpu::current_raw()
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        // Disable interrupts to avoid deadlock with an interrupt handler
        // taking the same lock on this CPU.
        cpu::push_off();
        assert!(!self.holding_unchecked(), "acquire {}", self.name);

        // The `Acquire` success ordering pairs with the `Release` store in
        // `release()`: everything written inside the previous critical
        // section is visible once the exchange succeeds. No separate fence
        // is needed.
        while self
            .locked
            .compare_exchange(
                ptr::null_mut(),
                cpu::current_raw(),
                Ordering::Acquire,
                // Okay to use `Relaxed` ordering here since we don't enter
                // the critical section if the exchange fails.
                Ordering::Relaxed,
            )
            .is_err()
        {
            spin_hint();
        }

        // Record the acquiring call stack, for debugging.
        // SAFETY: we are now the holder.
        getcallerpcs(read_ebp(), unsafe { &mut *self.pcs.get() });
    }

    fn release(&self) {
        assert!(self.holding_unchecked(), "release {}", self.name);

        // Publish the critical section's writes before the lock is seen
        // free.
        self.locked.store(ptr::null_mut(), Ordering::Release);
        cpu::pop_off();
    }

    fn holding(&self) -> bool {
        cpu::push_off();
        let r = self.holding_unchecked();
        cpu::pop_off();
        r
    }
}

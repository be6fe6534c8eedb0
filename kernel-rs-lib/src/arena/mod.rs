//! The arena module.
//!
//! An `Arena` is a fixed-size pool of reference-counted slots. The kernel
//! builds its three caches out of the two arena shapes here:
//!
//! * `ArrayArena` — plain array scan (file table, inode cache),
//! * `MruArena` — array threaded onto a most-recently-used list (buffer
//!   cache), so eviction victims are taken from the cold end.
//!
//! Allocation hands out an `ArenaRc`, a clonable owning handle. When the
//! last handle for a slot goes away, the slot's `ArenaObject::finalize` runs
//! (with the arena lock held; `Pause` lets it sleep), and the slot becomes
//! reusable.

use core::mem::ManuallyDrop;
use core::ops::Deref;

use crate::lock::Pause;
use crate::rc_cell::Ref;

mod array_arena;
mod mru_arena;

pub use array_arena::ArrayArena;
pub use mru_arena::{MruArena, MruEntry};

pub trait ArenaObject {
    /// Finalizes the object when its last reference goes away.
    ///
    /// Called with the arena lock held. `pause` temporarily releases it, so
    /// the finalizer can block (e.g. truncate an inode on disk).
    fn finalize<P: Pause>(&mut self, pause: &mut P);

    /// Whether an unreferenced slot may be recycled right now. The buffer
    /// cache refuses to evict blocks pinned by the log.
    fn evictable(&self) -> bool {
        true
    }
}

/// A homogeneous pool handing out reference-counted slots.
pub trait Arena: Sized + Sync {
    /// The value type of the pool.
    type Data: ArenaObject;

    /// Looks for a slot matching `c` and returns a new handle to it;
    /// otherwise claims a free slot, initializes it with `n`, and returns
    /// that. Returns `None` when every slot is referenced.
    fn find_or_alloc<C: Fn(&Self::Data) -> bool, N: FnOnce(&mut Self::Data)>(
        &self,
        c: C,
        n: N,
    ) -> Option<ArenaRc<Self>>;

    /// Claims a free slot, initializing it with `f`. Returns `None` when
    /// every slot is referenced.
    fn alloc<F: FnOnce(&mut Self::Data)>(&self, f: F) -> Option<ArenaRc<Self>>;

    /// Duplicates a handle, increasing the reference count.
    ///
    /// # Safety
    ///
    /// `handle` must have been allocated from `self`.
    unsafe fn dup(&self, handle: &Ref<Self::Data>) -> Ref<Self::Data>;

    /// Gives a handle back; finalizes the slot if it was the last one.
    ///
    /// # Safety
    ///
    /// `handle` must have been allocated from `self`.
    unsafe fn dealloc(&self, handle: Ref<Self::Data>);
}

/// A clonable owning handle to a slot of the arena `A`.
///
/// # Safety
///
/// `handle` was allocated from `arena`, and arenas are never dropped while
/// handles exist (in the kernel they are static).
pub struct ArenaRc<A: Arena> {
    arena: *const A,
    handle: ManuallyDrop<Ref<A::Data>>,
}

// SAFETY: an `ArenaRc` only exposes `&Data`, and count manipulation goes
// through the arena's lock. It does not point to thread-local data.
unsafe impl<T: Send + Sync, A: Arena<Data = T>> Send for ArenaRc<A> {}
unsafe impl<T: Send + Sync, A: Arena<Data = T>> Sync for ArenaRc<A> {}

impl<T, A: Arena<Data = T>> ArenaRc<A> {
    /// # Safety
    ///
    /// `inner` must have been allocated from `arena`.
    pub unsafe fn from_unchecked(arena: &A, inner: Ref<T>) -> Self {
        Self {
            arena,
            handle: ManuallyDrop::new(inner),
        }
    }

    fn get_arena(&self) -> &A {
        // SAFETY: `ArenaRc`'s invariant.
        unsafe { &*self.arena }
    }
}

impl<T, A: Arena<Data = T>> Deref for ArenaRc<A> {
    type Target = T;

    fn deref(&self) -> &T {
        self.handle.deref()
    }
}

impl<A: Arena> Clone for ArenaRc<A> {
    fn clone(&self) -> Self {
        // SAFETY: `handle` was allocated from `arena`.
        let handle = ManuallyDrop::new(unsafe { self.get_arena().dup(&self.handle) });
        Self {
            arena: self.arena,
            handle,
        }
    }
}

impl<A: Arena> Drop for ArenaRc<A> {
    fn drop(&mut self) {
        // SAFETY: `handle` was allocated from `arena`, and is not used
        // again. `arena` is read directly (not via `get_arena`) so this
        // borrow doesn't overlap with the mutable borrow of `handle` below.
        unsafe {
            let arena = &*self.arena;
            arena.dealloc(ManuallyDrop::take(&mut self.handle));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{Lock, RawLock};
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) struct TestRawLock(AtomicBool);

    impl TestRawLock {
        pub(crate) const fn new() -> Self {
            Self(AtomicBool::new(false))
        }
    }

    impl RawLock for TestRawLock {
        fn acquire(&self) {
            assert!(
                self.0
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok(),
                "single-threaded tests never contend"
            );
        }

        fn release(&self) {
            self.0.store(false, Ordering::Release);
        }

        fn holding(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    pub(crate) struct Slot {
        pub key: Cell<u32>,
        pub finalized: Cell<u32>,
        pub pinned: Cell<bool>,
    }

    // SAFETY: tests are single-threaded.
    unsafe impl Sync for Slot {}
    unsafe impl Send for Slot {}

    impl Slot {
        pub(crate) fn new() -> Self {
            Self {
                key: Cell::new(0),
                finalized: Cell::new(0),
                pinned: Cell::new(false),
            }
        }
    }

    impl ArenaObject for Slot {
        fn finalize<P: Pause>(&mut self, _pause: &mut P) {
            self.finalized.set(self.finalized.get() + 1);
        }

        fn evictable(&self) -> bool {
            !self.pinned.get()
        }
    }

    pub(crate) type TestArena<const N: usize> = Lock<TestRawLock, ArrayArena<Slot, N>>;

    pub(crate) fn test_arena<const N: usize>() -> TestArena<N> {
        Lock::new(
            TestRawLock::new(),
            ArrayArena::new(core::array::from_fn(|_| Slot::new())),
        )
    }

    #[test]
    fn find_or_alloc_dedups_by_key() {
        let arena = test_arena::<4>();
        let a = arena
            .find_or_alloc(|s| s.key.get() == 9, |s| s.key.set(9))
            .unwrap();
        let b = arena
            .find_or_alloc(|s| s.key.get() == 9, |_| panic!("must reuse the live slot"))
            .unwrap();
        assert_eq!(a.key.get(), 9);
        // Both handles refer to the same slot.
        assert!(core::ptr::eq(&*a, &*b));
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = test_arena::<2>();
        let _a = arena.alloc(|s| s.key.set(1)).unwrap();
        let _b = arena.alloc(|s| s.key.set(2)).unwrap();
        assert!(arena.alloc(|s| s.key.set(3)).is_none());
    }

    #[test]
    fn finalize_runs_once_on_last_drop() {
        let arena = test_arena::<2>();
        let a = arena.alloc(|s| s.key.set(1)).unwrap();
        let b = a.clone();
        let slot = &*a as *const Slot;
        drop(a);
        // SAFETY: the slot is a static-like arena entry alive for the test.
        assert_eq!(unsafe { (*slot).finalized.get() }, 0);
        drop(b);
        assert_eq!(unsafe { (*slot).finalized.get() }, 1);
    }

    #[test]
    fn freed_slot_is_reused() {
        let arena = test_arena::<1>();
        let a = arena.alloc(|s| s.key.set(1)).unwrap();
        drop(a);
        let b = arena.alloc(|s| s.key.set(2)).unwrap();
        assert_eq!(b.key.get(), 2);
    }
}

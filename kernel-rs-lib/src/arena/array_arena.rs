//! A reference-counted pool backed by a plain array scan.

use super::{Arena, ArenaObject, ArenaRc};
use crate::lock::{Lock, RawLock};
use crate::rc_cell::{RcCell, Ref};

/// A homogeneous pool with `CAPACITY` slots, found by linear scan.
///
/// The inode cache and the file table are `SpinLock<ArrayArena<..>>`s.
pub struct ArrayArena<T, const CAPACITY: usize> {
    entries: [RcCell<T>; CAPACITY],
}

impl<T, const CAPACITY: usize> ArrayArena<T, CAPACITY> {
    /// Builds an arena from pre-wrapped cells; usable in statics.
    pub const fn from_cells(entries: [RcCell<T>; CAPACITY]) -> Self {
        Self { entries }
    }

    /// Builds an arena from plain values (host-side convenience).
    pub fn new(entries: [T; CAPACITY]) -> Self {
        Self {
            entries: entries.map(RcCell::new),
        }
    }
}

impl<T: ArenaObject + Send + Sync, R: RawLock, const CAPACITY: usize> Arena
    for Lock<R, ArrayArena<T, CAPACITY>>
{
    type Data = T;

    fn find_or_alloc<C: Fn(&T) -> bool, N: FnOnce(&mut T)>(
        &self,
        c: C,
        n: N,
    ) -> Option<ArenaRc<Self>> {
        let guard = self.lock();

        let mut empty: Option<&RcCell<T>> = None;
        for cell in &guard.entries {
            // SAFETY: we hold the arena lock.
            if unsafe { cell.is_free() } {
                if empty.is_none() && unsafe { (*cell.data_raw()).evictable() } {
                    empty = Some(cell);
                }
                // Note: no `break`. A live slot matching `c` must win over
                // any free slot seen earlier, so the scan runs to the end.
            } else if c(unsafe { &*cell.data_raw() }) {
                let handle = unsafe { cell.borrow() };
                drop(guard);
                // SAFETY: `handle` was taken from our own entries.
                return Some(unsafe { ArenaRc::from_unchecked(self, handle) });
            }
        }

        let cell = empty?;
        // SAFETY: the slot is free and we hold the lock, so the mutable
        // access below is exclusive.
        let handle = unsafe {
            n(cell.get_mut_unchecked());
            cell.borrow()
        };
        drop(guard);
        // SAFETY: `handle` was taken from our own entries.
        Some(unsafe { ArenaRc::from_unchecked(self, handle) })
    }

    fn alloc<F: FnOnce(&mut T)>(&self, f: F) -> Option<ArenaRc<Self>> {
        let guard = self.lock();

        for cell in &guard.entries {
            // SAFETY: we hold the arena lock.
            if unsafe { cell.is_free() } {
                // SAFETY: the slot is free, so the mutable access is
                // exclusive.
                let handle = unsafe {
                    f(cell.get_mut_unchecked());
                    cell.borrow()
                };
                drop(guard);
                // SAFETY: `handle` was taken from our own entries.
                return Some(unsafe { ArenaRc::from_unchecked(self, handle) });
            }
        }
        None
    }

    unsafe fn dup(&self, handle: &Ref<T>) -> Ref<T> {
        let _guard = self.lock();
        // SAFETY: the arena lock is held.
        unsafe { handle.clone_ref() }
    }

    unsafe fn dealloc(&self, handle: Ref<T>) {
        let mut guard = self.lock();
        // SAFETY: the arena lock is held.
        if unsafe { handle.cell().rc() } == 1 {
            // Last reference: finalize before the count drops, so a
            // concurrent `find_or_alloc` cannot claim a half-finalized slot.
            let data = handle.cell().data_raw();
            // SAFETY: with rc == 1 and the lock held, nothing else touches
            // the data; `finalize` may pause the lock, but the slot stays
            // unreachable (its count is still 1).
            unsafe { (*data).finalize(&mut guard) };
        }
        // SAFETY: the arena lock is held.
        let _ = unsafe { handle.release() };
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::*;
    use super::super::Arena;

    #[test]
    fn match_requires_live_slot() {
        let arena = test_arena::<2>();
        let a = arena.alloc(|s| s.key.set(5)).unwrap();
        drop(a);
        // The slot with key 5 is free now; a find for 5 must not resurrect
        // it but claim it as empty through the initializer.
        let b = arena
            .find_or_alloc(|s| s.key.get() == 5, |s| s.key.set(6))
            .unwrap();
        assert_eq!(b.key.get(), 6);
    }

    #[test]
    fn dup_and_dealloc_balance() {
        let arena = test_arena::<1>();
        let a = arena.alloc(|s| s.key.set(1)).unwrap();
        let clones: Vec<_> = (0..10).map(|_| a.clone()).collect();
        drop(clones);
        drop(a);
        assert!(arena.alloc(|s| s.key.set(2)).is_some());
    }
}

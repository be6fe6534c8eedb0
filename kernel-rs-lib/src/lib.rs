//! Arch-independent building blocks of the kernel: the lock framework and the
//! reference-counted arena allocators behind the file table, the inode cache
//! and the buffer cache.
//!
//! Everything here is `no_std` and free of self-referential data, so the
//! whole crate can be unit-tested on the host with a trivial `RawLock`.
#![cfg_attr(not(test), no_std)]

pub mod arena;
pub mod lock;
pub mod rc_cell;

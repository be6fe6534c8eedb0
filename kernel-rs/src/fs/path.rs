//! Pathname resolution.

use cstr_core::CStr;

use super::inode::{ItableExt, RcInode, RcInodeExt};
use super::DIRSIZ;
use crate::kernel::kernel;
use crate::param::ROOTDEV;
use crate::proc::myproc;
use crate::stat::T_DIR;

/// The root inode number.
pub const ROOTINO: u32 = 1;

/// One component of a path, padded with NUL to `DIRSIZ` bytes (the on-disk
/// directory entry name format). Longer components are truncated.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FileName([u8; DIRSIZ]);

impl FileName {
    /// Builds a name from raw bytes, truncating at `DIRSIZ` and at the
    /// first NUL.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut name = [0; DIRSIZ];
        let len = bytes
            .iter()
            .take(DIRSIZ)
            .position(|&c| c == 0)
            .unwrap_or(bytes.len().min(DIRSIZ));
        name[..len].copy_from_slice(&bytes[..len]);
        Self(name)
    }

    pub fn as_bytes(&self) -> &[u8; DIRSIZ] {
        &self.0
    }

    pub fn is(&self, s: &[u8]) -> bool {
        *self == Self::from_bytes(s)
    }
}

/// A slash-separated path.
#[repr(transparent)]
pub struct Path {
    // Invariant: contains no NUL bytes.
    inner: [u8],
}

impl Path {
    pub fn new(cstr: &CStr) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of its
        // `#[repr(transparent)]` attribute, and a `CStr` has no interior
        // NUL.
        unsafe { Self::from_bytes(cstr.to_bytes()) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain any NUL bytes.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        &*(bytes as *const [u8] as *const Self)
    }

    pub fn root() -> &'static Self {
        // SAFETY: no NUL bytes.
        unsafe { Self::from_bytes(b"/") }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    /// Splits off the next path element.
    /// Returns the remainder (with no leading slashes) and the element;
    /// None if there is no element left.
    ///
    /// Examples:
    ///   skipelem("a/bb/c") = ("bb/c", "a")
    ///   skipelem("///a//bb") = ("bb", "a")
    ///   skipelem("a") = ("", "a")
    ///   skipelem("") = skipelem("////") = None
    fn skipelem(&self) -> Option<(&Self, FileName)> {
        let mut bytes = &self.inner;

        let start = bytes.iter().position(|&ch| ch != b'/')?;
        bytes = &bytes[start..];

        let len = bytes
            .iter()
            .position(|&ch| ch == b'/')
            .unwrap_or(bytes.len());
        let name = FileName::from_bytes(&bytes[..len]);
        bytes = &bytes[len..];

        let next = bytes
            .iter()
            .position(|&ch| ch != b'/')
            .unwrap_or(bytes.len());
        // SAFETY: a subslice of `self.inner`, which contains no NUL bytes.
        Some((unsafe { Self::from_bytes(&bytes[next..]) }, name))
    }

    /// Looks up and returns the inode for this path. Must be called inside
    /// a transaction, since it may drop inode references.
    pub fn namei(&self) -> Result<RcInode, ()> {
        Ok(self.namex(false)?.0)
    }

    /// Like `namei`, but stops one level early: returns the parent
    /// directory's inode and the final path element.
    pub fn nameiparent(&self) -> Result<(RcInode, FileName), ()> {
        let (ip, name) = self.namex(true)?;
        Ok((ip, name.ok_or(())?))
    }

    fn namex(&self, parent: bool) -> Result<(RcInode, Option<FileName>), ()> {
        let mut ip = if self.is_absolute() {
            kernel().file_system.itable.get(ROOTDEV, ROOTINO)
        } else {
            // The cwd of the current process; duplicated so the walk owns
            // its reference.
            let p = myproc().expect("namex: no process");
            // SAFETY: we are the current process.
            unsafe { p.data() }.cwd.clone().expect("namex: no cwd")
        };

        let mut path = self;
        loop {
            let Some((rest, name)) = path.skipelem() else {
                break;
            };
            path = rest;

            let mut guard = ip.lock();
            if guard.typ != T_DIR {
                return Err(());
            }
            if parent && path.inner.is_empty() {
                // Stop one level early.
                drop(guard);
                return Ok((ip, Some(name)));
            }
            let (next, _off) = guard.dirlookup(&name)?;
            drop(guard);
            ip = next;
        }

        if parent {
            return Err(());
        }
        Ok((ip, None))
    }
}

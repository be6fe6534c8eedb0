//! File-system-related system calls. The directory-modifying ones wrap
//! their work in a log transaction.

use core::cell::UnsafeCell;
use core::mem;

use arrayvec::ArrayVec;
use cstr_core::CStr;
use zerocopy::{AsBytes, FromZeroes};

use super::{argfd, argint, argptr, argstr, fetch_int, fetch_str};
use crate::exec::exec;
use crate::fcntl::FcntlFlags;
use crate::file::{fdalloc, FileTableExt, FileType};
use crate::fs::{Dirent, FileName, ItableExt, Path, RcInode, RcInodeExt, DIRENT_SIZE};
use crate::kernel::kernel;
use crate::param::MAXARG;
use crate::pipe::AllocatedPipe;
use crate::proc::myproc;
use crate::stat::{Stat, T_DEV, T_DIR, T_FILE};

pub(super) fn sys_dup() -> Result<usize, ()> {
    let (fd, _f) = argfd(0)?;
    let p = myproc().expect("sys_dup");
    // SAFETY: we are the current process.
    let f = unsafe { p.data() }.open_files[fd].as_ref().unwrap().clone();
    fdalloc(f).map_err(|f| drop(f))
}

pub(super) fn sys_read() -> Result<usize, ()> {
    let (_fd, f) = argfd(0)?;
    let n = argint(2)?;
    if n < 0 {
        return Err(());
    }
    let addr = argptr(1, n as usize)?;
    f.read(addr, n as usize)
}

pub(super) fn sys_write() -> Result<usize, ()> {
    let (_fd, f) = argfd(0)?;
    let n = argint(2)?;
    if n < 0 {
        return Err(());
    }
    let addr = argptr(1, n as usize)?;
    f.write(addr, n as usize)
}

pub(super) fn sys_close() -> Result<usize, ()> {
    let (fd, _f) = argfd(0)?;
    let p = myproc().expect("sys_close");
    // SAFETY: we are the current process.
    let _ = unsafe { p.data_mut() }.open_files[fd].take();
    Ok(0)
}

pub(super) fn sys_fstat() -> Result<usize, ()> {
    let (_fd, f) = argfd(0)?;
    let addr = argptr(1, mem::size_of::<Stat>())?;
    f.stat(addr).map(|()| 0)
}

/// Creates the path `new` as a link to the same inode as `old`.
pub(super) fn sys_link() -> Result<usize, ()> {
    let old = Path::new(argstr(0)?);
    let new = Path::new(argstr(1)?);

    let fs = &kernel().file_system;
    fs.begin_op();
    let r = link_op(old, new);
    fs.end_op();
    r.map(|()| 0)
}

fn link_op(old: &Path, new: &Path) -> Result<(), ()> {
    let ip = old.namei()?;

    {
        let mut guard = ip.lock();
        if guard.typ == T_DIR {
            return Err(());
        }
        guard.nlink += 1;
        guard.update();
    }

    let linked = (|| {
        let (dp, name) = new.nameiparent()?;
        let mut dpg = dp.lock();
        if dpg.dev() != ip.dev {
            return Err(());
        }
        dpg.dirlink(&name, ip.inum)
    })();

    if linked.is_err() {
        let mut guard = ip.lock();
        guard.nlink -= 1;
        guard.update();
        return Err(());
    }
    Ok(())
}

pub(super) fn sys_unlink() -> Result<usize, ()> {
    let path = Path::new(argstr(0)?);

    let fs = &kernel().file_system;
    fs.begin_op();
    let r = unlink_op(path);
    fs.end_op();
    r.map(|()| 0)
}

fn unlink_op(path: &Path) -> Result<(), ()> {
    let (dp, name) = path.nameiparent()?;
    let mut dpg = dp.lock();

    // Cannot unlink "." or "..".
    if name.is(b".") || name.is(b"..") {
        return Err(());
    }

    let (ip, off) = dpg.dirlookup(&name)?;
    let mut ipg = ip.lock();
    assert!(ipg.nlink >= 1, "unlink: nlink < 1");

    if ipg.typ == T_DIR && !ipg.is_dir_empty() {
        return Err(());
    }

    let de = Dirent::new_zeroed();
    let written = dpg.write_bytes(de.as_bytes(), off);
    assert_eq!(written, Ok(DIRENT_SIZE), "unlink: writei");
    if ipg.typ == T_DIR {
        // The victim's ".." no longer references the parent.
        dpg.nlink -= 1;
        dpg.update();
    }
    drop(dpg);
    drop(dp);

    ipg.nlink -= 1;
    ipg.update();
    Ok(())
}

/// Creates an inode at `path` of the given type, inside the caller's
/// transaction. Opening an existing file with a matching type succeeds;
/// anything else that already exists is refused.
fn create(path: &Path, typ: i16, major: i16, minor: i16) -> Result<RcInode, ()> {
    let (dp, name) = path.nameiparent()?;
    let mut dpg = dp.lock();

    if let Ok((ip, _off)) = dpg.dirlookup(&name) {
        drop(dpg);
        let guard = ip.lock();
        if typ == T_FILE && (guard.typ == T_FILE || guard.typ == T_DEV) {
            drop(guard);
            return Ok(ip);
        }
        return Err(());
    }

    let ip = kernel().file_system.itable.alloc_inode(dpg.dev(), typ);
    let mut ipg = ip.lock();
    ipg.major = major;
    ipg.minor = minor;
    ipg.nlink = 1;
    ipg.update();

    if typ == T_DIR {
        // Make "." and ".." entries; "." intentionally carries no extra
        // link count, to avoid a cyclic reference.
        dpg.nlink += 1; // for ".."
        dpg.update();
        let inum = ipg.inum();
        let dinum = dpg.inum();
        ipg.dirlink(&FileName::from_bytes(b"."), inum)
            .expect("create dots");
        ipg.dirlink(&FileName::from_bytes(b".."), dinum)
            .expect("create dots");
    }

    let inum = ipg.inum();
    dpg.dirlink(&name, inum).expect("create: dirlink");
    drop(ipg);
    Ok(ip)
}

pub(super) fn sys_open() -> Result<usize, ()> {
    let path = Path::new(argstr(0)?);
    let omode = FcntlFlags::from_bits_truncate(argint(1)?);

    let fs = &kernel().file_system;
    fs.begin_op();

    let ip = if omode.contains(FcntlFlags::O_CREATE) {
        create(path, T_FILE, 0, 0)
    } else {
        (|| {
            let ip = path.namei()?;
            let guard = ip.lock();
            if guard.typ == T_DIR && omode != FcntlFlags::O_RDONLY {
                return Err(());
            }
            drop(guard);
            Ok(ip)
        })()
    };
    let Ok(ip) = ip else {
        fs.end_op();
        return Err(());
    };

    let readable = !omode.intersects(FcntlFlags::O_WRONLY);
    let writable = omode.intersects(FcntlFlags::O_WRONLY | FcntlFlags::O_RDWR);
    let f = kernel().ftable.alloc_file(
        FileType::Inode {
            ip,
            off: UnsafeCell::new(0),
        },
        readable,
        writable,
    );
    let Ok(f) = f else {
        // The inode reference was dropped with the failed allocation,
        // inside this transaction, as required.
        fs.end_op();
        return Err(());
    };

    let fd = fdalloc(f).map_err(|f| drop(f));
    fs.end_op();
    fd
}

pub(super) fn sys_mkdir() -> Result<usize, ()> {
    let path = Path::new(argstr(0)?);

    let fs = &kernel().file_system;
    fs.begin_op();
    let r = create(path, T_DIR, 0, 0);
    fs.end_op();
    r.map(|_ip| 0)
}

pub(super) fn sys_mknod() -> Result<usize, ()> {
    let path = Path::new(argstr(0)?);
    let major = argint(1)?;
    let minor = argint(2)?;

    let fs = &kernel().file_system;
    fs.begin_op();
    let r = create(path, T_DEV, major as i16, minor as i16);
    fs.end_op();
    r.map(|_ip| 0)
}

pub(super) fn sys_chdir() -> Result<usize, ()> {
    let path = Path::new(argstr(0)?);
    let p = myproc().expect("sys_chdir");

    let fs = &kernel().file_system;
    fs.begin_op();
    let r = (|| {
        let ip = path.namei()?;
        let guard = ip.lock();
        if guard.typ != T_DIR {
            return Err(());
        }
        drop(guard);
        // SAFETY: we are the current process. The old cwd reference drops
        // inside this transaction.
        unsafe { p.data_mut() }.cwd = Some(ip);
        Ok(())
    })();
    fs.end_op();
    r.map(|()| 0)
}

pub(super) fn sys_exec() -> Result<usize, ()> {
    let path = Path::new(argstr(0)?);
    let uargv = argint(1)? as u32 as usize;

    let mut argv: ArrayVec<&CStr, MAXARG> = ArrayVec::new();
    loop {
        let uarg = fetch_int(uargv + 4 * argv.len())? as u32 as usize;
        if uarg == 0 {
            break;
        }
        if argv.is_full() {
            return Err(());
        }
        argv.push(fetch_str(uarg)?);
    }

    exec(path, &argv).map(|()| 0)
}

pub(super) fn sys_pipe() -> Result<usize, ()> {
    // An array of two ints for the two descriptors.
    let fdarray = argptr(0, 2 * mem::size_of::<i32>())?;

    let (f0, f1) = AllocatedPipe::alloc()?;
    let p = myproc().expect("sys_pipe");

    let fd0 = fdalloc(f0).map_err(|f| drop(f))?;
    let fd1 = match fdalloc(f1) {
        Ok(fd1) => fd1,
        Err(f1) => {
            drop(f1);
            // SAFETY: we are the current process.
            let _ = unsafe { p.data_mut() }.open_files[fd0].take();
            return Err(());
        }
    };

    // SAFETY: the array was validated against the process size.
    unsafe {
        core::ptr::write_unaligned(fdarray as *mut i32, fd0 as i32);
        core::ptr::write_unaligned((fdarray + 4) as *mut i32, fd1 as i32);
    }
    Ok(0)
}

//! System calls: argument fetching and dispatch.
//!
//! User code passes arguments on its stack; the saved user %esp in the trap
//! frame points at them, below a slot for the user return address. Every
//! fetch validates its addresses against the process size; a bad address
//! fails the call with no side effects.

use cstr_core::CStr;

use crate::file::File;
use crate::kernel::kernel;
use crate::param::NOFILE;
use crate::println;
use crate::proc::myproc;

mod file;
mod proc;

use self::file::*;
use self::proc::*;

/// Fetches the i32 at `addr` from the current process.
pub(self) fn fetch_int(addr: usize) -> Result<i32, ()> {
    let p = myproc().expect("fetch_int");
    // SAFETY: we are the current process.
    let sz = unsafe { p.data() }.sz;
    if addr >= sz || addr.wrapping_add(4) > sz {
        return Err(());
    }
    // SAFETY: the range was validated against the process size, and the
    // process's address space is the active one.
    Ok(unsafe { core::ptr::read_unaligned(addr as *const i32) })
}

/// Fetches the NUL-terminated string at `addr` from the current process.
/// Every byte, including the terminator, must lie inside the process.
pub(self) fn fetch_str(addr: usize) -> Result<&'static CStr, ()> {
    let p = myproc().expect("fetch_str");
    // SAFETY: we are the current process.
    let sz = unsafe { p.data() }.sz;
    if addr >= sz {
        return Err(());
    }
    // SAFETY: the range was validated; user memory stays mapped for the
    // duration of the system call, which bounds every use of the result.
    let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, sz - addr) };
    let nul = bytes.iter().position(|&c| c == 0).ok_or(())?;
    CStr::from_bytes_with_nul(&bytes[..=nul]).map_err(|_| ())
}

fn argraw(n: usize) -> Result<i32, ()> {
    let p = myproc().expect("argraw");
    // SAFETY: we are the current process; the trap frame was saved on
    // syscall entry.
    let esp = unsafe { (*p.data().trap_frame).esp } as usize;
    // Skip the slot for the user-mode return address.
    fetch_int(esp + 4 + 4 * n)
}

/// Fetches the n-th 32-bit system call argument.
pub(self) fn argint(n: usize) -> Result<i32, ()> {
    argraw(n)
}

/// Fetches the n-th argument as a pointer to a block of `size` bytes,
/// checking that the whole block lies within the process.
pub(self) fn argptr(n: usize, size: usize) -> Result<usize, ()> {
    let addr = argint(n)? as u32 as usize;
    let p = myproc().expect("argptr");
    // SAFETY: we are the current process.
    let sz = unsafe { p.data() }.sz;
    if addr >= sz || addr.wrapping_add(size) > sz {
        return Err(());
    }
    Ok(addr)
}

/// Fetches the n-th argument as a NUL-terminated string.
pub(self) fn argstr(n: usize) -> Result<&'static CStr, ()> {
    fetch_str(argint(n)? as u32 as usize)
}

/// Fetches the n-th argument as a file descriptor, resolving it to the
/// open-file object.
pub(self) fn argfd(n: usize) -> Result<(usize, &'static File), ()> {
    let fd = argint(n)?;
    if !(0..NOFILE as i32).contains(&fd) {
        return Err(());
    }
    let fd = fd as usize;
    let p = myproc().expect("argfd");
    // SAFETY: we are the current process.
    let f = unsafe { p.data() }.open_files[fd].as_ref().ok_or(())?;
    // SAFETY: only this process can close its descriptors, and it is busy
    // executing this system call; the file outlives the call.
    Ok((fd, unsafe { &*(&**f as *const File) }))
}

/// Decodes the system-call number from the trap frame, runs the handler,
/// and stores the result in the frame's %eax slot (-1 on any error).
pub fn syscall() {
    let p = myproc().expect("syscall");
    // SAFETY: we are the current process; the trap frame was saved on
    // syscall entry.
    let tf = unsafe { &mut *p.data().trap_frame };

    let r = match tf.eax {
        1 => sys_fork(),
        2 => sys_exit(),
        3 => sys_wait(),
        4 => sys_pipe(),
        5 => sys_read(),
        6 => sys_kill(),
        7 => sys_exec(),
        8 => sys_fstat(),
        9 => sys_chdir(),
        10 => sys_dup(),
        11 => sys_getpid(),
        12 => sys_sbrk(),
        13 => sys_sleep(),
        14 => sys_uptime(),
        15 => sys_open(),
        16 => sys_write(),
        17 => sys_mknod(),
        18 => sys_unlink(),
        19 => sys_link(),
        20 => sys_mkdir(),
        21 => sys_close(),
        num => {
            // SAFETY: own process name, for display.
            let name = unsafe { &p.data().name };
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            println!(
                "{} {}: unknown sys call {}",
                p.pid(),
                core::str::from_utf8(&name[..len]).unwrap_or("???"),
                num
            );
            Err(())
        }
    };

    tf.eax = match r {
        Ok(v) => v as u32,
        Err(()) => -1i32 as u32,
    };
}

//! Process-related system calls.

use super::argint;
use crate::kernel::kernel;
use crate::proc::{grow_current, myproc};

pub(super) fn sys_fork() -> Result<usize, ()> {
    kernel().procs.fork().map(|pid| pid as usize)
}

pub(super) fn sys_exit() -> Result<usize, ()> {
    kernel().procs.exit_current()
}

pub(super) fn sys_wait() -> Result<usize, ()> {
    kernel().procs.wait().map(|pid| pid as usize)
}

pub(super) fn sys_kill() -> Result<usize, ()> {
    let pid = argint(0)?;
    kernel().procs.kill(pid).map(|()| 0)
}

pub(super) fn sys_getpid() -> Result<usize, ()> {
    Ok(myproc().expect("sys_getpid").pid() as usize)
}

pub(super) fn sys_sbrk() -> Result<usize, ()> {
    let n = argint(0)?;
    let p = myproc().expect("sys_sbrk");
    // SAFETY: we are the current process.
    let addr = unsafe { p.data() }.sz;
    grow_current(n)?;
    Ok(addr)
}

pub(super) fn sys_sleep() -> Result<usize, ()> {
    let n = argint(0)?;
    if n < 0 {
        return Err(());
    }
    let n = n as u32;

    let p = myproc().expect("sys_sleep");
    let mut ticks = kernel().ticks.lock();
    let ticks0 = *ticks;
    while ticks.wrapping_sub(ticks0) < n {
        if p.killed() {
            return Err(());
        }
        ticks.sleep();
    }
    Ok(0)
}

/// Returns how many clock tick interrupts have occurred since start.
pub(super) fn sys_uptime() -> Result<usize, ()> {
    Ok(*kernel().ticks.lock() as usize)
}

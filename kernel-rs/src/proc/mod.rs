//! Processes: per-process state and the process table.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::cpu;
use crate::file::RcFile;
use crate::fs::RcInode;
use crate::param::{MAXPROCNAME, NOFILE};
use crate::trap::TrapFrame;
use crate::vm::PageTable;

mod procs;
mod wait_channel;

pub use procs::{sched, yield_, Procs};
pub use wait_channel::{WaitChannel, Waitable};

pub type Pid = i32;

/// Saved registers for kernel context switches.
///
/// Doesn't need to save all the segment registers (%cs, etc.), because they
/// are constant across kernel contexts. Doesn't need to save %eax, %ecx,
/// %edx, because the x86 convention is that the caller has saved them.
/// Contexts are stored at the bottom of the stack they describe; the stack
/// pointer is the address of the context. The layout of the context matches
/// the layout of the stack in swtch at the "Switch stacks" comment.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

impl Context {
    pub const fn zero() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebx: 0,
            ebp: 0,
            eip: 0,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    fn as_str(&self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// The process-table lock must be held while using these.
pub struct ProcInfo {
    /// Process state.
    pub state: ProcState,

    /// If Sleeping, the channel slept on; null otherwise.
    pub waitchannel: *const WaitChannel,

    /// Process ID.
    pub pid: Pid,

    /// Parent process: a relation, never ownership. Null for the initial
    /// process and for unused slots.
    pub parent: *const Proc,
}

/// Private to the process, so the process-table lock need not be held.
pub struct ProcData {
    /// Bottom of the kernel stack for this process.
    pub kstack: usize,

    /// Size of process memory (bytes).
    pub sz: usize,

    /// Page table.
    pub pgdir: Option<PageTable>,

    /// Trap frame for the current syscall, on the kernel stack.
    pub trap_frame: *mut TrapFrame,

    /// swtch() here to run the process.
    pub context: *mut Context,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Current directory.
    pub cwd: Option<RcInode>,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            pgdir: None,
            trap_frame: ptr::null_mut(),
            context: ptr::null_mut(),
            open_files: array![_ => None; NOFILE],
            cwd: None,
            name: [0; MAXPROCNAME],
        }
    }
}

/// Per-process state.
///
/// # Safety
///
/// * `info` is only accessed while the process-table lock is held, except
///   that the current process may read its own `pid` and `state`.
/// * `data` is only accessed by the process itself while it runs, or by
///   whoever set the slot to Embryo/reaps the Zombie (under the table lock,
///   when the process cannot run).
pub struct Proc {
    info: UnsafeCell<ProcInfo>,
    data: UnsafeCell<ProcData>,

    /// Channel the parent sleeps on in wait(); signalled when a child of
    /// this process exits.
    pub child_waitchannel: WaitChannel,

    /// If true, the process has been killed.
    killed: AtomicBool,
}

// SAFETY: see the struct invariant.
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn zero() -> Self {
        Self {
            info: UnsafeCell::new(ProcInfo {
                state: ProcState::Unused,
                waitchannel: ptr::null(),
                pid: 0,
                parent: ptr::null(),
            }),
            data: UnsafeCell::new(ProcData::new()),
            child_waitchannel: WaitChannel::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// # Safety
    ///
    /// The process-table lock must be held, or the caller must be the
    /// current process reading its own state.
    pub unsafe fn info(&self) -> &ProcInfo {
        &*self.info.get()
    }

    /// # Safety
    ///
    /// The process-table lock must be held.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn info_mut(&self) -> &mut ProcInfo {
        &mut *self.info.get()
    }

    /// # Safety
    ///
    /// The caller must be the current process, or the slot must be under
    /// exclusive setup/teardown (Embryo or reaped Zombie).
    pub unsafe fn data(&self) -> &ProcData {
        &*self.data.get()
    }

    /// # Safety
    ///
    /// See `Proc::data`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        &mut *self.data.get()
    }

    /// The process's pid. Stable while the caller legitimately holds a
    /// reference to a live process.
    pub fn pid(&self) -> Pid {
        // SAFETY: reading one aligned i32; the pid of a live process only
        // changes when the slot is recycled.
        unsafe { self.info() }.pid
    }

    /// Marks the process killed; it won't exit until it returns to user
    /// space or wakes from a sleep.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    fn clear_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }
}

/// The process running on this CPU, if any.
pub fn myproc() -> Option<&'static Proc> {
    cpu::push_off();
    let p = cpu::mycpu().current_proc();
    cpu::pop_off();
    if p.is_null() {
        None
    } else {
        // SAFETY: the process table is static; a non-null current-proc
        // pointer refers to the slot this thread is running in.
        Some(unsafe { &*p })
    }
}

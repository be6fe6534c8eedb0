//! The process table, the per-CPU scheduler, and the process lifecycle.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use itertools::izip;

use super::{myproc, Context, Pid, Proc, ProcState, WaitChannel};
use crate::cpu::mycpu;
use crate::fs::Path;
use crate::kernel::kernel;
use crate::lock::{new_spinlock, SpinLock};
use crate::mmu::{DPL_USER, FL_IF, PGSIZE, SEG_UCODE, SEG_UDATA};
use crate::page::Page;
use crate::param::{KSTACKSIZE, NOFILE, NPROC, ROOTDEV};
use crate::{print, println};
use crate::trap::TrapFrame;
use crate::vm;
use crate::x86::{intr_get, sti};

core::arch::global_asm!(
    r#"
# Context switch
#
#   void swtch(struct context **old, struct context *new);
#
# Save the current registers on the stack, creating
# a struct context, and save its address in *old.
# Switch stacks to new and pop previously-saved registers.

.globl swtch
swtch:
  movl 4(%esp), %eax
  movl 8(%esp), %edx

  # Save old callee-saved registers
  pushl %ebp
  pushl %ebx
  pushl %esi
  pushl %edi

  # Switch stacks
  movl %esp, (%eax)
  movl %edx, %esp

  # Load new callee-saved registers
  popl %edi
  popl %esi
  popl %ebx
  popl %ebp
  ret
"#,
    options(att_syntax)
);

extern "C" {
    fn swtch(old: *mut *mut Context, new: *mut Context);

    // trap.rs, at the tail of alltraps.
    fn trapret();
}

/// The first user program, which execs /init. Assembled from:
///
/// ```text
/// start:
///   pushl $argv; pushl $init; pushl $0
///   movl $SYS_exec, %eax; int $T_SYSCALL
/// exit:
///   movl $SYS_exit, %eax; int $T_SYSCALL; jmp exit
/// init: .string "/init\0"
/// argv: .long init, 0
/// ```
const INITCODE: [u8; 44] = [
    0x68, 0x24, 0x00, 0x00, 0x00, // pushl $argv
    0x68, 0x1c, 0x00, 0x00, 0x00, // pushl $init
    0x6a, 0x00, // pushl $0
    0xb8, 0x07, 0x00, 0x00, 0x00, // movl $SYS_exec, %eax
    0xcd, 0x40, // int $T_SYSCALL
    0xb8, 0x02, 0x00, 0x00, 0x00, // movl $SYS_exit, %eax
    0xcd, 0x40, // int $T_SYSCALL
    0xeb, 0xf7, // jmp exit
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, // "/init\0"
    0x00, 0x00, // padding
    0x1c, 0x00, 0x00, 0x00, // argv[0] = init
    0x00, 0x00, 0x00, 0x00, // argv[1] = 0
];

struct ProcsShared {
    /// Next pid to hand out; monotonically increasing.
    nextpid: Pid,

    /// The init process, target of reparenting.
    initial_proc: *const Proc,
}

// SAFETY: only reachable through the table lock.
unsafe impl Send for ProcsShared {}

/// The process table: a fixed array of slots behind a single lock. Every
/// state transition happens under the lock.
pub struct Procs {
    lock: SpinLock<ProcsShared>,
    pool: [Proc; NPROC],
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            lock: new_spinlock(
                "ptable",
                ProcsShared {
                    nextpid: 1,
                    initial_proc: ptr::null(),
                },
            ),
            pool: array![_ => Proc::zero(); NPROC],
        }
    }

    /// The identity of the table lock; `sleep` uses it to avoid
    /// re-acquiring the lock it already holds.
    pub fn lock_addr(&self) -> usize {
        self.lock.raw_addr()
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// # Safety
    ///
    /// Must be paired with `release_lock`.
    pub unsafe fn acquire_lock(&self) {
        self.lock.acquire();
    }

    /// # Safety
    ///
    /// The lock must be held via `acquire_lock` (or inherited from the
    /// scheduler, as in forkret).
    pub unsafe fn release_lock(&self) {
        self.lock.unlock();
    }

    /// Looks in the process table for an Unused slot. If found, changes
    /// state to Embryo and initializes the kernel stack so that the first
    /// scheduling returns through the trap-return path. Otherwise, or if the
    /// stack allocation fails, returns Err.
    fn alloc(&self) -> Result<&Proc, ()> {
        let mut guard = self.lock.lock();

        let mut found = None;
        for p in &self.pool {
            // SAFETY: the table lock is held.
            if unsafe { p.info() }.state == ProcState::Unused {
                found = Some(p);
                break;
            }
        }
        let p = found.ok_or(())?;
        // SAFETY: the table lock is held.
        let info = unsafe { p.info_mut() };
        info.state = ProcState::Embryo;
        info.pid = guard.nextpid;
        guard.nextpid += 1;
        drop(guard);

        // Allocate kernel stack.
        let Some(page) = kernel().kmem.alloc() else {
            let _guard = self.lock.lock();
            // SAFETY: the table lock is held.
            unsafe { p.info_mut() }.state = ProcState::Unused;
            return Err(());
        };

        // SAFETY: the slot is Embryo; we are the only one setting it up.
        let data = unsafe { p.data_mut() };
        data.kstack = page.into_usize();
        let mut sp = data.kstack + KSTACKSIZE;

        // Leave room for the trap frame.
        sp -= mem::size_of::<TrapFrame>();
        data.trap_frame = sp as *mut TrapFrame;

        // Set up the new context to start executing at forkret, which
        // returns to trapret.
        sp -= mem::size_of::<u32>();
        // SAFETY: sp points into the freshly allocated kernel stack.
        unsafe { *(sp as *mut u32) = trapret as usize as u32 };

        sp -= mem::size_of::<Context>();
        data.context = sp as *mut Context;
        // SAFETY: sp points into the freshly allocated kernel stack.
        unsafe {
            ptr::write(data.context, Context::zero());
            (*data.context).eip = forkret as usize as u32;
        }

        Ok(p)
    }

    /// Sets up the first user process.
    pub fn user_proc_init(&self) {
        let p = self.alloc().expect("userinit: out of processes");

        // SAFETY: the slot is Embryo; we are the only one setting it up.
        let data = unsafe { p.data_mut() };
        let mut pgdir = vm::setupkvm().expect("userinit: out of memory?");
        pgdir.init_user(&INITCODE);
        data.pgdir = Some(pgdir);
        data.sz = PGSIZE;

        // SAFETY: trap_frame was set by alloc().
        let tf = unsafe { &mut *data.trap_frame };
        *tf = TrapFrame::zero();
        tf.cs = (SEG_UCODE << 3) as u16 | DPL_USER;
        tf.ds = (SEG_UDATA << 3) as u16 | DPL_USER;
        tf.es = tf.ds;
        tf.ss = tf.ds;
        tf.eflags = FL_IF;
        tf.esp = PGSIZE as u32;
        tf.eip = 0; // beginning of initcode

        let name = b"initcode\x00";
        data.name[..name.len()].copy_from_slice(name);
        data.cwd = Some(Path::root().namei().expect("userinit: namei /"));

        // This assignment to state lets other cores run this process. The
        // acquire of the lock also serves as a barrier for the writes
        // above.
        let mut guard = self.lock.lock();
        guard.initial_proc = p;
        // SAFETY: the table lock is held.
        let info = unsafe { p.info_mut() };
        info.parent = ptr::null();
        info.state = ProcState::Runnable;
        drop(guard);
    }

    /// Creates a new process copying the current one as the parent. Sets up
    /// the child's kernel stack to return as if from the fork() system
    /// call. Returns the child's pid.
    pub fn fork(&self) -> Result<Pid, ()> {
        let p = myproc().expect("fork");
        let np = self.alloc()?;

        // SAFETY: we are the current process; np is our Embryo.
        let (data, npdata) = unsafe { (p.data(), np.data_mut()) };

        // Copy the process state.
        let Some(pgdir) = data.pgdir.as_ref().unwrap().copy_user(data.sz) else {
            // SAFETY: np's stack was set by alloc() and np cannot run yet.
            kernel()
                .kmem
                .free(unsafe { Page::from_usize(npdata.kstack) });
            npdata.kstack = 0;
            let _guard = self.lock.lock();
            // SAFETY: the table lock is held.
            unsafe { np.info_mut() }.state = ProcState::Unused;
            return Err(());
        };
        npdata.pgdir = Some(pgdir);
        npdata.sz = data.sz;
        // SAFETY: both trap frames live on their kernel stacks.
        unsafe { *npdata.trap_frame = *data.trap_frame };

        // Clear %eax so that fork returns 0 in the child.
        // SAFETY: np's trap frame was just initialized.
        unsafe { (*npdata.trap_frame).eax = 0 };

        // Increment reference counts on open file descriptors.
        for (nf, f) in izip!(npdata.open_files.iter_mut(), data.open_files.iter()) {
            if let Some(file) = f {
                *nf = Some(file.clone());
            }
        }
        npdata.cwd = data.cwd.clone();
        npdata.name = data.name;

        let pid = np.pid();

        let _guard = self.lock.lock();
        // SAFETY: the table lock is held.
        let info = unsafe { np.info_mut() };
        info.parent = p;
        info.state = ProcState::Runnable;

        Ok(pid)
    }

    /// Exits the current process. Does not return. An exited process
    /// remains in the Zombie state until its parent calls wait().
    pub fn exit_current(&self) -> ! {
        let p = myproc().expect("exit");

        // SAFETY: we are the current process.
        let data = unsafe { p.data_mut() };

        // Close all open files.
        for fd in 0..NOFILE {
            let _ = data.open_files[fd].take();
        }

        let fs = &kernel().file_system;
        fs.begin_op();
        data.cwd = None;
        fs.end_op();

        let guard = self.lock.lock();
        assert!(
            !ptr::eq(p, guard.initial_proc),
            "init exiting"
        );

        // SAFETY: the table lock is held.
        unsafe {
            // Parent might be sleeping in wait().
            let parent = p.info().parent;
            self.wakeup1(&(*parent).child_waitchannel);

            // Pass abandoned children to init.
            let init = guard.initial_proc;
            for q in &self.pool {
                if q.info().parent == p as *const Proc {
                    q.info_mut().parent = init;
                    if q.info().state == ProcState::Zombie {
                        self.wakeup1(&(*init).child_waitchannel);
                    }
                }
            }

            // Jump into the scheduler, never to return.
            p.info_mut().state = ProcState::Zombie;
            sched();
        }
        // `guard` is still alive here by construction, but sched() never
        // comes back for a zombie.
        drop(guard);
        unreachable!("zombie exit");
    }

    /// Waits for a child process to exit, returning its pid. Returns Err if
    /// this process has no children.
    pub fn wait(&self) -> Result<Pid, ()> {
        let p = myproc().expect("wait");
        let mut guard = self.lock.lock();

        loop {
            // Scan through the table looking for exited children.
            let mut havekids = false;
            for np in &self.pool {
                // SAFETY: the table lock is held.
                let info = unsafe { np.info_mut() };
                if info.parent != p as *const Proc {
                    continue;
                }
                havekids = true;
                if info.state == ProcState::Zombie {
                    // Found one; reap it.
                    let pid = info.pid;
                    // SAFETY: a zombie cannot run; teardown is exclusive.
                    let npdata = unsafe { np.data_mut() };
                    kernel()
                        .kmem
                        // SAFETY: the stack was allocated in alloc().
                        .free(unsafe { Page::from_usize(npdata.kstack) });
                    npdata.kstack = 0;
                    npdata.pgdir.take().unwrap().free();
                    npdata.name[0] = 0;
                    npdata.sz = 0;
                    info.pid = 0;
                    info.parent = ptr::null();
                    info.state = ProcState::Unused;
                    np.clear_killed();
                    return Ok(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || p.killed() {
                return Err(());
            }

            // Wait for children to exit. The guard is the table lock, so
            // sleep() releases exactly it.
            p.child_waitchannel.sleep(&mut guard);
        }
    }

    /// Wakes up all processes sleeping on `chan`. The table lock must be
    /// held.
    ///
    /// # Safety
    ///
    /// The process-table lock must be held.
    pub unsafe fn wakeup1(&self, chan: *const WaitChannel) {
        for p in &self.pool {
            let info = p.info_mut();
            if info.state == ProcState::Sleeping && info.waitchannel == chan {
                info.state = ProcState::Runnable;
            }
        }
    }

    /// Wakes up all processes sleeping on `chan`.
    pub fn wakeup(&self, chan: *const WaitChannel) {
        let _guard = self.lock.lock();
        // SAFETY: the table lock is held.
        unsafe { self.wakeup1(chan) };
    }

    /// Kills the process with the given pid. The victim won't exit until it
    /// tries to return to user space or wakes from a sleep.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        let _guard = self.lock.lock();
        for p in &self.pool {
            // SAFETY: the table lock is held.
            let info = unsafe { p.info_mut() };
            if info.pid == pid && info.state != ProcState::Unused {
                p.kill();
                // Wake the process from sleep so it notices the flag.
                if info.state == ProcState::Sleeping {
                    info.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Per-CPU process scheduler. Each CPU calls this after setting itself
    /// up; it never returns. It loops, doing:
    ///  - choose a process to run
    ///  - swtch to start running that process
    ///  - eventually that process transfers control back via swtch
    pub fn scheduler(&self) -> ! {
        let c = mycpu();
        c.set_proc(ptr::null());

        loop {
            // Enable interrupts on this processor.
            // SAFETY: not holding any lock here.
            unsafe { sti() };

            // Loop over the process table looking for a process to run.
            let guard = self.lock.lock();
            for p in &self.pool {
                // SAFETY: the table lock is held.
                if unsafe { p.info() }.state != ProcState::Runnable {
                    continue;
                }

                // Switch to chosen process. It is the process's job to
                // release the table lock and then reacquire it before
                // jumping back to us.
                c.set_proc(p);
                vm::switchuvm(p);
                // SAFETY: the table lock is held.
                unsafe { p.info_mut() }.state = ProcState::Running;

                // SAFETY: p's context was prepared by alloc() (or saved by
                // a previous sched()), and the scheduler context slot is
                // this CPU's.
                unsafe { swtch(c.scheduler.as_ptr(), p.data().context) };

                // Process is done running for now. It should have changed
                // its state before coming back.
                vm::switchkvm();
                c.set_proc(ptr::null());
            }
            drop(guard);
        }
    }

    /// Prints a process listing to the console. Runs when a user types ^P;
    /// no locks, to avoid wedging a stuck machine further.
    pub fn dump(&self) {
        println!();
        for p in &self.pool {
            // SAFETY: racy by design; only read for display.
            let info = unsafe { p.info() };
            if info.state == ProcState::Unused {
                continue;
            }
            // SAFETY: see above.
            let name = unsafe { &p.data().name };
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            print!(
                "{} {} {}",
                info.pid,
                info.state.as_str(),
                core::str::from_utf8(&name[..len]).unwrap_or("???")
            );
            if info.state == ProcState::Sleeping {
                // Show where a sleeping process is waiting.
                // SAFETY: racy by design; getcallerpcs rejects junk chains.
                let ebp = unsafe { (*p.data().context).ebp } as usize;
                let mut pcs = [0usize; 10];
                crate::x86::getcallerpcs(ebp, &mut pcs);
                for pc in pcs.iter().take_while(|&&pc| pc != 0) {
                    print!(" {:x}", pc);
                }
            }
            println!();
        }
    }
}

/// Enters the scheduler. Must be called with the process-table lock held
/// and the current process's state already changed from Running.
///
/// Saves and restores `intena` because it is a property of this kernel
/// thread, not this CPU. (It would be proc.intena and proc.ncli, but that
/// would break in the few places where a lock is held but there is no
/// process.)
///
/// # Safety
///
/// The process-table lock must be held exactly once (ncli == 1), and the
/// caller must be the current process.
pub unsafe fn sched() {
    let p = myproc().expect("sched");
    assert!(kernel().procs.holding(), "sched ptable.lock");
    assert_eq!(mycpu().ncli(), 1, "sched locks");
    assert_ne!(p.info().state, ProcState::Running, "sched running");
    assert!(!intr_get(), "sched interruptible");

    let intena = mycpu().intena();
    swtch(&mut (*p.data.get()).context, mycpu().scheduler.get());
    // This thread may have moved to another CPU.
    mycpu().set_intena(intena);
}

/// Gives up the CPU for one scheduling round.
pub fn yield_() {
    let p = myproc().expect("yield");
    let guard = kernel().procs.lock.lock();
    // SAFETY: the table lock is held.
    unsafe { p.info_mut() }.state = ProcState::Runnable;
    // SAFETY: lock held once, state changed.
    unsafe { sched() };
    drop(guard);
}

/// A fork child's very first scheduling by scheduler() will swtch here.
extern "C" fn forkret() {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding the process-table lock from scheduler.
    // SAFETY: inherited from the scheduler's guard.
    unsafe { kernel().procs.release_lock() };

    if FIRST.swap(false, Ordering::AcqRel) {
        // Some initialization functions must be run in the context of a
        // regular process (e.g., they call sleep), and thus cannot be run
        // from main().
        kernel().file_system.init(ROOTDEV);
    }

    // Return to trapret, whose address alloc() left on the stack.
}

/// Grows (or shrinks, for negative `n`) the current process's memory by `n`
/// bytes.
pub fn grow_current(n: i32) -> Result<(), ()> {
    let p = myproc().expect("growproc");
    // SAFETY: we are the current process.
    let data = unsafe { p.data_mut() };
    let pgdir = data.pgdir.as_mut().unwrap();

    let sz = data.sz;
    let sz = if n > 0 {
        pgdir.alloc_user(sz, sz + n as usize)?
    } else if n < 0 {
        let dec = -(n as isize) as usize;
        if dec > sz {
            return Err(());
        }
        pgdir.dealloc_user(sz, sz - dec)
    } else {
        sz
    };
    data.sz = sz;
    vm::switchuvm(p);
    Ok(())
}

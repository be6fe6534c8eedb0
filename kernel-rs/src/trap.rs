//! Trap handling: the 256-entry IDT, the vector stubs, the unified trap
//! frame, and the dispatcher for exceptions, device interrupts, and the
//! system-call gate.

// The canonical trap-number set is kept whole, used or not.
#![allow(dead_code)]

use core::cell::UnsafeCell;

use crate::cpu::cpuid;
use crate::kernel::kernel;
use crate::lapic;
use crate::mmu::{GateDesc, DPL_USER, SEG_KCODE};
use crate::proc::{myproc, yield_, ProcState};
use crate::x86::rcr2;
use crate::{kbd, println, syscall, uart};

// x86 trap and interrupt constants.

/// Divide error.
pub const T_DIVIDE: u32 = 0;
/// Debug exception.
pub const T_DEBUG: u32 = 1;
/// Non-maskable interrupt.
pub const T_NMI: u32 = 2;
/// Breakpoint.
pub const T_BRKPT: u32 = 3;
/// Overflow.
pub const T_OFLOW: u32 = 4;
/// Bounds check.
pub const T_BOUND: u32 = 5;
/// Illegal opcode.
pub const T_ILLOP: u32 = 6;
/// Device not available.
pub const T_DEVICE: u32 = 7;
/// Double fault.
pub const T_DBLFLT: u32 = 8;
/// Invalid task switch segment.
pub const T_TSS: u32 = 10;
/// Segment not present.
pub const T_SEGNP: u32 = 11;
/// Stack exception.
pub const T_STACK: u32 = 12;
/// General protection fault.
pub const T_GPFLT: u32 = 13;
/// Page fault.
pub const T_PGFLT: u32 = 14;
/// Floating point error.
pub const T_FPERR: u32 = 16;
/// Alignment check.
pub const T_ALIGN: u32 = 17;
/// Machine check.
pub const T_MCHK: u32 = 18;
/// SIMD floating point error.
pub const T_SIMDERR: u32 = 19;

/// System call; chosen not to overlap processor-defined exceptions or
/// hardware interrupt vectors.
pub const T_SYSCALL: u32 = 64;

/// Base for hardware interrupt vectors: the first available number after
/// the processor-reserved exceptions.
pub const T_IRQ0: u32 = 32;

pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_COM1: u32 = 4;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_ERROR: u32 = 19;
pub const IRQ_SPURIOUS: u32 = 31;

const T_TIMER: u32 = T_IRQ0 + IRQ_TIMER;
const T_KBD: u32 = T_IRQ0 + IRQ_KBD;
const T_COM1: u32 = T_IRQ0 + IRQ_COM1;
const T_IDE: u32 = T_IRQ0 + IRQ_IDE;
const T_IDE2: u32 = T_IRQ0 + IRQ_IDE + 1;
const T_LPT: u32 = T_IRQ0 + 7;
const T_SPUR: u32 = T_IRQ0 + IRQ_SPURIOUS;

// Vector stubs: every vector pushes its number (and a fake error code for
// traps where the hardware does not push one), then converges on alltraps,
// which finishes building the trap frame and calls trap(). The error-code
// traps are 8, 10-14, and 17.
core::arch::global_asm!(
    r#"
.altmacro
.macro vector num
.align 4
.globl vector\num
vector\num:
  .if (\num == 8) || ((\num >= 10) && (\num <= 14)) || (\num == 17)
  .else
  pushl $0
  .endif
  pushl $\num
  jmp alltraps
.endm

.text
.set i, 0
.rept 256
  vector %i
  .set i, i+1
.endr

.globl alltraps
alltraps:
  # Build trap frame.
  pushl %ds
  pushl %es
  pushl %fs
  pushl %gs
  pushal

  # Set up data segments.
  movw $(2<<3), %ax   # SEG_KDATA<<3
  movw %ax, %ds
  movw %ax, %es

  # Call trap(tf), where tf=%esp
  pushl %esp
  call trap
  addl $4, %esp

  # Return falls through to trapret...
.globl trapret
trapret:
  popal
  popl %gs
  popl %fs
  popl %es
  popl %ds
  addl $0x8, %esp  # trapno and errcode
  iret

# Table of vector stub addresses, indexed by vector number.
.macro ventry num
  .long vector\num
.endm

.section .rodata
.globl vectors
vectors:
.set i, 0
.rept 256
  ventry %i
  .set i, i+1
.endr
.text
"#,
    options(att_syntax)
);

extern "C" {
    /// Stub addresses, one per vector; built in the assembly above.
    static vectors: [u32; 256];
}

/// Layout of the trap frame built on the kernel stack by the hardware and
/// by the vector stubs + alltraps, and passed to trap().
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    // Registers as pushed by pushal.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Useless: the pushal-time %esp, ignored by popal.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // Rest of trap frame.
    pub gs: u16,
    padding1: u16,
    pub fs: u16,
    padding2: u16,
    pub es: u16,
    padding3: u16,
    pub ds: u16,
    padding4: u16,
    pub trapno: u32,

    // Below here defined by x86 hardware.
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    padding5: u16,
    pub eflags: u32,

    // Below here only when crossing rings, such as from user to kernel.
    pub esp: u32,
    pub ss: u16,
    padding6: u16,
}

impl TrapFrame {
    pub const fn zero() -> Self {
        // SAFETY: TrapFrame is plain old data; all-zeroes is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

struct Idt(UnsafeCell<[GateDesc; 256]>);

// SAFETY: written once in tvinit() while only the boot CPU runs; read-only
// afterwards.
unsafe impl Sync for Idt {}

static IDT: Idt = Idt(UnsafeCell::new([GateDesc::zero(); 256]));

/// Builds the interrupt descriptor table. The system-call gate is the one
/// vector user code may invoke directly, and it is a trap gate (interrupts
/// stay enabled).
pub fn tvinit() {
    // SAFETY: boot-time, single-threaded; `vectors` is a static table.
    unsafe {
        let idt = &mut *IDT.0.get();
        for (i, gate) in idt.iter_mut().enumerate() {
            *gate = GateDesc::new(false, (SEG_KCODE << 3) as u16, vectors[i], 0);
        }
        idt[T_SYSCALL as usize] = GateDesc::new(
            true,
            (SEG_KCODE << 3) as u16,
            vectors[T_SYSCALL as usize],
            DPL_USER,
        );
    }
}

/// Loads the IDT on this CPU.
pub fn idtinit() {
    // SAFETY: the IDT was built by tvinit().
    unsafe {
        crate::x86::lidt(
            IDT.0.get() as *const u8,
            core::mem::size_of::<[GateDesc; 256]>() as u16,
        )
    };
}

/// The unified handler every vector converges on.
#[no_mangle]
pub extern "C" fn trap(tf: &mut TrapFrame) {
    if tf.trapno == T_SYSCALL {
        let p = myproc().expect("syscall from no process");
        if p.killed() {
            kernel().procs.exit_current();
        }
        // SAFETY: we are the current process.
        unsafe { p.data_mut().trap_frame = tf };
        syscall::syscall();
        if p.killed() {
            kernel().procs.exit_current();
        }
        return;
    }

    match tf.trapno {
        T_TIMER => {
            if cpuid() == 0 {
                let mut ticks = kernel().ticks.lock();
                *ticks = ticks.wrapping_add(1);
                ticks.wakeup();
            }
            lapic::eoi();
        }
        T_IDE => {
            kernel().ide.intr();
            lapic::eoi();
        }
        T_IDE2 => {
            // Bochs generates spurious IDE1 interrupts.
        }
        T_KBD => {
            kbd::intr();
            lapic::eoi();
        }
        T_COM1 => {
            uart::intr();
            lapic::eoi();
        }
        T_LPT | T_SPUR => {
            println!(
                "cpu{}: spurious interrupt at {:x}:{:x}",
                cpuid(),
                tf.cs,
                tf.eip
            );
            lapic::eoi();
        }
        _ => {
            let Some(p) = myproc().filter(|_| tf.cs & 3 != 0) else {
                // In the kernel, it must be our mistake.
                panic!(
                    "unexpected trap {} from cpu {} eip {:x} (cr2=0x{:x})",
                    tf.trapno,
                    cpuid(),
                    tf.eip,
                    rcr2()
                );
            };
            // In user space, assume the process misbehaved.
            println!(
                "pid {} {}: trap {} err {} on cpu {} eip 0x{:x} addr 0x{:x}--kill proc",
                p.pid(),
                // SAFETY: own process name, for display.
                core::str::from_utf8(unsafe { &p.data().name })
                    .unwrap_or("???")
                    .trim_end_matches('\0'),
                tf.trapno,
                tf.err,
                cpuid(),
                tf.eip,
                rcr2()
            );
            p.kill();
        }
    }

    let Some(p) = myproc() else { return };

    // Force process exit if it has been killed and is in user space. (If it
    // is still executing in the kernel, let it keep running until it gets
    // to the regular system call return.)
    if p.killed() && tf.cs & 3 == DPL_USER as u16 {
        kernel().procs.exit_current();
    }

    // Force process to give up CPU on clock tick. If interrupts were on
    // while locks held, would need to check nlock.
    // SAFETY: the current process observing its own state.
    if unsafe { p.info() }.state == ProcState::Running && tf.trapno == T_TIMER {
        yield_();
    }

    // Check if the process has been killed since we yielded.
    if p.killed() && tf.cs & 3 == DPL_USER as u16 {
        kernel().procs.exit_current();
    }
}

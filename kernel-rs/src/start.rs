//! Boot entry points: the multiboot header, the boot-processor entry that
//! turns on paging and jumps to main() in the high half, and the real-mode
//! bootstrap the application processors start in.

use crate::memlayout::KERNBASE;
use crate::mmu::NPDENTRIES;

/// The boot page directory, used until the real kernel page table is
/// built: two 4 MiB PSE entries map the first 4 MiB of physical memory both
/// at virtual 0 (where the entry code runs) and at KERNBASE.
#[repr(C, align(4096))]
pub struct EntryPgDir(pub [u32; NPDENTRIES]);

// PTE_P | PTE_W | PTE_PS
const ENTRY_FLAGS: u32 = 0x001 | 0x002 | 0x080;

#[no_mangle]
pub static entrypgdir: EntryPgDir = {
    let mut dir = [0u32; NPDENTRIES];
    // Map VA [0, 4MB) to PA [0, 4MB)
    dir[0] = ENTRY_FLAGS;
    // Map VA [KERNBASE, KERNBASE+4MB) to PA [0, 4MB)
    dir[KERNBASE >> 22] = ENTRY_FLAGS;
    EntryPgDir(dir)
};

core::arch::global_asm!(
    r#"
# The loader is multiboot-compliant (e.g. GNU GRUB, or qemu -kernel).

.section .multiboot, "a"
.p2align 2
multiboot_header:
  .long 0x1BADB002                 # magic
  .long 0                          # flags
  .long -0x1BADB002                # checksum

.text

# By convention, the _start symbol specifies the ELF entry point.
# Since virtual memory isn't set up yet, _start is the physical
# address of entry.
.globl _start
.set _start, entry - 0x80000000

# Entering the kernel on the boot processor, with paging off.
.globl entry
entry:
  # Turn on page size extension for 4Mbyte pages
  movl %cr4, %eax
  orl  $0x10, %eax                 # CR4_PSE
  movl %eax, %cr4
  # Set page directory
  movl $entrypgdir, %eax
  subl $0x80000000, %eax           # V2P
  movl %eax, %cr3
  # Turn on paging.
  movl %cr0, %eax
  orl  $0x80010000, %eax           # CR0_PG | CR0_WP
  movl %eax, %cr0

  # Set up the stack pointer.
  movl $(boot_stack + 4096), %esp

  # Jump to main(), and switch to executing at
  # high addresses. The indirect call is needed because
  # the assembler produces a PC-relative instruction
  # for a direct jump.
  mov $main, %eax
  jmp *%eax

.comm boot_stack, 4096
"#,
    options(att_syntax)
);

core::arch::global_asm!(
    r#"
# Each non-boot CPU ("AP") starts here in real mode, responding to a
# STARTUP IPI with this code copied to 0x7000 (startothers() placed a
# stack pointer at apstart-4, the address of mpenter() at apstart-8, and
# the physical address of entrypgdir at apstart-12).

.section .entryother, "ax"
.code16
.globl apstart
apstart:
  cli

  # Zero data segment registers DS, ES, and SS.
  xorw %ax, %ax
  movw %ax, %ds
  movw %ax, %es
  movw %ax, %ss

  # Switch from real to protected mode. Use a bootstrap GDT that makes
  # virtual addresses map directly to physical addresses so that the
  # effective memory map doesn't change during the transition.
  lgdt gdtdesc
  movl %cr0, %eax
  orl  $1, %eax                    # CR0_PE
  movl %eax, %cr0

  # Complete the transition to 32-bit protected mode by using a long jmp
  # to reload %cs and %eip. The segment descriptors are set up with no
  # translation, so that the mapping is still the identity mapping.
  ljmpl $(1 << 3), $ap32           # SEG_KCODE

.code32
ap32:
  # Set up the protected-mode data segment registers
  movw $(2 << 3), %ax              # SEG_KDATA
  movw %ax, %ds
  movw %ax, %es
  movw %ax, %ss
  movw $0, %ax
  movw %ax, %fs
  movw %ax, %gs

  # Turn on page size extension for 4Mbyte pages
  movl %cr4, %eax
  orl  $0x10, %eax                 # CR4_PSE
  movl %eax, %cr4
  # Use entrypgdir as our initial page table
  movl (apstart - 12), %eax
  movl %eax, %cr3
  # Turn on paging.
  movl %cr0, %eax
  orl  $0x80010000, %eax           # CR0_PG | CR0_WP
  movl %eax, %cr0

  # Switch to the stack allocated by startothers()
  movl (apstart - 4), %esp
  # Call mpenter()
  call *(apstart - 8)

ap_spin:
  jmp ap_spin

.p2align 2
gdt:
  # null segment
  .word 0, 0
  .byte 0, 0, 0, 0
  # code segment
  .word 0xffff, 0
  .byte 0, 0x9a, 0xcf, 0
  # data segment
  .word 0xffff, 0
  .byte 0, 0x92, 0xcf, 0

gdtdesc:
  .word (gdtdesc - gdt - 1)
  .long gdt

.code32
.text
"#,
    options(att_syntax)
);

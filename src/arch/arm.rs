//! 32-bit ARM (EABI) register block and instruction encodings.
//!
//! Layout matches the kernel's `pt_regs` for ARM: r0..r15, cpsr, orig_r0.

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UserRegs {
    pub regs: [u32; 18],
}

pub const REG_SP: usize = 13;
pub const REG_PC: usize = 15;
pub const REG_CPSR: usize = 16;
pub const REG_ORIG_R0: usize = 17;

/// Syscall number lives in r7 (EABI); arguments in r0..r5; result in r0.
pub const SYSCALL_NR_REG: usize = 7;

/// The canonical ptrace breakpoint: a permanently-undefined instruction
/// (`udf`-class encoding used by the kernel's own `KPROBE_ARM_BREAKPOINT`),
/// little-endian.
pub const TRAP_INSN: &[u8] = &[0xf0, 0x01, 0xf0, 0xe7];

/// The fault reports the PC still on the trap instruction.
pub const TRAP_PC_REWIND: u64 = 0;

/// `svc 0`, little-endian.
pub const SYSCALL_INSN: &[u8] = &[0x00, 0x00, 0x00, 0xef];

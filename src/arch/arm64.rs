//! AArch64 register block and instruction encodings.
//!
//! Layout matches the kernel's `user_pt_regs`: x0..x30, then sp, pc,
//! pstate.

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UserRegs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// `brk #0`, little-endian.
pub const TRAP_INSN: &[u8] = &[0x00, 0x00, 0x20, 0xd4];

/// `brk` reports the PC still on the trap instruction.
pub const TRAP_PC_REWIND: u64 = 0;

/// `svc #0`, little-endian.
pub const SYSCALL_INSN: &[u8] = &[0x01, 0x00, 0x00, 0xd4];

/// Syscall number lives in x8; arguments in x0..x5; result in x0.
pub const SYSCALL_NR_REG: usize = 8;

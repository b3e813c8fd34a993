//! Per-ISA constants and register accessors.
//!
//! Everything the rest of the engine needs to know about an instruction set
//! lives behind `Arch` and `RegSnapshot`: trap encoding, how far the PC must
//! be rewound after a trap fires, and where the syscall number, arguments
//! and return value live in the register file. Adding an ISA means adding
//! one module here and one variant to each `match`; no other component
//! encodes ISA specifics.

pub mod arm;
pub mod arm64;
pub mod x86_64;

/// Target instruction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm,
    Arm64,
}

impl Arch {
    /// The ISA this build of the tracer runs on, which is the only ISA a
    /// native ptrace tracer can drive.
    pub fn native() -> Arch {
        #[cfg(target_arch = "x86_64")]
        {
            Arch::X86_64
        }
        #[cfg(target_arch = "arm")]
        {
            Arch::Arm
        }
        #[cfg(target_arch = "aarch64")]
        {
            Arch::Arm64
        }
    }

    /// Byte sequence whose execution raises a synchronous debug trap.
    pub fn trap_insn(self) -> &'static [u8] {
        match self {
            Arch::X86_64 => x86_64::TRAP_INSN,
            Arch::Arm => arm::TRAP_INSN,
            Arch::Arm64 => arm64::TRAP_INSN,
        }
    }

    pub fn trap_len(self) -> usize {
        self.trap_insn().len()
    }

    /// How far the reported PC sits past the trap instruction when the trap
    /// fires. Zero on ISAs where the fault leaves the PC on the trap.
    pub fn pc_rewind_after_trap(self) -> u64 {
        match self {
            Arch::X86_64 => x86_64::TRAP_PC_REWIND,
            Arch::Arm => arm::TRAP_PC_REWIND,
            Arch::Arm64 => arm64::TRAP_PC_REWIND,
        }
    }

    /// Byte sequence of the ISA's syscall instruction, as scribbled by the
    /// injector.
    pub fn syscall_insn(self) -> &'static [u8] {
        match self {
            Arch::X86_64 => x86_64::SYSCALL_INSN,
            Arch::Arm => arm::SYSCALL_INSN,
            Arch::Arm64 => arm64::SYSCALL_INSN,
        }
    }

    pub fn pointer_width(self) -> usize {
        match self {
            Arch::X86_64 | Arch::Arm64 => 8,
            Arch::Arm => 4,
        }
    }

    /// A zeroed register block of the right shape for this ISA.
    pub fn empty_regs(self) -> RegSnapshot {
        match self {
            Arch::X86_64 => RegSnapshot::X86_64(Default::default()),
            Arch::Arm => RegSnapshot::Arm(Default::default()),
            Arch::Arm64 => RegSnapshot::Arm64(Default::default()),
        }
    }
}

/// Immutable configuration selecting the architecture-traits implementation
/// for a debugging session.
#[derive(Clone, Copy, Debug)]
pub struct TargetDescription {
    pub arch: Arch,
}

impl TargetDescription {
    pub fn new(arch: Arch) -> Self {
        TargetDescription { arch }
    }

    pub fn native() -> Self {
        TargetDescription { arch: Arch::native() }
    }
}

/// A tracee's register file, copied in and out as one opaque block sized
/// for the ISA.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegSnapshot {
    X86_64(x86_64::UserRegs),
    Arm(arm::UserRegs),
    Arm64(arm64::UserRegs),
}

impl RegSnapshot {
    pub fn arch(&self) -> Arch {
        match self {
            RegSnapshot::X86_64(_) => Arch::X86_64,
            RegSnapshot::Arm(_) => Arch::Arm,
            RegSnapshot::Arm64(_) => Arch::Arm64,
        }
    }

    pub(crate) fn raw_parts(&self) -> (*const u8, usize) {
        match self {
            RegSnapshot::X86_64(r) => {
                (r as *const x86_64::UserRegs as *const u8, std::mem::size_of::<x86_64::UserRegs>())
            }
            RegSnapshot::Arm(r) => {
                (r as *const arm::UserRegs as *const u8, std::mem::size_of::<arm::UserRegs>())
            }
            RegSnapshot::Arm64(r) => {
                (r as *const arm64::UserRegs as *const u8, std::mem::size_of::<arm64::UserRegs>())
            }
        }
    }

    pub(crate) fn raw_parts_mut(&mut self) -> (*mut u8, usize) {
        match self {
            RegSnapshot::X86_64(r) => {
                (r as *mut x86_64::UserRegs as *mut u8, std::mem::size_of::<x86_64::UserRegs>())
            }
            RegSnapshot::Arm(r) => {
                (r as *mut arm::UserRegs as *mut u8, std::mem::size_of::<arm::UserRegs>())
            }
            RegSnapshot::Arm64(r) => {
                (r as *mut arm64::UserRegs as *mut u8, std::mem::size_of::<arm64::UserRegs>())
            }
        }
    }

    /// Instruction pointer.
    pub fn ip(&self) -> u64 {
        match self {
            RegSnapshot::X86_64(r) => r.rip,
            RegSnapshot::Arm(r) => r.regs[arm::REG_PC] as u64,
            RegSnapshot::Arm64(r) => r.pc,
        }
    }

    pub fn set_ip(&mut self, ip: u64) {
        match self {
            RegSnapshot::X86_64(r) => r.rip = ip,
            RegSnapshot::Arm(r) => r.regs[arm::REG_PC] = ip as u32,
            RegSnapshot::Arm64(r) => r.pc = ip,
        }
    }

    /// Stack pointer.
    pub fn sp(&self) -> u64 {
        match self {
            RegSnapshot::X86_64(r) => r.rsp,
            RegSnapshot::Arm(r) => r.regs[arm::REG_SP] as u64,
            RegSnapshot::Arm64(r) => r.sp,
        }
    }

    pub fn set_sp(&mut self, sp: u64) {
        match self {
            RegSnapshot::X86_64(r) => r.rsp = sp,
            RegSnapshot::Arm(r) => r.regs[arm::REG_SP] = sp as u32,
            RegSnapshot::Arm64(r) => r.sp = sp,
        }
    }

    /// Syscall number as seen at a syscall stop.
    pub fn syscall_nr(&self) -> i64 {
        match self {
            RegSnapshot::X86_64(r) => r.orig_rax as i64,
            RegSnapshot::Arm(r) => r.regs[arm::SYSCALL_NR_REG] as i32 as i64,
            RegSnapshot::Arm64(r) => r.regs[arm64::SYSCALL_NR_REG] as i64,
        }
    }

    /// Rewrite the syscall number. On x86_64 both `orig_rax` (what the
    /// kernel dispatches at an enter stop) and `rax` are set so the write
    /// works for suppression and for injection setup alike.
    pub fn set_syscall_nr(&mut self, nr: i64) {
        match self {
            RegSnapshot::X86_64(r) => {
                r.orig_rax = nr as u64;
                r.rax = nr as u64;
            }
            RegSnapshot::Arm(r) => r.regs[arm::SYSCALL_NR_REG] = nr as u32,
            RegSnapshot::Arm64(r) => r.regs[arm64::SYSCALL_NR_REG] = nr as u64,
        }
    }

    /// Syscall argument slot, `i` in `0..6`.
    pub fn syscall_arg(&self, i: usize) -> u64 {
        assert!(i < 6, "syscall argument index out of range: {}", i);
        match self {
            RegSnapshot::X86_64(r) => match i {
                0 => r.rdi,
                1 => r.rsi,
                2 => r.rdx,
                3 => r.r10,
                4 => r.r8,
                _ => r.r9,
            },
            RegSnapshot::Arm(r) => r.regs[i] as u64,
            RegSnapshot::Arm64(r) => r.regs[i],
        }
    }

    pub fn set_syscall_arg(&mut self, i: usize, val: u64) {
        assert!(i < 6, "syscall argument index out of range: {}", i);
        match self {
            RegSnapshot::X86_64(r) => match i {
                0 => r.rdi = val,
                1 => r.rsi = val,
                2 => r.rdx = val,
                3 => r.r10 = val,
                4 => r.r8 = val,
                _ => r.r9 = val,
            },
            RegSnapshot::Arm(r) => r.regs[i] = val as u32,
            RegSnapshot::Arm64(r) => r.regs[i] = val,
        }
    }

    /// Syscall return value, valid at an exit stop.
    pub fn syscall_ret(&self) -> i64 {
        match self {
            RegSnapshot::X86_64(r) => r.rax as i64,
            RegSnapshot::Arm(r) => r.regs[0] as i32 as i64,
            RegSnapshot::Arm64(r) => r.regs[0] as i64,
        }
    }

    pub fn set_syscall_ret(&mut self, ret: i64) {
        match self {
            RegSnapshot::X86_64(r) => r.rax = ret as u64,
            RegSnapshot::Arm(r) => r.regs[0] = ret as u32,
            RegSnapshot::Arm64(r) => r.regs[0] = ret as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_round_trip_on_every_isa() {
        for arch in &[Arch::X86_64, Arch::Arm, Arch::Arm64] {
            let mut regs = arch.empty_regs();
            regs.set_ip(0x4000_1000);
            regs.set_sp(0x7fff_f000);
            regs.set_syscall_nr(57);
            for i in 0..6 {
                regs.set_syscall_arg(i, 0x100 + i as u64);
            }
            regs.set_syscall_ret(-2);

            assert_eq!(regs.ip(), 0x4000_1000, "{:?}", arch);
            assert_eq!(regs.sp(), 0x7fff_f000, "{:?}", arch);
            assert_eq!(regs.syscall_nr(), 57, "{:?}", arch);
            for i in 1..6 {
                assert_eq!(regs.syscall_arg(i), 0x100 + i as u64, "{:?}", arch);
            }
            assert_eq!(regs.syscall_ret(), -2, "{:?}", arch);
        }
    }

    #[test]
    fn arm_return_register_aliases_arg0() {
        // On both ARM flavors the result register is r0/x0, which is also
        // argument slot 0.
        let mut regs = Arch::Arm64.empty_regs();
        regs.set_syscall_ret(42);
        assert_eq!(regs.syscall_arg(0), 42);
    }

    #[test]
    fn trap_rewind_matches_trap_semantics() {
        assert_eq!(Arch::X86_64.pc_rewind_after_trap(), 1);
        assert_eq!(Arch::Arm.pc_rewind_after_trap(), 0);
        assert_eq!(Arch::Arm64.pc_rewind_after_trap(), 0);
        for arch in &[Arch::X86_64, Arch::Arm, Arch::Arm64] {
            assert_eq!(arch.trap_len(), arch.trap_insn().len());
        }
    }

    #[test]
    fn register_block_sizes() {
        assert_eq!(
            Arch::X86_64.empty_regs().raw_parts().1,
            27 * std::mem::size_of::<u64>()
        );
        assert_eq!(
            Arch::Arm64.empty_regs().raw_parts().1,
            34 * std::mem::size_of::<u64>()
        );
        assert_eq!(
            Arch::Arm.empty_regs().raw_parts().1,
            18 * std::mem::size_of::<u32>()
        );
    }
}

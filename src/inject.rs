//! Synthetic syscall injection.
//!
//! An injection borrows the tracee at a safe stop: the full register file
//! is saved, the ISA's syscall instruction is scribbled at the current PC
//! (unless one is already there), number and arguments are loaded into the
//! syscall registers, and the tracee is driven through one enter and one
//! exit stop with syscall-continues. After the exit stop the code bytes and
//! register file are restored bitwise and the completion callback fires.
//! The two synthetic stops never reach user syscall handlers.

use log::{debug, trace};
use nix::unistd::Pid;

use crate::arch::{Arch, RegSnapshot};
use crate::errors::{Error, Result};
use crate::remote;
use crate::tracee::TraceeView;

pub type CompleteHook = Box<dyn FnOnce(i64, &mut TraceeView)>;

/// A synthetic syscall queued against one tracee.
pub struct SyscallInjection {
    pub sysno: i64,
    pub args: [u64; 6],
    pub on_complete: Option<CompleteHook>,
}

impl SyscallInjection {
    pub fn new(sysno: i64) -> Self {
        SyscallInjection {
            sysno,
            args: [0; 6],
            on_complete: None,
        }
    }

    pub fn arg(mut self, i: usize, val: u64) -> Self {
        self.args[i] = val;
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(i64, &mut TraceeView) + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SyscallInjection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SyscallInjection {{ nr: {}, args: {:x?} }}", self.sysno, self.args)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectionPhase {
    AwaitingEnter,
    AwaitingExit,
}

/// An injection that has taken over its tracee. Holds everything needed to
/// put the tracee back exactly as found.
pub struct ActiveInjection {
    pub injection: SyscallInjection,
    pub phase: InjectionPhase,
    saved_regs: RegSnapshot,
    insn_addr: u64,
    /// Original bytes under the scribbled syscall instruction; empty when
    /// the site already held one.
    saved_bytes: Vec<u8>,
}

/// Take over a tracee stopped at a safe point. The caller guarantees no
/// native syscall is in flight.
pub fn activate(pid: Pid, arch: Arch, injection: SyscallInjection) -> Result<ActiveInjection> {
    let saved_regs = remote::getregs(pid, arch)?;
    let insn_addr = saved_regs.ip();
    let insn = arch.syscall_insn();

    let current = remote::read_bytes(pid, insn_addr, insn.len())?;
    let saved_bytes = if current == insn {
        Vec::new()
    } else {
        remote::write_bytes(pid, insn_addr, insn)
            .map_err(|_| Error::InjectionNotSafe(pid))?;
        current
    };

    let mut regs = saved_regs;
    regs.set_syscall_nr(injection.sysno);
    for (i, val) in injection.args.iter().enumerate() {
        regs.set_syscall_arg(i, *val);
    }
    regs.set_ip(insn_addr);
    remote::setregs(pid, &regs)?;

    debug!(
        "injection armed on {}: {:?} at site {:#x}",
        pid, injection, insn_addr
    );
    Ok(ActiveInjection {
        injection,
        phase: InjectionPhase::AwaitingEnter,
        saved_regs,
        insn_addr,
        saved_bytes,
    })
}

impl ActiveInjection {
    /// Consume the synthetic enter stop.
    pub fn on_enter(&mut self, pid: Pid) {
        trace!("injection enter stop on {} (nr {})", pid, self.injection.sysno);
        self.phase = InjectionPhase::AwaitingExit;
    }

    /// Consume the synthetic exit stop: read the result, restore code bytes
    /// and registers, and hand back the return value with the completion
    /// callback for the event loop to fire.
    pub fn finalize(mut self, pid: Pid, arch: Arch) -> Result<(i64, Option<CompleteHook>)> {
        let regs = remote::getregs(pid, arch)?;
        let ret = regs.syscall_ret();

        if !self.saved_bytes.is_empty() {
            remote::write_bytes(pid, self.insn_addr, &self.saved_bytes)
                .map_err(|_| Error::InjectionNotSafe(pid))?;
        }
        remote::setregs(pid, &self.saved_regs)?;

        debug!(
            "injection on {} completed: nr {} -> {}",
            pid, self.injection.sysno, ret
        );
        Ok((ret, self.injection.on_complete.take()))
    }

    pub fn saved_regs(&self) -> &RegSnapshot {
        &self.saved_regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_argument_slots() {
        let inj = SyscallInjection::new(9)
            .arg(0, 0)
            .arg(1, 4096)
            .arg(2, 3)
            .arg(3, 0x22);
        assert_eq!(inj.sysno, 9);
        assert_eq!(inj.args, [0, 4096, 3, 0x22, 0, 0]);
        assert!(inj.on_complete.is_none());
    }

    #[test]
    fn debug_omits_the_callback() {
        let inj = SyscallInjection::new(39).on_complete(|_, _| ());
        let s = format!("{:?}", inj);
        assert!(s.contains("nr: 39"));
    }
}

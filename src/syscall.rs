//! Syscall hooks: per-tracee enter/exit phase tracking and dispatch by
//! syscall number.

use std::collections::HashMap;

use log::{debug, warn};

use crate::arch::RegSnapshot;
use crate::tracee::TraceeView;

/// Whether a tracee is between a syscall-enter stop and the matching exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallPhase {
    Outside,
    InsideKernel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallStop {
    Enter,
    Exit,
}

/// Snapshot handed to syscall handlers. Argument and return-value mutations
/// are written back to the tracee's registers before it resumes.
#[derive(Clone, Debug)]
pub struct SyscallTraceData {
    sysno: i64,
    args: [u64; 6],
    ret: i64,
    stop: SyscallStop,
    dirty: bool,
}

impl SyscallTraceData {
    pub fn from_regs(regs: &RegSnapshot, stop: SyscallStop) -> Self {
        let mut args = [0u64; 6];
        for (i, slot) in args.iter_mut().enumerate() {
            *slot = regs.syscall_arg(i);
        }
        SyscallTraceData {
            sysno: regs.syscall_nr(),
            args,
            ret: regs.syscall_ret(),
            stop,
            dirty: false,
        }
    }

    pub fn sysno(&self) -> i64 {
        self.sysno
    }

    pub fn stop(&self) -> SyscallStop {
        self.stop
    }

    pub fn arg(&self, i: usize) -> u64 {
        self.args[i]
    }

    pub fn set_arg(&mut self, i: usize, val: u64) {
        self.args[i] = val;
        self.dirty = true;
    }

    /// Return value; meaningful only at an exit stop.
    pub fn ret(&self) -> i64 {
        self.ret
    }

    pub fn set_ret(&mut self, ret: i64) {
        self.ret = ret;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Apply handler mutations to a register block: argument slots at an
    /// enter stop, the return register at an exit stop.
    pub fn write_back(&self, regs: &mut RegSnapshot) {
        match self.stop {
            SyscallStop::Enter => {
                for (i, val) in self.args.iter().enumerate() {
                    regs.set_syscall_arg(i, *val);
                }
            }
            SyscallStop::Exit => regs.set_syscall_ret(self.ret),
        }
    }
}

/// Enter hook. Returning `Some(ret)` suppresses the syscall: the kernel is
/// made to skip it and `ret` is forced as its return value at the exit stop.
pub type EnterHook = Box<dyn FnMut(&mut SyscallTraceData, &mut TraceeView) -> Option<i64>>;
pub type ExitHook = Box<dyn FnMut(&mut SyscallTraceData, &mut TraceeView)>;

/// A syscall hook: a value carrying up to two callbacks, registered against
/// one syscall number.
#[derive(Default)]
pub struct SyscallHandler {
    pub enter: Option<EnterHook>,
    pub exit: Option<ExitHook>,
}

impl SyscallHandler {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn on_enter<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut SyscallTraceData, &mut TraceeView) -> Option<i64> + 'static,
    {
        self.enter = Some(Box::new(f));
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut SyscallTraceData, &mut TraceeView) + 'static,
    {
        self.exit = Some(Box::new(f));
        self
    }
}

/// Handler table keyed by syscall number. Unregistered syscalls pass
/// through untouched.
#[derive(Default)]
pub struct SyscallDispatcher {
    handlers: HashMap<i64, SyscallHandler>,
}

impl SyscallDispatcher {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&mut self, sysno: i64, handler: SyscallHandler) {
        if self.handlers.insert(sysno, handler).is_some() {
            warn!("replacing existing handler for syscall {}", sysno);
        }
        debug!("syscall handler registered for {}", sysno);
    }

    pub fn has(&self, sysno: i64) -> bool {
        self.handlers.contains_key(&sysno)
    }

    /// Temporarily remove a handler for dispatch, so the caller can hold
    /// mutable borrows elsewhere while the callback runs. Pair with
    /// `put_back`.
    pub fn take(&mut self, sysno: i64) -> Option<SyscallHandler> {
        self.handlers.remove(&sysno)
    }

    pub fn put_back(&mut self, sysno: i64, handler: SyscallHandler) {
        self.handlers.insert(sysno, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;

    #[test]
    fn trace_data_captures_registers() {
        let mut regs = Arch::X86_64.empty_regs();
        regs.set_syscall_nr(257);
        regs.set_syscall_arg(0, 0xffff_ffff_ffff_ff9c);
        regs.set_syscall_arg(1, 0x7f00_0000);
        let data = SyscallTraceData::from_regs(&regs, SyscallStop::Enter);
        assert_eq!(data.sysno(), 257);
        assert_eq!(data.arg(1), 0x7f00_0000);
        assert!(!data.is_dirty());
    }

    #[test]
    fn write_back_applies_only_mutated_phase() {
        let mut regs = Arch::X86_64.empty_regs();
        regs.set_syscall_ret(11);

        let mut enter = SyscallTraceData::from_regs(&regs, SyscallStop::Enter);
        enter.set_arg(2, 77);
        enter.write_back(&mut regs);
        assert_eq!(regs.syscall_arg(2), 77);
        // Enter write-back leaves the return register alone.
        assert_eq!(regs.syscall_ret(), 11);

        let mut exit = SyscallTraceData::from_regs(&regs, SyscallStop::Exit);
        exit.set_ret(-9);
        exit.write_back(&mut regs);
        assert_eq!(regs.syscall_ret(), -9);
    }

    #[test]
    fn dispatcher_take_put_back_round_trips() {
        let mut d = SyscallDispatcher::new();
        d.register(1, SyscallHandler::new().on_enter(|_, _| None));
        assert!(d.has(1));
        let h = d.take(1).unwrap();
        assert!(!d.has(1));
        d.put_back(1, h);
        assert!(d.has(1));
        assert!(d.take(2).is_none());
    }
}

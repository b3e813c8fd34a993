//! Per-tracee state: everything the event loop needs to drive one traced
//! process or thread.

use std::collections::{HashMap, HashSet, VecDeque};

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::arch::{Arch, RegSnapshot};
use crate::breakpoint::BpId;
use crate::errors::Result;
use crate::inject::{ActiveInjection, SyscallInjection};
use crate::modules::ModuleMap;
use crate::remote;
use crate::syscall::SyscallPhase;

/// Why a tracee is currently stopped, as classified by the event loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    None,
    SignalDelivered(Signal),
    BreakpointHit(u64),
    SyscallEnter,
    SyscallExit,
    ForkChild(Pid),
    CloneChild(Pid),
    Exec,
    Exited(i32),
    Killed(Signal),
}

/// Armed-state of one breakpoint in one tracee's address space.
#[derive(Clone, Debug)]
pub struct ArmedBreakpoint {
    pub bp: BpId,
    /// The original instruction bytes the trap displaced.
    pub saved: Vec<u8>,
    /// False while the original bytes are temporarily restored for the
    /// step-over window.
    pub installed: bool,
}

/// A live, attached process or thread under control. Created on
/// attach/spawn or on fork/clone when follow-fork is enabled; destroyed on
/// exit or explicit detach.
pub struct Tracee {
    pid: Pid,
    arch: Arch,
    pub stop: StopReason,
    pub phase: SyscallPhase,
    /// Address whose trap must be re-armed once the single-step over the
    /// original instruction completes.
    pub pending_restoration: Option<u64>,
    /// Set while the last resume was a single-step for restoration.
    pub stepping: bool,
    pub active_injection: Option<ActiveInjection>,
    pub injection_queue: VecDeque<SyscallInjection>,
    /// Signal observed at an inconvenient moment, re-delivered with the
    /// next resume.
    pub signal_to_deliver: Option<Signal>,
    /// Syscall number seen at the last enter stop; the exit stop
    /// dispatches on it even when the number register was rewritten for
    /// suppression.
    pub current_syscall: Option<i64>,
    /// Forced return value for a syscall the dispatcher suppressed at its
    /// enter stop.
    pub suppressed_ret: Option<i64>,
    pub modules: ModuleMap,
    /// address -> armed trap state; the saved bytes live here, never in the
    /// shared registry.
    pub armed: HashMap<u64, ArmedBreakpoint>,
    /// Per-tracee resolution of registry entries.
    pub resolved: HashMap<BpId, u64>,
    /// Single-shot breakpoints that already fired in this tracee.
    pub fired: HashSet<BpId>,
    /// Breakpoints armed and first resume issued.
    pub launched: bool,
}

impl std::fmt::Debug for Tracee {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Tracee {{ pid: {}, stop: {:?}, phase: {:?}, pending: {:x?}, signal: {:?} }}",
            self.pid, self.stop, self.phase, self.pending_restoration, self.signal_to_deliver
        )
    }
}

impl Tracee {
    pub fn new(pid: Pid, arch: Arch) -> Self {
        Tracee {
            pid,
            arch,
            stop: StopReason::None,
            phase: SyscallPhase::Outside,
            pending_restoration: None,
            stepping: false,
            active_injection: None,
            injection_queue: VecDeque::new(),
            signal_to_deliver: None,
            current_syscall: None,
            suppressed_ret: None,
            modules: ModuleMap::empty(),
            armed: HashMap::new(),
            resolved: HashMap::new(),
            fired: HashSet::new(),
            launched: false,
        }
    }

    /// Child of a fork. The child gets a copy-on-write image of the parent,
    /// including any installed traps. If the fork landed inside a
    /// restoration window, the temporarily-removed trap carries over too,
    /// so both the armed table and the pending restoration are copied.
    pub fn forked(&self, child: Pid) -> Self {
        Tracee {
            pid: child,
            arch: self.arch,
            stop: StopReason::None,
            phase: SyscallPhase::Outside,
            pending_restoration: self.pending_restoration,
            stepping: false,
            active_injection: None,
            injection_queue: VecDeque::new(),
            signal_to_deliver: None,
            current_syscall: None,
            suppressed_ret: None,
            modules: self.modules.clone(),
            armed: self.armed.clone(),
            resolved: self.resolved.clone(),
            fired: self.fired.clone(),
            launched: true,
        }
    }

    /// New thread from clone. Shares the parent's address space, so the
    /// armed view is identical; syscall phase and stepping state are its
    /// own.
    pub fn cloned(&self, tid: Pid) -> Self {
        self.forked(tid)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn exited(&self) -> Option<i32> {
        match self.stop {
            StopReason::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn getregs(&self) -> Result<RegSnapshot> {
        remote::getregs(self.pid, self.arch)
    }

    pub fn setregs(&self, regs: &RegSnapshot) -> Result<()> {
        remote::setregs(self.pid, regs)
    }

    /// Take the deferred signal, if any, for delivery with the next resume.
    pub fn take_signal(&mut self) -> Option<Signal> {
        self.signal_to_deliver.take()
    }

    pub fn cont(&mut self, sig: Option<Signal>) -> Result<()> {
        self.stop = StopReason::None;
        self.stepping = false;
        ptrace::cont(self.pid, sig)?;
        Ok(())
    }

    /// Resume until the next syscall boundary.
    pub fn syscall(&mut self, sig: Option<Signal>) -> Result<()> {
        self.stop = StopReason::None;
        self.stepping = false;
        match sig {
            None => ptrace::syscall(self.pid)?,
            // The binding's syscall() takes no signal argument; go through
            // the raw request to deliver one.
            Some(sig) => {
                let rc = unsafe {
                    libc::ptrace(
                        libc::PTRACE_SYSCALL,
                        self.pid.as_raw(),
                        0 as *mut libc::c_void,
                        sig as libc::c_int as usize as *mut libc::c_void,
                    )
                };
                if rc < 0 {
                    return Err(nix::Error::Sys(nix::errno::Errno::last()).into());
                }
            }
        }
        Ok(())
    }

    /// Execute exactly one instruction.
    pub fn step(&mut self, sig: Option<Signal>) -> Result<()> {
        self.stop = StopReason::None;
        self.stepping = true;
        ptrace::step(self.pid, sig)?;
        Ok(())
    }
}

/// The view of a tracee handed to handlers: register access and memory
/// I/O, valid only for the duration of the callback.
pub struct TraceeView<'a> {
    pid: Pid,
    arch: Arch,
    regs: &'a mut RegSnapshot,
    dirty: &'a mut bool,
}

impl<'a> TraceeView<'a> {
    pub(crate) fn new(pid: Pid, arch: Arch, regs: &'a mut RegSnapshot, dirty: &'a mut bool) -> Self {
        TraceeView {
            pid,
            arch,
            regs,
            dirty,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn regs(&self) -> &RegSnapshot {
        self.regs
    }

    /// Mutable register access; changes take effect on the next resume.
    pub fn regs_mut(&mut self) -> &mut RegSnapshot {
        *self.dirty = true;
        self.regs
    }

    pub fn set_ip(&mut self, ip: u64) {
        self.regs_mut().set_ip(ip);
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        remote::read_bytes(self.pid, addr, len)
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        remote::write_bytes(self.pid, addr, bytes)
    }

    pub fn read_cstring(&self, addr: u64, max: usize) -> Result<String> {
        remote::read_cstring(self.pid, addr, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_child_inherits_armed_state_and_pending_restoration() {
        let mut parent = Tracee::new(Pid::from_raw(100), Arch::X86_64);
        parent.armed.insert(
            0x40_1000,
            ArmedBreakpoint {
                bp: 0,
                saved: vec![0x55],
                installed: false,
            },
        );
        parent.resolved.insert(0, 0x40_1000);
        parent.pending_restoration = Some(0x40_1000);
        parent.phase = SyscallPhase::InsideKernel;
        parent.signal_to_deliver = Some(Signal::SIGUSR1);

        let child = parent.forked(Pid::from_raw(101));
        assert_eq!(child.pid(), Pid::from_raw(101));
        assert_eq!(child.pending_restoration, Some(0x40_1000));
        assert_eq!(child.armed[&0x40_1000].saved, vec![0x55]);
        assert!(!child.armed[&0x40_1000].installed);
        // Phase and pending signal are per-tracee, not inherited.
        assert_eq!(child.phase, SyscallPhase::Outside);
        assert!(child.signal_to_deliver.is_none());
    }

    #[test]
    fn view_marks_registers_dirty_on_mutation() {
        let mut regs = Arch::X86_64.empty_regs();
        let mut dirty = false;
        {
            let mut view = TraceeView::new(Pid::from_raw(1), Arch::X86_64, &mut regs, &mut dirty);
            assert_eq!(view.regs().ip(), 0);
            view.set_ip(0xbeef);
        }
        assert!(dirty);
        assert_eq!(regs.ip(), 0xbeef);
    }
}

//! The `Debugger`: owns the tracee set, the hook registries and the event
//! loop that drives every tracee through its stop/continue transitions.
//!
//! The event loop is the only code that touches the OS tracing primitives,
//! and it runs on one thread; handler callbacks run inline on that thread
//! while the reporting tracee is stopped.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::arch::TargetDescription;
use crate::breakpoint::{self, BpId, Breakpoint, BreakpointRegistry, Decision};
use crate::coverage::CoverageSink;
use crate::errors::{Error, Result};
use crate::inject::{self, InjectionPhase, SyscallInjection};
use crate::modules::ModuleMap;
use crate::nr;
use crate::remote;
use crate::symbols;
use crate::syscall::{
    SyscallDispatcher, SyscallHandler, SyscallPhase, SyscallStop, SyscallTraceData,
};
use crate::tracee::{ArmedBreakpoint, StopReason, Tracee, TraceeView};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChildKind {
    Fork,
    Vfork,
    Clone,
}

pub struct Debugger {
    target: TargetDescription,
    tracees: HashMap<Pid, Tracee>,
    breakpoints: BreakpointRegistry,
    syscalls: SyscallDispatcher,
    trace_syscalls: bool,
    follow_fork: bool,
    coverage: Option<Box<dyn CoverageSink>>,
    /// Signals swallowed instead of being re-delivered to the tracee.
    filtered_signals: HashSet<Signal>,
    diagnostics: Vec<(Pid, Error)>,
    /// Children whose initial SIGSTOP arrived before the parent's
    /// fork/clone event was processed.
    pending_children: HashSet<Pid>,
    shutdown: bool,
}

impl Debugger {
    pub fn new(target: TargetDescription) -> Self {
        Debugger {
            target,
            tracees: HashMap::new(),
            breakpoints: BreakpointRegistry::new(),
            syscalls: SyscallDispatcher::new(),
            trace_syscalls: false,
            follow_fork: false,
            coverage: None,
            filtered_signals: HashSet::new(),
            diagnostics: Vec::new(),
            pending_children: HashSet::new(),
            shutdown: false,
        }
    }

    /// Enable the syscall-stop resume flavor, delivering enter/exit stops
    /// to registered syscall handlers.
    pub fn trace_syscalls(&mut self, on: bool) {
        self.trace_syscalls = on;
    }

    /// Auto-attach children created by fork/vfork/clone.
    pub fn follow_fork(&mut self, on: bool) {
        self.follow_fork = on;
    }

    /// Swallow `sig` instead of re-delivering it to tracees.
    pub fn filter_signal(&mut self, sig: Signal) {
        self.filtered_signals.insert(sig);
    }

    pub fn add_breakpoint(&mut self, bp: Breakpoint) -> Result<BpId> {
        let id = self.breakpoints.add(bp)?;
        debug!("registered {:?} as #{}", self.breakpoints.get(id), id);
        Ok(id)
    }

    /// Register a breakpoint at `symbol` of the ELF image at
    /// `module_path`, looked up in its symbol tables.
    pub fn add_breakpoint_at_symbol<F>(
        &mut self,
        module_path: &str,
        symbol: &str,
        handler: F,
        single_shot: bool,
    ) -> Result<BpId>
    where
        F: FnMut(&mut TraceeView) -> Decision + 'static,
    {
        let offset = symbols::symbol_offset(Path::new(module_path), symbol)?;
        let module = Path::new(module_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(module_path);
        self.add_breakpoint(Breakpoint::new(module, offset, handler, single_shot))
    }

    /// Register one handler-less coverage probe per offset; hits are
    /// reported to the coverage sink tagged with `module_id`.
    pub fn add_coverage_breakpoints(
        &mut self,
        module: &str,
        module_id: u16,
        offsets: &[u64],
    ) -> Result<()> {
        for &off in offsets {
            self.breakpoints
                .add(Breakpoint::coverage_probe(module, off, module_id))?;
        }
        info!(
            "registered {} coverage probes for {} (module id {})",
            offsets.len(),
            module,
            module_id
        );
        Ok(())
    }

    pub fn add_syscall_handler(&mut self, sysno: i64, handler: SyscallHandler) {
        self.syscalls.register(sysno, handler);
    }

    /// Queue a synthetic syscall against `pid`. It activates at the
    /// tracee's next safe stop and completes through its callback.
    pub fn inject_syscall(&mut self, pid: Pid, injection: SyscallInjection) -> Result<()> {
        let tracee = self
            .tracees
            .get_mut(&pid)
            .ok_or(Error::NoSuchProcess(pid))?;
        tracee.injection_queue.push_back(injection);
        Ok(())
    }

    /// Install the sole coverage sink. The debugger owns it; probes record
    /// into it from the event-loop thread.
    pub fn set_coverage_sink(&mut self, sink: Box<dyn CoverageSink>) {
        self.coverage = Some(sink);
    }

    /// Per-tracee failures collected by the event loop.
    pub fn take_diagnostics(&mut self) -> Vec<(Pid, Error)> {
        std::mem::replace(&mut self.diagnostics, Vec::new())
    }

    pub fn tracee_count(&self) -> usize {
        self.tracees.len()
    }

    pub fn tracee_pids(&self) -> Vec<Pid> {
        self.tracees.keys().copied().collect()
    }

    /// Start tracing an existing process.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        ptrace::attach(pid).map_err(|err| match err {
            nix::Error::Sys(Errno::EPERM) => Error::AttachDenied(pid),
            nix::Error::Sys(Errno::ESRCH) => Error::NoSuchProcess(pid),
            other => other.into(),
        })?;
        match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, _)) => (),
            other => {
                return Err(Error::UnknownStop(format!(
                    "attach to {} yielded {:?}",
                    pid, other
                )))
            }
        }
        self.set_trace_options(pid, false)?;
        let mut tracee = Tracee::new(pid, self.target.arch);
        tracee.modules = ModuleMap::from_pid(pid)?;
        self.tracees.insert(pid, tracee);
        info!("attached to {}", pid);
        Ok(())
    }

    /// Fork and exec a new tracee. Returns once the child has stopped at
    /// its initial exec trap, before breakpoints are armed.
    pub fn spawn(&mut self, cmd: &[String]) -> Result<Pid> {
        if cmd.is_empty() {
            return Err(Error::SpawnFailed("empty command line".into()));
        }
        let program = CString::new(cmd[0].as_str())
            .map_err(|_| Error::SpawnFailed("NUL in program name".into()))?;
        let args: Vec<CString> = cmd
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::SpawnFailed("NUL in argument".into()))?;

        match unistd::fork().map_err(|err| Error::SpawnFailed(err.to_string()))? {
            ForkResult::Child => {
                let _ = ptrace::traceme();
                let _ = unistd::execvp(&program, &args);
                // Only reached when exec failed; the parent sees the exit.
                unsafe { libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                match wait::waitpid(child, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => (),
                    Ok(WaitStatus::Exited(_, code)) => {
                        return Err(Error::SpawnFailed(format!(
                            "{:?} exited with {} before exec",
                            cmd[0], code
                        )))
                    }
                    other => {
                        return Err(Error::SpawnFailed(format!(
                            "unexpected initial stop: {:?}",
                            other
                        )))
                    }
                }
                self.set_trace_options(child, true)?;
                let mut tracee = Tracee::new(child, self.target.arch);
                tracee.modules = ModuleMap::from_pid(child)?;
                self.tracees.insert(child, tracee);
                info!("spawned {:?} as {}", cmd[0], child);
                Ok(child)
            }
        }
    }

    /// Stop tracing `pid`, restoring every armed trap first.
    pub fn detach(&mut self, pid: Pid) -> Result<()> {
        if let Some(tracee) = self.tracees.remove(&pid) {
            for (addr, armed) in tracee.armed.iter() {
                if armed.installed {
                    if let Err(err) = breakpoint::uninstall(pid, *addr, &armed.saved) {
                        warn!("{}: could not restore bytes at {:#x}: {}", pid, addr, err);
                    }
                }
            }
            let _ = ptrace::detach(pid);
            info!("detached from {}", pid);
        }
        Ok(())
    }

    fn set_trace_options(&self, pid: Pid, exit_kill: bool) -> Result<()> {
        let mut opts = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXEC;
        if exit_kill {
            opts |= ptrace::Options::PTRACE_O_EXITKILL;
        }
        ptrace::setoptions(pid, opts)?;
        Ok(())
    }

    /// Run until no tracees remain or a handler requested shutdown.
    pub fn event_loop(&mut self) -> Result<()> {
        self.launch_pending()?;
        while !self.tracees.is_empty() && !self.shutdown {
            let status = match wait::waitpid(None::<Pid>, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(nix::Error::Sys(Errno::ECHILD)) => break,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(err) => return Err(err.into()),
            };
            self.dispatch_status(status);
            // Tracees attached from handler context start here.
            self.launch_pending()?;
        }
        if self.shutdown {
            info!("shutdown requested, detaching remaining tracees");
            self.detach_all();
        }
        Ok(())
    }

    /// Arm breakpoints and issue the first resume for tracees added since
    /// the last call.
    fn launch_pending(&mut self) -> Result<()> {
        let pending: Vec<Pid> = self
            .tracees
            .iter()
            .filter(|(_, t)| !t.launched)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in pending {
            {
                let tracee = self.tracees.get_mut(&pid).unwrap();
                tracee.launched = true;
                if tracee.modules.is_empty() {
                    tracee.modules = ModuleMap::from_pid(pid)?;
                }
            }
            self.sync_breakpoints(pid)?;
            self.resume_tracee(pid)?;
        }
        Ok(())
    }

    fn dispatch_status(&mut self, status: WaitStatus) {
        trace!("wait status: {:?}", status);
        match status {
            WaitStatus::Exited(pid, code) => self.remove_tracee(pid, StopReason::Exited(code)),
            WaitStatus::Signaled(pid, sig, _) => self.remove_tracee(pid, StopReason::Killed(sig)),
            WaitStatus::PtraceEvent(pid, _, event) => {
                if let Err(err) = self.on_ptrace_event(pid, event) {
                    self.fail_tracee(pid, err);
                }
            }
            WaitStatus::PtraceSyscall(pid) => {
                if let Err(err) = self.on_syscall_stop(pid) {
                    self.fail_tracee(pid, err);
                }
            }
            WaitStatus::Stopped(pid, Signal::SIGTRAP) if self.tracees.contains_key(&pid) => {
                if let Err(err) = self.on_trap(pid) {
                    self.fail_tracee(pid, err);
                }
            }
            WaitStatus::Stopped(pid, sig) => {
                if let Err(err) = self.on_signal(pid, sig) {
                    self.fail_tracee(pid, err);
                }
            }
            WaitStatus::Continued(pid) => trace!("{} continued", pid),
            WaitStatus::StillAlive => (),
        }
    }

    fn remove_tracee(&mut self, pid: Pid, reason: StopReason) {
        match self.tracees.remove(&pid) {
            Some(tracee) => {
                if tracee.active_injection.is_some() {
                    self.diagnostics.push((pid, Error::InjectionNotSafe(pid)));
                    warn!("{} terminated mid-injection", pid);
                }
                if !tracee.injection_queue.is_empty() {
                    warn!(
                        "{} terminated with {} queued injections",
                        pid,
                        tracee.injection_queue.len()
                    );
                }
                info!("{} gone: {:?}", pid, reason);
            }
            None => trace!("{} reaped without a record: {:?}", pid, reason),
        }
    }

    /// Per-tracee failure: record it, detach the tracee, keep the loop
    /// going for everyone else.
    fn fail_tracee(&mut self, pid: Pid, err: Error) {
        error!("{}: {}", pid, err);
        self.diagnostics.push((pid, err));
        let _ = self.detach(pid);
    }

    /// Trap restoration failed: the tracee's code image is in a known-bad
    /// state, so it cannot be allowed to run.
    fn kill_tracee(&mut self, pid: Pid, err: Error) {
        error!("{}: {} -- killing", pid, err);
        self.diagnostics.push((pid, err));
        let _ = signal::kill(pid, Signal::SIGKILL);
        // The record goes away when the kill is reported through wait.
    }

    fn detach_all(&mut self) {
        for pid in self.tracee_pids() {
            let stopped = self
                .tracees
                .get(&pid)
                .map_or(false, |t| t.stop != StopReason::None);
            if !stopped {
                // Running tracee: bring it to a stop we can detach from.
                if signal::kill(pid, Signal::SIGSTOP).is_err() {
                    self.tracees.remove(&pid);
                    continue;
                }
                loop {
                    match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
                        Ok(WaitStatus::Stopped(..))
                        | Ok(WaitStatus::PtraceSyscall(_))
                        | Ok(WaitStatus::PtraceEvent(..)) => break,
                        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => {
                            self.tracees.remove(&pid);
                            break;
                        }
                        Ok(_) => continue,
                    }
                }
            }
            let _ = self.detach(pid);
        }
    }

    /// Resolve-and-arm pass: install a trap for every registry entry this
    /// tracee can resolve and has not fired as a single-shot.
    fn sync_breakpoints(&mut self, pid: Pid) -> Result<()> {
        // While something is still unresolved, the image we are waiting
        // for may have been mapped since the last stop; take a fresh look.
        let needs_resolution = {
            let tracee = match self.tracees.get(&pid) {
                Some(t) => t,
                None => return Ok(()),
            };
            self.breakpoints
                .ids()
                .any(|id| !tracee.fired.contains(&id) && !tracee.resolved.contains_key(&id))
        };
        if needs_resolution {
            if let Ok(map) = ModuleMap::from_pid(pid) {
                if let Some(tracee) = self.tracees.get_mut(&pid) {
                    tracee.modules = map;
                }
            }
        }
        for id in self.breakpoints.ids() {
            let (module, offset) = {
                let spec = self.breakpoints.get(id);
                (spec.module.clone(), spec.offset)
            };
            let tracee = match self.tracees.get_mut(&pid) {
                Some(t) => t,
                None => return Ok(()),
            };
            if tracee.fired.contains(&id) {
                continue;
            }
            let addr = match tracee.resolved.get(&id) {
                Some(addr) => *addr,
                None => match tracee.modules.resolve(&module, offset) {
                    Some(addr) => {
                        tracee.resolved.insert(id, addr);
                        addr
                    }
                    None => {
                        trace!("{}: {}+{:#x} still unresolved", pid, module, offset);
                        continue;
                    }
                },
            };
            if let Some(existing) = tracee.armed.get(&addr) {
                if existing.bp != id {
                    warn!(
                        "{}: address {:#x} already instrumented for #{}, skipping #{}",
                        pid, addr, existing.bp, id
                    );
                }
                continue;
            }
            let arch = tracee.arch();
            let saved = breakpoint::install(pid, arch, addr)?;
            tracee.armed.insert(
                addr,
                ArmedBreakpoint {
                    bp: id,
                    saved,
                    installed: true,
                },
            );
        }
        Ok(())
    }

    /// Pick the resume verb for a stopped tracee and issue it. Breakpoints
    /// registered since the last stop are armed first, and a queued
    /// injection is activated when the stop is safe for one.
    fn resume_tracee(&mut self, pid: Pid) -> Result<()> {
        self.sync_breakpoints(pid)?;
        self.maybe_activate_injection(pid)?;
        let trace_syscalls = self.trace_syscalls;
        let tracee = match self.tracees.get_mut(&pid) {
            Some(t) => t,
            None => return Ok(()),
        };
        let sig = tracee.take_signal();
        if tracee.pending_restoration.is_some() {
            // Step over the restored original instruction, then re-arm.
            tracee.step(sig)
        } else if tracee.active_injection.is_some() || trace_syscalls {
            tracee.syscall(sig)
        } else {
            tracee.cont(sig)
        }
    }

    /// A stop is safe for injection when no native syscall is in flight
    /// and no breakpoint restoration is pending.
    fn maybe_activate_injection(&mut self, pid: Pid) -> Result<()> {
        let tracee = match self.tracees.get_mut(&pid) {
            Some(t) => t,
            None => return Ok(()),
        };
        if tracee.active_injection.is_some()
            || tracee.pending_restoration.is_some()
            || tracee.phase == SyscallPhase::InsideKernel
            || tracee.injection_queue.is_empty()
        {
            return Ok(());
        }
        let injection = tracee.injection_queue.pop_front().unwrap();
        let arch = tracee.arch();
        let active = inject::activate(pid, arch, injection)?;
        tracee.active_injection = Some(active);
        Ok(())
    }

    fn on_ptrace_event(&mut self, pid: Pid, event: i32) -> Result<()> {
        if event == libc::PTRACE_EVENT_FORK {
            self.on_new_child(pid, ChildKind::Fork)
        } else if event == libc::PTRACE_EVENT_VFORK {
            self.on_new_child(pid, ChildKind::Vfork)
        } else if event == libc::PTRACE_EVENT_CLONE {
            self.on_new_child(pid, ChildKind::Clone)
        } else if event == libc::PTRACE_EVENT_EXEC {
            self.on_exec(pid)
        } else {
            debug!("{}: unhandled ptrace event {}", pid, event);
            self.resume_tracee(pid)
        }
    }

    /// From the ptrace man page: children created under the TRACEFORK
    /// family of options are attached to the tracer automatically and
    /// enter signal-delivery-stop with SIGSTOP after the creating syscall
    /// returns.
    fn wait_child_sigstop(&mut self, child: Pid) -> Result<()> {
        if self.pending_children.remove(&child) {
            // Its initial stop already arrived through the main wait.
            return Ok(());
        }
        match wait::waitpid(child, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => Ok(()),
            other => Err(Error::UnknownStop(format!(
                "adopting {}: expected SIGSTOP, got {:?}",
                child, other
            ))),
        }
    }

    fn on_new_child(&mut self, pid: Pid, kind: ChildKind) -> Result<()> {
        let child_raw = ptrace::getevent(pid)?;
        let child = Pid::from_raw(child_raw as libc::pid_t);
        self.wait_child_sigstop(child)?;

        {
            let tracee = self
                .tracees
                .get_mut(&pid)
                .ok_or(Error::NoSuchProcess(pid))?;
            tracee.stop = match kind {
                ChildKind::Clone => StopReason::CloneChild(child),
                _ => StopReason::ForkChild(child),
            };
        }

        if self.follow_fork {
            let mut child_tracee = {
                let parent = self.tracees.get(&pid).unwrap();
                match kind {
                    ChildKind::Clone => parent.cloned(child),
                    _ => parent.forked(child),
                }
            };
            // The child's first syscall stop is the exit side of the
            // syscall that created it.
            if self.trace_syscalls {
                child_tracee.phase = SyscallPhase::InsideKernel;
            }
            debug!(
                "{} {:?} -> {}, inheriting {} armed breakpoints",
                pid,
                kind,
                child,
                child_tracee.armed.len()
            );
            self.tracees.insert(child, child_tracee);
            self.set_trace_options(child, false)?;
            // The child copied the parent's image as-is, including any
            // trap still removed for a restoration window, so it resumes
            // through the same step/re-arm path.
            self.resume_tracee(child)?;
        } else {
            // Leave a plain-fork child untraced and undamaged: take our
            // traps out of its copy of the image before letting it go.
            // Clone and vfork children share the parent's memory, where
            // the traps must stay.
            if kind == ChildKind::Fork {
                let saved: Vec<(u64, Vec<u8>)> = {
                    let parent = self.tracees.get(&pid).unwrap();
                    parent
                        .armed
                        .iter()
                        .filter(|(_, a)| a.installed)
                        .map(|(addr, a)| (*addr, a.saved.clone()))
                        .collect()
                };
                for (addr, bytes) in saved {
                    let _ = breakpoint::uninstall(child, addr, &bytes);
                }
            }
            let _ = ptrace::detach(child);
            debug!("{} created {} ({:?}), not following", pid, child, kind);
        }

        self.resume_tracee(pid)
    }

    fn on_exec(&mut self, pid: Pid) -> Result<()> {
        let trace_syscalls = self.trace_syscalls;
        {
            let tracee = self
                .tracees
                .get_mut(&pid)
                .ok_or(Error::NoSuchProcess(pid))?;
            tracee.stop = StopReason::Exec;
            tracee.modules = ModuleMap::from_pid(pid)?;
            // The old image is gone, and our traps with it.
            tracee.armed.clear();
            tracee.resolved.clear();
            tracee.pending_restoration = None;
            tracee.suppressed_ret = None;
            tracee.current_syscall = None;
            if tracee.active_injection.take().is_some() {
                warn!("{}: exec discarded an active injection", pid);
            }
            // When syscall tracing is on, the execve's own exit stop is
            // still due.
            tracee.phase = if trace_syscalls {
                SyscallPhase::InsideKernel
            } else {
                SyscallPhase::Outside
            };
            info!("{}: exec, module map reloaded", pid);
        }
        self.sync_breakpoints(pid)?;
        self.resume_tracee(pid)
    }

    fn on_trap(&mut self, pid: Pid) -> Result<()> {
        let (arch, stepping) = {
            let tracee = self
                .tracees
                .get_mut(&pid)
                .ok_or(Error::NoSuchProcess(pid))?;
            (tracee.arch(), tracee.stepping)
        };
        if stepping {
            return self.on_step_complete(pid);
        }

        let regs = remote::getregs(pid, arch)?;
        let hit = regs.ip().wrapping_sub(arch.pc_rewind_after_trap());
        let is_ours = self
            .tracees
            .get(&pid)
            .map_or(false, |t| t.armed.contains_key(&hit));
        if is_ours {
            self.on_breakpoint_hit(pid, hit, regs)
        } else {
            // Not one of ours: hand the trap to the tracee like any other
            // signal.
            debug!("{}: foreign SIGTRAP at {:#x}", pid, regs.ip());
            self.on_signal(pid, Signal::SIGTRAP)
        }
    }

    /// The single-step over a restored instruction finished: put the trap
    /// back and return to normal scheduling.
    fn on_step_complete(&mut self, pid: Pid) -> Result<()> {
        let (arch, pending) = {
            let tracee = self
                .tracees
                .get_mut(&pid)
                .ok_or(Error::NoSuchProcess(pid))?;
            tracee.stepping = false;
            (tracee.arch(), tracee.pending_restoration.take())
        };
        if let Some(addr) = pending {
            if let Err(err) = breakpoint::rearm(pid, arch, addr) {
                self.kill_tracee(pid, err);
                return Ok(());
            }
            if let Some(tracee) = self.tracees.get_mut(&pid) {
                if let Some(armed) = tracee.armed.get_mut(&addr) {
                    armed.installed = true;
                }
            }
            trace!("{}: re-armed trap at {:#x}", pid, addr);
        }
        self.resume_tracee(pid)
    }

    fn on_breakpoint_hit(&mut self, pid: Pid, addr: u64, mut regs: crate::arch::RegSnapshot) -> Result<()> {
        let arch = {
            let tracee = self
                .tracees
                .get_mut(&pid)
                .ok_or(Error::NoSuchProcess(pid))?;
            tracee.stop = StopReason::BreakpointHit(addr);
            tracee.arch()
        };
        let bp_id: BpId = self.tracees.get(&pid).unwrap().armed[&addr].bp;

        // Rewind the PC onto the displaced instruction.
        regs.set_ip(addr);
        let mut dirty = true;

        // Coverage probes report before any handler runs, in execution
        // order.
        let coverage = self.breakpoints.get(bp_id).coverage;
        if let Some(module_id) = coverage {
            let offset = self.breakpoints.get(bp_id).offset;
            if let Some(sink) = self.coverage.as_mut() {
                sink.record(pid.as_raw() as u32, module_id, offset);
            }
        }

        let mut handler = self.breakpoints.get_mut(bp_id).handler.take();
        let decision = match handler.as_mut() {
            Some(callback) => {
                let mut view = TraceeView::new(pid, arch, &mut regs, &mut dirty);
                match panic::catch_unwind(AssertUnwindSafe(|| callback(&mut view))) {
                    Ok(decision) => decision,
                    Err(_) => {
                        error!("{}: breakpoint handler panicked at {:#x}", pid, addr);
                        Decision::Continue
                    }
                }
            }
            None => Decision::Continue,
        };
        self.breakpoints.get_mut(bp_id).handler = handler;

        if dirty {
            remote::setregs(pid, &regs)?;
        }

        // Take the trap out so the displaced instruction can execute.
        let single_shot = self.breakpoints.get(bp_id).single_shot;
        {
            let tracee = self.tracees.get_mut(&pid).unwrap();
            if let Some(armed) = tracee.armed.get_mut(&addr) {
                if armed.installed {
                    let saved = armed.saved.clone();
                    breakpoint::uninstall(pid, addr, &saved)?;
                    armed.installed = false;
                }
            }
            if single_shot {
                tracee.armed.remove(&addr);
                tracee.resolved.remove(&bp_id);
                tracee.fired.insert(bp_id);
            } else {
                tracee.pending_restoration = Some(addr);
            }
        }

        match decision {
            Decision::Continue => self.resume_tracee(pid),
            Decision::Detach => self.detach(pid),
            Decision::Kill => {
                let _ = signal::kill(pid, Signal::SIGKILL);
                Ok(())
            }
            Decision::Shutdown => {
                self.shutdown = true;
                Ok(())
            }
        }
    }

    fn on_signal(&mut self, pid: Pid, sig: Signal) -> Result<()> {
        if !self.tracees.contains_key(&pid) {
            if sig == Signal::SIGSTOP {
                // A fork/clone child stopped before its creation event was
                // processed; adopt it when the event arrives.
                self.pending_children.insert(pid);
                return Ok(());
            }
            warn!("signal {:?} for unknown tracee {}", sig, pid);
            let _ = ptrace::cont(pid, sig);
            return Ok(());
        }

        let tracee = self.tracees.get_mut(&pid).unwrap();
        if tracee.stepping {
            // The restoration step was interrupted by signal delivery.
            // Defer the signal and redo the step so the trap window closes
            // before the tracee sees it.
            debug!("{}: deferring {:?} across restoration step", pid, sig);
            tracee.signal_to_deliver = Some(sig);
            return tracee.step(None);
        }
        tracee.stop = StopReason::SignalDelivered(sig);
        if self.filtered_signals.contains(&sig) {
            trace!("{}: swallowing filtered {:?}", pid, sig);
        } else {
            tracee.signal_to_deliver = Some(sig);
        }
        self.resume_tracee(pid)
    }

    fn on_syscall_stop(&mut self, pid: Pid) -> Result<()> {
        let has_injection = self
            .tracees
            .get(&pid)
            .ok_or(Error::NoSuchProcess(pid))?
            .active_injection
            .is_some();
        if has_injection {
            return self.on_injection_stop(pid);
        }

        let (arch, stop) = {
            let tracee = self.tracees.get_mut(&pid).unwrap();
            let stop = match tracee.phase {
                SyscallPhase::Outside => {
                    tracee.phase = SyscallPhase::InsideKernel;
                    tracee.stop = StopReason::SyscallEnter;
                    SyscallStop::Enter
                }
                SyscallPhase::InsideKernel => {
                    tracee.phase = SyscallPhase::Outside;
                    tracee.stop = StopReason::SyscallExit;
                    SyscallStop::Exit
                }
            };
            (tracee.arch(), stop)
        };

        match stop {
            SyscallStop::Enter => self.dispatch_syscall_enter(pid, arch),
            SyscallStop::Exit => self.dispatch_syscall_exit(pid, arch),
        }
    }

    fn dispatch_syscall_enter(&mut self, pid: Pid, arch: crate::arch::Arch) -> Result<()> {
        let mut regs = remote::getregs(pid, arch)?;
        let sysno = regs.syscall_nr();
        {
            let tracee = self.tracees.get_mut(&pid).unwrap();
            tracee.current_syscall = Some(sysno);
        }

        if self.syscalls.has(sysno) {
            let mut handler = self.syscalls.take(sysno).unwrap();
            let mut data = SyscallTraceData::from_regs(&regs, SyscallStop::Enter);
            let mut dirty = false;
            let suppress = match handler.enter.as_mut() {
                Some(callback) => {
                    let mut view = TraceeView::new(pid, arch, &mut regs, &mut dirty);
                    match panic::catch_unwind(AssertUnwindSafe(|| callback(&mut data, &mut view)))
                    {
                        Ok(verdict) => verdict,
                        Err(_) => {
                            error!("{}: enter handler for {} panicked", pid, sysno);
                            None
                        }
                    }
                }
                None => None,
            };
            self.syscalls.put_back(sysno, handler);

            if data.is_dirty() {
                data.write_back(&mut regs);
                dirty = true;
            }
            if let Some(forced_ret) = suppress {
                // Make the kernel skip the call; the forced value is
                // written into the return register at the exit stop.
                regs.set_syscall_nr(nr::SYSCALL_SKIP);
                dirty = true;
                let tracee = self.tracees.get_mut(&pid).unwrap();
                tracee.suppressed_ret = Some(forced_ret);
                debug!("{}: suppressed syscall {} -> {}", pid, sysno, forced_ret);
            }
            if dirty {
                remote::setregs(pid, &regs)?;
            }
        }
        self.resume_tracee(pid)
    }

    fn dispatch_syscall_exit(&mut self, pid: Pid, arch: crate::arch::Arch) -> Result<()> {
        let mut regs = remote::getregs(pid, arch)?;
        let (sysno, forced_ret) = {
            let tracee = self.tracees.get_mut(&pid).unwrap();
            (
                tracee.current_syscall.take().unwrap_or_else(|| regs.syscall_nr()),
                tracee.suppressed_ret.take(),
            )
        };

        let mut data = SyscallTraceData::from_regs(&regs, SyscallStop::Exit);
        let mut dirty = false;
        if let Some(ret) = forced_ret {
            data.set_ret(ret);
        }

        if self.syscalls.has(sysno) {
            let mut handler = self.syscalls.take(sysno).unwrap();
            if let Some(callback) = handler.exit.as_mut() {
                let mut view = TraceeView::new(pid, arch, &mut regs, &mut dirty);
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&mut data, &mut view))).is_err()
                {
                    error!("{}: exit handler for {} panicked", pid, sysno);
                }
            }
            self.syscalls.put_back(sysno, handler);
        }

        if data.is_dirty() {
            data.write_back(&mut regs);
            dirty = true;
        }
        if dirty {
            remote::setregs(pid, &regs)?;
        }
        self.resume_tracee(pid)
    }

    /// Syscall stops owned by an active injection: consumed here, never
    /// surfaced to user handlers.
    fn on_injection_stop(&mut self, pid: Pid) -> Result<()> {
        let (arch, phase) = {
            let tracee = self.tracees.get_mut(&pid).unwrap();
            let active = tracee.active_injection.as_ref().unwrap();
            (tracee.arch(), active.phase)
        };
        match phase {
            InjectionPhase::AwaitingEnter => {
                let tracee = self.tracees.get_mut(&pid).unwrap();
                tracee.active_injection.as_mut().unwrap().on_enter(pid);
                tracee.stop = StopReason::SyscallEnter;
            }
            InjectionPhase::AwaitingExit => {
                let active = {
                    let tracee = self.tracees.get_mut(&pid).unwrap();
                    tracee.stop = StopReason::SyscallExit;
                    // Whatever phase bookkeeping preceded the injection,
                    // the tracee is outside any syscall once restored.
                    tracee.phase = SyscallPhase::Outside;
                    tracee.active_injection.take().unwrap()
                };
                let (ret, callback) = active.finalize(pid, arch)?;
                if let Some(callback) = callback {
                    let mut regs = remote::getregs(pid, arch)?;
                    let mut dirty = false;
                    let mut view = TraceeView::new(pid, arch, &mut regs, &mut dirty);
                    if panic::catch_unwind(AssertUnwindSafe(move || callback(ret, &mut view)))
                        .is_err()
                    {
                        error!("{}: injection completion callback panicked", pid);
                    }
                    if dirty {
                        remote::setregs(pid, &regs)?;
                    }
                }
            }
        }
        self.resume_tracee(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;

    #[test]
    fn inject_requires_a_known_tracee() {
        let mut dbg = Debugger::new(TargetDescription::new(Arch::native()));
        let err = dbg
            .inject_syscall(Pid::from_raw(424242), SyscallInjection::new(nr::SYS_getpid))
            .unwrap_err();
        match err {
            Error::NoSuchProcess(pid) => assert_eq!(pid, Pid::from_raw(424242)),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn duplicate_breakpoints_surface_to_the_caller() {
        let mut dbg = Debugger::new(TargetDescription::new(Arch::native()));
        dbg.add_breakpoint(Breakpoint::new("a.out", 0x100, |_| Decision::Continue, false))
            .unwrap();
        assert!(dbg
            .add_breakpoint(Breakpoint::new("a.out", 0x100, |_| Decision::Continue, false))
            .is_err());
    }

    #[test]
    fn spawn_of_a_missing_binary_fails() {
        let mut dbg = Debugger::new(TargetDescription::new(Arch::native()));
        let err = dbg
            .spawn(&["/nonexistent/certainly-not-a-binary".to_string()])
            .unwrap_err();
        match err {
            Error::SpawnFailed(_) => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

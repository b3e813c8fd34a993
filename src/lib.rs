//! A scriptable, programmable debugger built on ptrace.
//!
//! `tracekit` attaches to (or spawns) unmodified target processes and
//! drives them through stop/continue transitions while dispatching three
//! hook families: software breakpoints, syscall enter/exit handlers, and
//! injected synthetic syscalls. Multiple tracees created via fork/clone
//! are multiplexed over one single-threaded event loop, which is the only
//! code talking to the OS tracing primitives.
//!
//! ```no_run
//! use tracekit::{Breakpoint, Debugger, Decision, TargetDescription};
//!
//! let mut dbg = Debugger::new(TargetDescription::native());
//! dbg.add_breakpoint(Breakpoint::new("a.out", 0x1149, |view| {
//!     println!("hit f() in {}", view.pid());
//!     Decision::Continue
//! }, false)).unwrap();
//! dbg.spawn(&["./a.out".to_string()]).unwrap();
//! dbg.event_loop().unwrap();
//! ```

pub mod arch;
pub mod breakpoint;
pub mod coverage;
pub mod debugger;
pub mod errors;
pub mod inject;
pub mod modules;
pub mod nr;
pub mod proc;
pub mod remote;
pub mod symbols;
pub mod syscall;
pub mod tracee;

pub use crate::arch::{Arch, RegSnapshot, TargetDescription};
pub use crate::breakpoint::{Breakpoint, BreakpointHandler, Decision};
pub use crate::coverage::{CoverageFileWriter, CoverageSink, MemorySink};
pub use crate::debugger::Debugger;
pub use crate::errors::{Error, Result};
pub use crate::inject::SyscallInjection;
pub use crate::remote::RemotePtr;
pub use crate::syscall::{SyscallHandler, SyscallPhase, SyscallStop, SyscallTraceData};
pub use crate::tracee::{StopReason, Tracee, TraceeView};

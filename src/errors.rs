use nix::unistd::Pid;
use std::fmt;

/// Errors surfaced by the tracing engine.
///
/// Setup errors (`attach`, `spawn`, breakpoint registration) are returned
/// directly to the caller. Errors hit while servicing a stop inside the
/// event loop are recorded against the failing tracee and reported through
/// `Debugger::take_diagnostics`; the remaining tracees keep running.
#[derive(Debug)]
pub enum Error {
    /// The kernel refused `PTRACE_ATTACH` (ptrace_scope, privileges).
    AttachDenied(Pid),
    NoSuchProcess(Pid),
    SpawnFailed(String),
    /// Remote read or write touched an unmapped or protected range.
    MemoryFault { pid: Pid, addr: u64, len: usize },
    /// A memory or register operation was attempted on a running tracee.
    NotStopped(Pid),
    /// `(module, offset)` could not be resolved to an address yet.
    Unresolved { module: String, offset: u64 },
    /// Writing trap bytes (or restoring the original bytes) failed.
    TrapWriteFailed { pid: Pid, addr: u64 },
    RegisterIOFailed(Pid),
    /// An injection could not be activated or finalized on this tracee.
    InjectionNotSafe(Pid),
    /// The wait primitive reported a stop the engine cannot classify.
    UnknownStop(String),
    /// A breakpoint is already registered for this `(module, offset)`.
    BreakpointExists { module: String, offset: u64 },
    Sys(nix::Error),
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::AttachDenied(pid) => write!(f, "ptrace attach to {} denied", pid),
            Error::NoSuchProcess(pid) => write!(f, "no such process: {}", pid),
            Error::SpawnFailed(msg) => write!(f, "spawn failed: {}", msg),
            Error::MemoryFault { pid, addr, len } => {
                write!(f, "memory fault: {} bytes @{:#x} in {}", len, addr, pid)
            }
            Error::NotStopped(pid) => write!(f, "tracee {} is not in a stopped state", pid),
            Error::Unresolved { module, offset } => {
                write!(f, "unresolved address: {}+{:#x}", module, offset)
            }
            Error::TrapWriteFailed { pid, addr } => {
                write!(f, "trap write failed @{:#x} in {}", addr, pid)
            }
            Error::RegisterIOFailed(pid) => write!(f, "register I/O failed for {}", pid),
            Error::InjectionNotSafe(pid) => {
                write!(f, "syscall injection unsafe on tracee {}", pid)
            }
            Error::UnknownStop(what) => write!(f, "unknown stop: {}", what),
            Error::BreakpointExists { module, offset } => {
                write!(f, "breakpoint already registered at {}+{:#x}", module, offset)
            }
            Error::Sys(err) => write!(f, "{}", err),
            Error::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Sys(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Sys(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_tracee() {
        let err = Error::NotStopped(Pid::from_raw(1234));
        assert!(format!("{}", err).contains("1234"));
    }
}

//! Software breakpoints: the shared handler registry and the trap
//! install/uninstall primitives.
//!
//! The registry holds what the user registered (module, offset, handler,
//! policy). Whether a trap is currently armed for a given tracee, and the
//! original bytes it displaced, is per-tracee state owned by the `Tracee`,
//! so fork children carry their own copy.

use log::trace;
use nix::unistd::Pid;

use crate::arch::Arch;
use crate::errors::{Error, Result};
use crate::remote;
use crate::tracee::TraceeView;

/// What a breakpoint handler wants done with the tracee afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Detach,
    Kill,
    /// Stop the whole event loop; remaining tracees are detached.
    Shutdown,
}

pub type BreakpointHandler = Box<dyn FnMut(&mut TraceeView) -> Decision>;

/// Index of a breakpoint in the registry; stable for the life of the
/// `Debugger`.
pub type BpId = usize;

/// A registered breakpoint. Addresses are resolved per tracee against its
/// module map, not stored here.
pub struct Breakpoint {
    pub module: String,
    pub offset: u64,
    pub single_shot: bool,
    /// When set, hits are reported to the coverage sink under this module
    /// id before any handler runs.
    pub coverage: Option<u16>,
    pub handler: Option<BreakpointHandler>,
}

impl Breakpoint {
    pub fn new<F>(module: &str, offset: u64, handler: F, single_shot: bool) -> Self
    where
        F: FnMut(&mut TraceeView) -> Decision + 'static,
    {
        Breakpoint {
            module: module.to_string(),
            offset,
            single_shot,
            coverage: None,
            handler: Some(Box::new(handler)),
        }
    }

    /// A handler-less coverage probe.
    pub fn coverage_probe(module: &str, offset: u64, module_id: u16) -> Self {
        Breakpoint {
            module: module.to_string(),
            offset,
            single_shot: false,
            coverage: Some(module_id),
            handler: None,
        }
    }
}

impl std::fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Breakpoint {{ {}+{:#x}, single_shot: {}, coverage: {:?} }}",
            self.module, self.offset, self.single_shot, self.coverage
        )
    }
}

#[derive(Default)]
pub struct BreakpointRegistry {
    specs: Vec<Breakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a breakpoint. A second registration for the same
    /// `(module, offset)` is refused.
    pub fn add(&mut self, bp: Breakpoint) -> Result<BpId> {
        if self
            .specs
            .iter()
            .any(|s| s.module == bp.module && s.offset == bp.offset)
        {
            return Err(Error::BreakpointExists {
                module: bp.module,
                offset: bp.offset,
            });
        }
        self.specs.push(bp);
        Ok(self.specs.len() - 1)
    }

    pub fn get(&self, id: BpId) -> &Breakpoint {
        &self.specs[id]
    }

    pub fn get_mut(&mut self, id: BpId) -> &mut Breakpoint {
        &mut self.specs[id]
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn ids(&self) -> std::ops::Range<BpId> {
        0..self.specs.len()
    }
}

/// Write the trap instruction at `addr`, returning the original bytes it
/// displaced.
pub fn install(pid: Pid, arch: Arch, addr: u64) -> Result<Vec<u8>> {
    let saved = remote::read_bytes(pid, addr, arch.trap_len())?;
    remote::write_bytes(pid, addr, arch.trap_insn())
        .map_err(|_| Error::TrapWriteFailed { pid, addr })?;
    trace!("armed trap @{:#x} in {}, saved {:02x?}", addr, pid, saved);
    Ok(saved)
}

/// Write the trap instruction again over a site whose original bytes are
/// already saved.
pub fn rearm(pid: Pid, arch: Arch, addr: u64) -> Result<()> {
    remote::write_bytes(pid, addr, arch.trap_insn())
        .map_err(|_| Error::TrapWriteFailed { pid, addr })
}

/// Put the original bytes back.
pub fn uninstall(pid: Pid, addr: u64, saved: &[u8]) -> Result<()> {
    remote::write_bytes(pid, addr, saved).map_err(|_| Error::TrapWriteFailed { pid, addr })?;
    trace!("disarmed trap @{:#x} in {}", addr, pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_refused() {
        let mut reg = BreakpointRegistry::new();
        reg.add(Breakpoint::new("libc.so.6", 0x1234, |_| Decision::Continue, false))
            .unwrap();
        match reg.add(Breakpoint::new("libc.so.6", 0x1234, |_| Decision::Continue, true)) {
            Err(Error::BreakpointExists { module, offset }) => {
                assert_eq!(module, "libc.so.6");
                assert_eq!(offset, 0x1234);
            }
            other => panic!("expected BreakpointExists, got {:?}", other.map(|_| ())),
        }
        // Same offset in a different module is fine.
        reg.add(Breakpoint::new("libm.so.6", 0x1234, |_| Decision::Continue, false))
            .unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn coverage_probe_has_no_handler() {
        let bp = Breakpoint::coverage_probe("target", 0x40, 3);
        assert!(bp.handler.is_none());
        assert_eq!(bp.coverage, Some(3));
        assert!(!bp.single_shot);
    }
}

//! Memory and register I/O against a stopped tracee.
//!
//! Word-sized transfers go through `ptrace` peek/poke, which bypasses page
//! protections and therefore works on text pages; larger spans use
//! `process_vm_readv`/`process_vm_writev` with a word-by-word fallback for
//! ranges the vm calls cannot touch. All entry points require the tracee to
//! be ptrace-stopped and fail with `NotStopped` otherwise.

use nix::sys::ptrace;
use nix::sys::uio;
use nix::unistd::Pid;

use crate::arch::{Arch, RegSnapshot};
use crate::errors::{Error, Result};
use crate::proc::{self, TaskState};

const WORD: usize = std::mem::size_of::<libc::c_long>();

const NT_PRSTATUS: libc::c_int = 1;

/// An address range inside a tracee. Carries no local-memory semantics; it
/// is only meaningful as an argument to the transfer functions below.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RemotePtr {
    pub pid: Pid,
    pub addr: u64,
    pub len: usize,
}

impl RemotePtr {
    pub fn new(pid: Pid, addr: u64, len: usize) -> Self {
        RemotePtr { pid, addr, len }
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        read_bytes(self.pid, self.addr, self.len)
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        debug_assert!(bytes.len() <= self.len);
        write_bytes(self.pid, self.addr, bytes)
    }
}

impl std::fmt::Debug for RemotePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{:#x}+{}", self.pid, self.addr, self.len)
    }
}

fn ensure_stopped(pid: Pid) -> Result<()> {
    match proc::task_state(pid) {
        Ok(TaskState::TraceStopped) | Ok(TaskState::Stopped) => Ok(()),
        Ok(_) => Err(Error::NotStopped(pid)),
        // /proc entry gone: the pid itself is the better diagnostic.
        Err(_) => Err(Error::NoSuchProcess(pid)),
    }
}

fn peek_word(pid: Pid, addr: u64) -> Result<libc::c_long> {
    ptrace::read(pid, addr as ptrace::AddressType).map_err(|_| Error::MemoryFault {
        pid,
        addr,
        len: WORD,
    })
}

fn poke_word(pid: Pid, addr: u64, word: libc::c_long) -> Result<()> {
    ptrace::write(pid, addr as ptrace::AddressType, word as *mut libc::c_void).map_err(|_| {
        Error::MemoryFault {
            pid,
            addr,
            len: WORD,
        }
    })
}

/// Write up to one word, preserving the surrounding bytes of the containing
/// word for sub-word spans.
fn poke_partial(pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
    debug_assert!(bytes.len() <= WORD);
    let mut raw = if bytes.len() < WORD {
        peek_word(pid, addr)?.to_ne_bytes()
    } else {
        [0u8; WORD]
    };
    raw[..bytes.len()].copy_from_slice(bytes);
    poke_word(pid, addr, libc::c_long::from_ne_bytes(raw))
}

/// Read `len` bytes starting at `addr` in the tracee.
pub fn read_bytes(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    ensure_stopped(pid)?;
    if len == 0 {
        return Ok(Vec::new());
    }
    if len <= WORD {
        let word = peek_word(pid, addr)?;
        return Ok(word.to_ne_bytes()[..len].to_vec());
    }

    let mut buf = vec![0u8; len];
    let remote = [uio::RemoteIoVec {
        base: addr as usize,
        len,
    }];
    let local = [uio::IoVec::from_mut_slice(buf.as_mut_slice())];
    match uio::process_vm_readv(pid, &local, &remote) {
        Ok(n) if n == len => Ok(buf),
        _ => {
            // Fall back to word-granularity reads.
            let mut off = 0;
            while off < len {
                let word = peek_word(pid, addr + off as u64)?;
                let raw = word.to_ne_bytes();
                let take = std::cmp::min(WORD, len - off);
                buf[off..off + take].copy_from_slice(&raw[..take]);
                off += take;
            }
            Ok(buf)
        }
    }
}

/// Write `bytes` starting at `addr` in the tracee.
pub fn write_bytes(pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
    ensure_stopped(pid)?;
    if bytes.is_empty() {
        return Ok(());
    }
    if bytes.len() <= WORD {
        return poke_partial(pid, addr, bytes);
    }

    let remote = [uio::RemoteIoVec {
        base: addr as usize,
        len: bytes.len(),
    }];
    let local = [uio::IoVec::from_slice(bytes)];
    match uio::process_vm_writev(pid, &local, &remote) {
        Ok(n) if n == bytes.len() => Ok(()),
        // process_vm_writev honors page protections, so writes into text
        // land here and go through ptrace instead.
        _ => {
            let mut off = 0;
            while off < bytes.len() {
                let take = std::cmp::min(WORD, bytes.len() - off);
                poke_partial(pid, addr + off as u64, &bytes[off..off + take])?;
                off += take;
            }
            Ok(())
        }
    }
}

/// Copy the tracee's register file out as one opaque block.
pub fn getregs(pid: Pid, arch: Arch) -> Result<RegSnapshot> {
    ensure_stopped(pid)?;
    let mut regs = arch.empty_regs();
    let (ptr, len) = regs.raw_parts_mut();
    let mut iov = libc::iovec {
        iov_base: ptr as *mut libc::c_void,
        iov_len: len,
    };
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            NT_PRSTATUS as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc < 0 {
        return Err(Error::RegisterIOFailed(pid));
    }
    Ok(regs)
}

/// Copy a register block back into the tracee.
pub fn setregs(pid: Pid, regs: &RegSnapshot) -> Result<()> {
    ensure_stopped(pid)?;
    let (ptr, len) = regs.raw_parts();
    let mut iov = libc::iovec {
        iov_base: ptr as *mut libc::c_void,
        iov_len: len,
    };
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            NT_PRSTATUS as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc < 0 {
        return Err(Error::RegisterIOFailed(pid));
    }
    Ok(())
}

/// Read a NUL-terminated string out of the tracee, up to `max` bytes.
pub fn read_cstring(pid: Pid, addr: u64, max: usize) -> Result<String> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < max {
        let chunk = std::cmp::min(WORD, max - off);
        let bytes = read_bytes(pid, addr + off as u64, chunk)?;
        match bytes.iter().position(|&b| b == 0) {
            Some(i) => {
                out.extend_from_slice(&bytes[..i]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            None => out.extend_from_slice(&bytes),
        }
        off += chunk;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    #[test]
    fn operations_refuse_a_running_process() {
        // Our own process is running, not ptrace-stopped.
        let me = unistd::getpid();
        match read_bytes(me, 0x1000, 8) {
            Err(Error::NotStopped(pid)) => assert_eq!(pid, me),
            other => panic!("expected NotStopped, got {:?}", other.map(|_| ())),
        }
        match getregs(me, Arch::native()) {
            Err(Error::NotStopped(_)) => (),
            other => panic!("expected NotStopped, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn remote_ptr_formats_compactly() {
        let p = RemotePtr::new(Pid::from_raw(7), 0xdead, 4);
        assert_eq!(format!("{:?}", p), "7:0xdead+4");
    }
}

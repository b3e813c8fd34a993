//! x86_64 syscall numbers used by the engine and the front-end, plus a
//! reverse name table for trace output.
//!
//! Hand-maintained; only syscalls this crate names need entries. The name
//! table intentionally covers a broader set so the strace-style logging
//! handler prints something readable for common calls.

use lazy_static::lazy_static;
use std::collections::HashMap;

macro_rules! syscall_nrs {
    ($(($name:ident, $nr:expr),)*) => {
        $(pub const $name: i64 = $nr;)*

        lazy_static! {
            static ref SYSCALL_NAMES: HashMap<i64, &'static str> = {
                let mut m = HashMap::new();
                $(m.insert($nr as i64, &stringify!($name)[4..]);)*
                m
            };
        }
    };
}

syscall_nrs! {
    (SYS_read, 0),
    (SYS_write, 1),
    (SYS_open, 2),
    (SYS_close, 3),
    (SYS_stat, 4),
    (SYS_fstat, 5),
    (SYS_lstat, 6),
    (SYS_poll, 7),
    (SYS_lseek, 8),
    (SYS_mmap, 9),
    (SYS_mprotect, 10),
    (SYS_munmap, 11),
    (SYS_brk, 12),
    (SYS_rt_sigaction, 13),
    (SYS_rt_sigprocmask, 14),
    (SYS_rt_sigreturn, 15),
    (SYS_ioctl, 16),
    (SYS_pread64, 17),
    (SYS_pwrite64, 18),
    (SYS_readv, 19),
    (SYS_writev, 20),
    (SYS_access, 21),
    (SYS_pipe, 22),
    (SYS_select, 23),
    (SYS_sched_yield, 24),
    (SYS_mremap, 25),
    (SYS_msync, 26),
    (SYS_mincore, 27),
    (SYS_madvise, 28),
    (SYS_dup, 32),
    (SYS_dup2, 33),
    (SYS_nanosleep, 35),
    (SYS_getpid, 39),
    (SYS_socket, 41),
    (SYS_connect, 42),
    (SYS_accept, 43),
    (SYS_sendto, 44),
    (SYS_recvfrom, 45),
    (SYS_bind, 49),
    (SYS_listen, 50),
    (SYS_clone, 56),
    (SYS_fork, 57),
    (SYS_vfork, 58),
    (SYS_execve, 59),
    (SYS_exit, 60),
    (SYS_wait4, 61),
    (SYS_kill, 62),
    (SYS_uname, 63),
    (SYS_fcntl, 72),
    (SYS_getcwd, 79),
    (SYS_chdir, 80),
    (SYS_rename, 82),
    (SYS_mkdir, 83),
    (SYS_rmdir, 84),
    (SYS_unlink, 87),
    (SYS_readlink, 89),
    (SYS_chmod, 90),
    (SYS_chown, 92),
    (SYS_gettimeofday, 96),
    (SYS_getuid, 102),
    (SYS_getgid, 104),
    (SYS_geteuid, 107),
    (SYS_getppid, 110),
    (SYS_arch_prctl, 158),
    (SYS_gettid, 186),
    (SYS_futex, 202),
    (SYS_getdents64, 217),
    (SYS_set_tid_address, 218),
    (SYS_clock_gettime, 228),
    (SYS_clock_nanosleep, 230),
    (SYS_exit_group, 231),
    (SYS_openat, 257),
    (SYS_mkdirat, 258),
    (SYS_newfstatat, 262),
    (SYS_unlinkat, 263),
    (SYS_renameat, 264),
    (SYS_readlinkat, 267),
    (SYS_faccessat, 269),
    (SYS_set_robust_list, 273),
    (SYS_prlimit64, 302),
    (SYS_getrandom, 318),
    (SYS_statx, 332),
    (SYS_rseq, 334),
}

/// Marker value that makes the kernel skip the pending syscall. Writing it
/// into the syscall-number register at an enter stop turns the call into a
/// no-op that returns `-ENOSYS`.
pub const SYSCALL_SKIP: i64 = -1;

pub fn syscall_name(nr: i64) -> Option<&'static str> {
    SYSCALL_NAMES.get(&nr).copied()
}

/// Every syscall number the name table knows, ascending.
pub fn known_syscalls() -> Vec<i64> {
    let mut nrs: Vec<i64> = SYSCALL_NAMES.keys().copied().collect();
    nrs.sort();
    nrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_lookup_strips_prefix() {
        assert_eq!(syscall_name(SYS_openat), Some("openat"));
        assert_eq!(syscall_name(SYS_mmap), Some("mmap"));
        assert_eq!(syscall_name(-2), None);
    }
}

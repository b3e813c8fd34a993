//! procfs access: `/proc/<pid>/maps` parsing and task-state queries.

use std::path::PathBuf;

use combine::error::ParseError;
use combine::parser::char::{char, digit, hex_digit, spaces};
use combine::Parser;
use combine::{choice, many1, none_of, optional, Stream};

use nix::unistd::Pid;

use crate::errors::{Error, Result};

/// One line of a tracee's memory map.
#[derive(Clone)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub prot: i32,
    pub flags: i32,
    pub offset: u64,
    pub dev: i32,
    pub inode: u64,
    pub path: Option<PathBuf>,
}

impl MapEntry {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_exec(&self) -> bool {
        self.prot & libc::PROT_EXEC != 0
    }

    /// Basename of the backing file, when the mapping is file-backed.
    pub fn file_name(&self) -> Option<&str> {
        self.path.as_ref().and_then(|p| p.file_name()).and_then(|n| n.to_str())
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl std::fmt::Debug for MapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut perms = String::with_capacity(4);
        perms.push(if self.prot & libc::PROT_READ != 0 { 'r' } else { '-' });
        perms.push(if self.prot & libc::PROT_WRITE != 0 { 'w' } else { '-' });
        perms.push(if self.prot & libc::PROT_EXEC != 0 { 'x' } else { '-' });
        perms.push(if self.flags & libc::MAP_SHARED != 0 {
            's'
        } else if self.flags & libc::MAP_PRIVATE != 0 {
            'p'
        } else {
            '-'
        });
        write!(
            f,
            "{:x}-{:x} {} {:08x} {}",
            self.start,
            self.end,
            perms,
            self.offset,
            self.path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        )
    }
}

fn hex_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(hex_digit()).map(|s| u64::from_str_radix(&s, 16).unwrap_or(0))
}

fn dec_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(digit()).map(|s| s.parse::<u64>().unwrap_or(0))
}

fn dev<I>() -> impl Parser<Input = I, Output = i32>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        many1::<String, _>(hex_digit()),
        char(':'),
        many1::<String, _>(hex_digit()),
    )
        .map(|(_, major, _, minor)| {
            i32::from_str_radix(&major, 16).unwrap_or(0) * 256
                + i32::from_str_radix(&minor, 16).unwrap_or(0)
        })
}

fn perms<I>() -> impl Parser<Input = I, Output = (i32, i32)>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        choice([char('-'), char('r')]),
        choice([char('-'), char('w')]),
        choice([char('-'), char('x')]),
        choice([char('-'), char('s'), char('p')]),
    )
        .map(|(_, r, w, x, p)| {
            let mut prot: i32 = 0;
            let mut flags: i32 = 0;
            if r == 'r' {
                prot |= libc::PROT_READ;
            }
            if w == 'w' {
                prot |= libc::PROT_WRITE;
            }
            if x == 'x' {
                prot |= libc::PROT_EXEC;
            }
            if p == 'p' {
                flags |= libc::MAP_PRIVATE;
            } else if p == 's' {
                flags |= libc::MAP_SHARED;
            }
            (prot, flags)
        })
}

fn file_path<I>() -> impl Parser<Input = I, Output = Option<PathBuf>>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        spaces(),
        optional(many1::<String, _>(none_of("\r\n".chars()))),
    )
        .map(|(_, path)| path.map(PathBuf::from))
}

fn map_line<I>() -> impl Parser<Input = I, Output = MapEntry>
where
    I: Stream<Item = char>,
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        hex_value(),
        char('-'),
        hex_value(),
        perms(),
        spaces(),
        hex_value(),
        dev(),
        spaces(),
        dec_value(),
        file_path(),
    )
        .map(|(start, _, end, (prot, flags), _, offset, devno, _, inode, path)| MapEntry {
            start,
            end,
            prot,
            flags,
            offset,
            dev: devno,
            inode,
            path,
        })
}

fn parse_map_line(line: &str) -> Result<MapEntry> {
    match map_line().easy_parse(line) {
        Ok((entry, _rest)) => Ok(entry),
        Err(err) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad maps line {:?}: {}", line, err),
        ))),
    }
}

/// Decode `/proc/<pid>/maps`.
pub fn read_process_maps(pid: Pid) -> Result<Vec<MapEntry>> {
    let path = PathBuf::from("/proc").join(format!("{}", pid)).join("maps");
    let contents = std::fs::read_to_string(path)?;
    contents.lines().map(parse_map_line).collect()
}

/// Scheduler state of a task, decoded from `/proc/<pid>/status`.
/// Kernel 3.13+ state letters only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    SleepInterruptible,
    SleepUninterruptible,
    Stopped,
    TraceStopped,
    Zombie,
    Dead,
}

pub fn task_state(pid: Pid) -> Result<TaskState> {
    let path = PathBuf::from("/proc").join(format!("{}", pid)).join("status");
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .find(|l| l.starts_with("State:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| match s {
            "R" => Some(TaskState::Running),
            "S" => Some(TaskState::SleepInterruptible),
            "D" => Some(TaskState::SleepUninterruptible),
            "T" => Some(TaskState::Stopped),
            "t" => Some(TaskState::TraceStopped),
            "Z" => Some(TaskState::Zombie),
            "X" => Some(TaskState::Dead),
            _ => None,
        })
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unreadable task state for {}", pid),
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd;

    #[test]
    fn parses_a_file_backed_line() {
        let line = "7f1b2c000000-7f1b2c1b0000 r-xp 00000000 103:02 1571633 /usr/lib/x86_64-linux-gnu/libc-2.31.so";
        let e = parse_map_line(line).unwrap();
        assert_eq!(e.start, 0x7f1b2c000000);
        assert_eq!(e.end, 0x7f1b2c1b0000);
        assert!(e.is_exec());
        assert_eq!(e.flags & libc::MAP_PRIVATE, libc::MAP_PRIVATE);
        assert_eq!(e.inode, 1571633);
        assert_eq!(e.file_name(), Some("libc-2.31.so"));
    }

    #[test]
    fn parses_an_anonymous_line() {
        let line = "7ffc7b3a9000-7ffc7b3ca000 rw-p 00000000 00:00 0";
        let e = parse_map_line(line).unwrap();
        assert!(e.path.is_none());
        assert!(!e.is_exec());
    }

    #[test]
    fn decodes_own_maps() {
        let maps = read_process_maps(unistd::getpid()).unwrap();
        assert!(!maps.is_empty());
        // Our own text must appear as an executable file-backed mapping.
        assert!(maps.iter().any(|e| e.is_exec() && e.path.is_some()));
    }

    #[test]
    fn own_state_is_alive() {
        // The status file reports the main thread, which may be running
        // or parked waiting for this test thread.
        match task_state(unistd::getpid()).unwrap() {
            TaskState::Running | TaskState::SleepInterruptible => (),
            other => panic!("unexpected state for self: {:?}", other),
        }
    }
}

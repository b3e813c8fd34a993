//! Per-tracee module map: loaded image name to load base.

use std::path::PathBuf;

use nix::unistd::Pid;

use crate::errors::Result;
use crate::proc::{self, MapEntry};

#[derive(Clone, Debug)]
struct Module {
    path: PathBuf,
    base: u64,
}

/// Mapping from module name to load base, built from the OS's view of the
/// tracee's loaded images. Rebuilt on exec.
#[derive(Clone, Debug, Default)]
pub struct ModuleMap {
    modules: Vec<Module>,
}

impl ModuleMap {
    pub fn empty() -> Self {
        Default::default()
    }

    pub fn from_pid(pid: Pid) -> Result<Self> {
        Ok(Self::from_entries(&proc::read_process_maps(pid)?))
    }

    pub fn from_entries(entries: &[MapEntry]) -> Self {
        let mut modules: Vec<Module> = Vec::new();
        for e in entries {
            let path = match &e.path {
                Some(p) => p,
                None => continue,
            };
            // Pseudo-files like [vdso] have no load base of interest.
            if path.to_string_lossy().starts_with('[') {
                continue;
            }
            match modules.iter_mut().find(|m| &m.path == path) {
                Some(m) => m.base = std::cmp::min(m.base, e.start),
                None => modules.push(Module {
                    path: path.clone(),
                    base: e.start,
                }),
            }
        }
        ModuleMap { modules }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Load base of `module`, matched against the full path or the
    /// basename of each loaded image.
    pub fn base_of(&self, module: &str) -> Option<u64> {
        self.modules
            .iter()
            .find(|m| {
                m.path.to_str().map_or(false, |p| p == module)
                    || m.path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map_or(false, |n| n == module)
            })
            .map(|m| m.base)
    }

    /// `(module, offset)` to absolute address, `None` while the module is
    /// not loaded.
    pub fn resolve(&self, module: &str, offset: u64) -> Option<u64> {
        self.base_of(module).map(|base| base + offset)
    }

    /// Module containing `addr`, for coverage attribution.
    pub fn module_containing(&self, addr: u64) -> Option<(&str, u64)> {
        self.modules
            .iter()
            .filter(|m| m.base <= addr)
            .max_by_key(|m| m.base)
            .and_then(|m| {
                m.path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| (n, m.base))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: u64, end: u64, path: Option<&str>) -> MapEntry {
        MapEntry {
            start,
            end,
            prot: libc::PROT_READ | libc::PROT_EXEC,
            flags: libc::MAP_PRIVATE,
            offset: 0,
            dev: 0,
            inode: 0,
            path: path.map(PathBuf::from),
        }
    }

    #[test]
    fn lowest_mapping_wins_as_base() {
        let map = ModuleMap::from_entries(&[
            entry(0x7f00_0040_0000, 0x7f00_0041_0000, Some("/usr/lib/libfoo.so")),
            entry(0x7f00_0000_0000, 0x7f00_0001_0000, Some("/usr/lib/libfoo.so")),
            entry(0x5500_0000_0000, 0x5500_0001_0000, Some("/usr/bin/target")),
            entry(0x7ffd_0000_0000, 0x7ffd_0000_1000, None),
        ]);
        assert_eq!(map.base_of("libfoo.so"), Some(0x7f00_0000_0000));
        assert_eq!(map.base_of("/usr/lib/libfoo.so"), Some(0x7f00_0000_0000));
        assert_eq!(map.base_of("target"), Some(0x5500_0000_0000));
        assert_eq!(map.base_of("libbar.so"), None);
    }

    #[test]
    fn resolve_adds_the_offset() {
        let map = ModuleMap::from_entries(&[entry(0x40_0000, 0x50_0000, Some("/bin/prog"))]);
        assert_eq!(map.resolve("prog", 0x1234), Some(0x40_1234));
        assert_eq!(map.resolve("missing", 0x1234), None);
    }

    #[test]
    fn pseudo_modules_are_skipped() {
        let map = ModuleMap::from_entries(&[entry(0x1000, 0x2000, Some("[vdso]"))]);
        assert!(map.is_empty());
    }

    #[test]
    fn own_map_contains_an_executable() {
        let map = ModuleMap::from_pid(nix::unistd::getpid()).unwrap();
        assert!(!map.is_empty());
    }
}

//! ELF symbol lookup: function name to module-relative offset.

use std::path::Path;

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use log::debug;

use crate::errors::{Error, Result};

fn find_function(
    syms: impl Iterator<Item = goblin::elf::sym::Sym>,
    strtab: &goblin::strtab::Strtab,
    name: &str,
) -> Option<u64> {
    for sym in syms {
        if sym.st_value == 0 || !sym.is_function() {
            continue;
        }
        if let Some(Ok(sym_name)) = strtab.get(sym.st_name) {
            if sym_name == name {
                return Some(sym.st_value);
            }
        }
    }
    None
}

/// Resolve `name` in the ELF image at `path` to an offset from the image's
/// load base. Works for both PIE/shared objects and fixed-address
/// executables by subtracting the lowest PT_LOAD vaddr.
pub fn symbol_offset(path: &Path, name: &str) -> Result<u64> {
    let bytes = std::fs::read(path)?;
    let elf = Elf::parse(&bytes).map_err(|err| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: {}", path.display(), err),
        ))
    })?;

    let load_bias = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .map(|ph| ph.p_vaddr)
        .min()
        .unwrap_or(0);

    let vaddr = find_function(elf.dynsyms.iter(), &elf.dynstrtab, name)
        .or_else(|| find_function(elf.syms.iter(), &elf.strtab, name));

    match vaddr {
        Some(va) => {
            let offset = va - load_bias;
            debug!(
                "{}: symbol {} at vaddr {:#x}, offset {:#x}",
                path.display(),
                name,
                va,
                offset
            );
            Ok(offset)
        }
        None => Err(Error::Unresolved {
            module: path.display().to_string(),
            offset: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_symbol_reports_unresolved() {
        let err = symbol_offset(Path::new("/proc/self/exe"), "no_such_function_here_42")
            .unwrap_err();
        match err {
            Error::Unresolved { .. } => (),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn missing_file_reports_io() {
        assert!(symbol_offset(Path::new("/does/not/exist"), "main").is_err());
    }
}

use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

use tracekit::proc::read_process_maps;
use tracekit::symbols::symbol_offset;
use tracekit::{Breakpoint, Debugger, Decision, TargetDescription};

fn shared_libc() -> Option<PathBuf> {
    let maps = read_process_maps(nix::unistd::getpid()).ok()?;
    maps.iter()
        .filter(|e| e.is_exec())
        .filter_map(|e| e.path.clone())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("libc.so") || n.starts_with("libc-"))
        })
}

// A persistent breakpoint at libc's exit() fires when the tracee shuts
// down, and the tracee still exits cleanly afterwards because the
// displaced instruction was stepped over and restored transparently.
#[test]
fn breakpoint_at_libc_exit_fires() {
    // Statically linked test runner: no shared libc to breakpoint in.
    let libc_path = match shared_libc() {
        Some(p) => p,
        None => return,
    };
    let offset = symbol_offset(&libc_path, "exit").unwrap();
    let module = libc_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap()
        .to_string();

    let mut dbg = Debugger::new(TargetDescription::native());
    // Syscall stops give the resolver a chance to see libc once the
    // dynamic loader maps it.
    dbg.trace_syscalls(true);

    let hits = Rc::new(Cell::new(0u32));
    let counter = hits.clone();
    dbg.add_breakpoint(Breakpoint::new(
        &module,
        offset,
        move |_view| {
            counter.set(counter.get() + 1);
            Decision::Continue
        },
        false,
    ))
    .unwrap();

    dbg.spawn(&["/bin/true".to_string()]).unwrap();
    dbg.event_loop().unwrap();

    assert!(hits.get() >= 1, "breakpoint never fired");
    assert!(dbg.take_diagnostics().is_empty());
}

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use tracekit::proc::read_process_maps;
use tracekit::symbols::symbol_offset;
use tracekit::{CoverageSink, Debugger, MemorySink, TargetDescription};

struct SharedSink(Rc<RefCell<MemorySink>>);

impl CoverageSink for SharedSink {
    fn record(&mut self, pid: u32, module_id: u16, addr: u64) {
        self.0.borrow_mut().record(pid, module_id, addr);
    }
}

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

// A coverage probe records (pid, module_id, offset) once its block
// executes, with no handler involved.
#[test]
fn coverage_probe_reports_to_the_sink() {
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
    dbg.trace_syscalls(true);

    let records = Rc::new(RefCell::new(MemorySink::new()));
    dbg.set_coverage_sink(Box::new(SharedSink(records.clone())));
    dbg.add_coverage_breakpoints(&module, 7, &[offset]).unwrap();

    let pid = dbg.spawn(&["/bin/true".to_string()]).unwrap();
    dbg.event_loop().unwrap();

    let sink = records.borrow();
    assert!(!sink.records.is_empty(), "no coverage records");
    for (rec_pid, module_id, addr) in &sink.records {
        assert_eq!(*rec_pid, pid.as_raw() as u32);
        assert_eq!(*module_id, 7);
        assert_eq!(*addr, offset);
    }
}

use std::cell::Cell;
use std::rc::Rc;

use tracekit::{nr, Debugger, SyscallHandler, TargetDescription};

// Enter/exit stops for one syscall must strictly alternate, starting with
// an enter; exit_group enters exactly once and never returns.
#[test]
fn syscall_stops_alternate_beginning_with_enter() {
    let mut dbg = Debugger::new(TargetDescription::native());
    dbg.trace_syscalls(true);

    let enters = Rc::new(Cell::new(0u32));
    let exits = Rc::new(Cell::new(0u32));
    let in_flight = Rc::new(Cell::new(false));
    let violations = Rc::new(Cell::new(0u32));

    let (e, x, f1, f2) = (enters.clone(), exits.clone(), in_flight.clone(), in_flight.clone());
    let (v1, v2) = (violations.clone(), violations.clone());
    dbg.add_syscall_handler(
        nr::SYS_mmap,
        SyscallHandler::new()
            .on_enter(move |_data, _view| {
                e.set(e.get() + 1);
                if f1.get() {
                    v1.set(v1.get() + 1);
                }
                f1.set(true);
                None
            })
            .on_exit(move |_data, _view| {
                x.set(x.get() + 1);
                if !f2.get() {
                    v2.set(v2.get() + 1);
                }
                f2.set(false);
            }),
    );

    let exit_group_enters = Rc::new(Cell::new(0u32));
    let g = exit_group_enters.clone();
    dbg.add_syscall_handler(
        nr::SYS_exit_group,
        SyscallHandler::new().on_enter(move |_data, _view| {
            g.set(g.get() + 1);
            None
        }),
    );

    dbg.spawn(&["/bin/true".to_string()]).unwrap();
    dbg.event_loop().unwrap();

    // The dynamic loader maps its images, so mmap always shows up.
    assert!(enters.get() > 0, "no mmap enters observed");
    assert_eq!(enters.get(), exits.get(), "unbalanced enter/exit");
    assert_eq!(violations.get(), 0, "phase alternation violated");
    assert_eq!(exit_group_enters.get(), 1);
    assert!(dbg.take_diagnostics().is_empty());
}

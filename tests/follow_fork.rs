use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use tracekit::{nr, Debugger, SyscallHandler, TargetDescription};

// With follow-fork enabled, children created by the shell become tracees
// of their own: exit_group is observed from more than one pid.
#[test]
fn forked_children_are_traced() {
    let mut dbg = Debugger::new(TargetDescription::native());
    dbg.trace_syscalls(true);
    dbg.follow_fork(true);

    let pids: Rc<RefCell<HashSet<i32>>> = Rc::new(RefCell::new(HashSet::new()));
    let seen = pids.clone();
    dbg.add_syscall_handler(
        nr::SYS_exit_group,
        SyscallHandler::new().on_enter(move |_data, view| {
            seen.borrow_mut().insert(view.pid().as_raw());
            None
        }),
    );

    dbg.spawn(&[
        "/bin/sh".to_string(),
        "-c".to_string(),
        "/bin/true; /bin/true".to_string(),
    ])
    .unwrap();
    dbg.event_loop().unwrap();

    assert!(
        pids.borrow().len() >= 2,
        "expected exits from at least two pids, saw {:?}",
        pids.borrow()
    );
    assert_eq!(dbg.tracee_count(), 0);
    assert!(dbg.take_diagnostics().is_empty());
}

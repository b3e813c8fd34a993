use std::cell::Cell;
use std::rc::Rc;

use tracekit::{nr, Debugger, SyscallInjection, TargetDescription};

// Inject getpid into a freshly spawned tracee: the completion callback
// fires exactly once with the tracee's own pid, and the tracee survives to
// run to a normal exit.
#[test]
fn injected_getpid_returns_the_tracee_pid() {
    let mut dbg = Debugger::new(TargetDescription::native());

    let pid = dbg.spawn(&["/bin/true".to_string()]).unwrap();

    let ret_slot = Rc::new(Cell::new(0i64));
    let fired = Rc::new(Cell::new(0u32));
    let (slot, count) = (ret_slot.clone(), fired.clone());
    dbg.inject_syscall(
        pid,
        SyscallInjection::new(nr::SYS_getpid).on_complete(move |ret, _view| {
            slot.set(ret);
            count.set(count.get() + 1);
        }),
    )
    .unwrap();

    dbg.event_loop().unwrap();

    assert_eq!(fired.get(), 1, "completion callback count");
    assert_eq!(ret_slot.get(), pid.as_raw() as i64);
    assert_eq!(dbg.tracee_count(), 0);
    assert!(dbg.take_diagnostics().is_empty());
}

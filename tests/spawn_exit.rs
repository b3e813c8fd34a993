use tracekit::{Debugger, TargetDescription};

#[test]
fn spawned_tracee_runs_to_exit() {
    let mut dbg = Debugger::new(TargetDescription::native());
    let pid = dbg.spawn(&["/bin/true".to_string()]).unwrap();
    assert!(pid.as_raw() > 0);
    assert_eq!(dbg.tracee_count(), 1);

    dbg.event_loop().unwrap();

    assert_eq!(dbg.tracee_count(), 0);
    assert!(dbg.take_diagnostics().is_empty());
}

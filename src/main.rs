//! Command-line front-end: spawn or attach to a target, optionally log
//! its syscalls strace-style, and run the event loop.

use clap::{App, AppSettings, Arg};
use colored::Colorize;
use log::{info, warn};
use nix::unistd::Pid;

use tracekit::{nr, Debugger, SyscallHandler, TargetDescription};

fn setup_logger(level: log::LevelFilter, log_file: Option<&str>) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            let level = match record.level() {
                log::Level::Error => "ERROR".red(),
                log::Level::Warn => "WARN".yellow(),
                log::Level::Info => "INFO".green(),
                log::Level::Debug => "DEBUG".cyan(),
                log::Level::Trace => "TRACE".normal(),
            };
            out.finish(format_args!(
                "[{} {:<5} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                level,
                record.target(),
                message
            ))
        })
        .level(level);
    dispatch = match log_file {
        Some(path) => dispatch.chain(fern::log_file(path)?),
        None => dispatch.chain(std::io::stderr()),
    };
    dispatch.apply()?;
    Ok(())
}

fn log_level_from(n: u64) -> log::LevelFilter {
    match n {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// One logging hook per known syscall: prints `name(args..) = ret` at the
/// exit stop.
fn install_strace_handlers(dbg: &mut Debugger) {
    for sysno in nr::known_syscalls() {
        let name = nr::syscall_name(sysno).unwrap_or("?");
        dbg.add_syscall_handler(
            sysno,
            SyscallHandler::new().on_exit(move |data, view| {
                info!(
                    "[pid {}] {}({:#x}, {:#x}, {:#x}) = {}",
                    view.pid(),
                    name,
                    data.arg(0),
                    data.arg(1),
                    data.arg(2),
                    data.ret()
                );
            }),
        );
    }
}

fn run() -> i32 {
    let matches = App::new("tracekit")
        .version("0.1.0")
        .about("scriptable ptrace-based tracer")
        .setting(AppSettings::TrailingVarArg)
        .arg(
            Arg::with_name("pid")
                .short("p")
                .long("pid")
                .takes_value(true)
                .help("attach to an existing process instead of spawning"),
        )
        .arg(
            Arg::with_name("no-trace-syscalls")
                .long("no-trace-syscalls")
                .help("do not stop at syscall boundaries"),
        )
        .arg(
            Arg::with_name("follow-fork")
                .long("follow-fork")
                .help("auto-attach children created by fork/vfork/clone"),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .takes_value(true)
                .default_value("3")
                .help("log level, 0 (off) to 5 (trace)"),
        )
        .arg(
            Arg::with_name("log-file")
                .long("log-file")
                .takes_value(true)
                .help("write logs to a file instead of stderr"),
        )
        .arg(Arg::with_name("command").multiple(true).help("program to spawn and its arguments"))
        .get_matches();

    let level = matches
        .value_of("debug")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(3);
    if let Err(err) = setup_logger(log_level_from(level), matches.value_of("log-file")) {
        eprintln!("tracekit: logger setup failed: {}", err);
    }

    let mut dbg = Debugger::new(TargetDescription::native());
    let trace_syscalls = !matches.is_present("no-trace-syscalls");
    dbg.trace_syscalls(trace_syscalls);
    dbg.follow_fork(matches.is_present("follow-fork"));
    if trace_syscalls {
        install_strace_handlers(&mut dbg);
    }

    let pid_arg = matches
        .value_of("pid")
        .and_then(|s| s.parse::<libc::pid_t>().ok());
    let command: Option<Vec<String>> = matches
        .values_of("command")
        .map(|vals| vals.map(String::from).collect());

    let started = match (pid_arg, command) {
        (Some(pid), _) => dbg.attach(Pid::from_raw(pid)),
        (None, Some(cmd)) if !cmd.is_empty() => dbg.spawn(&cmd).map(|_| ()),
        _ => {
            eprintln!("usage: tracekit [-p PID | PROG ARGS...]");
            return 2;
        }
    };
    if let Err(err) = started {
        eprintln!("tracekit: {}", err);
        return 1;
    }

    let result = dbg.event_loop();
    for (pid, err) in dbg.take_diagnostics() {
        warn!("tracee {}: {}", pid, err);
    }
    match result {
        Ok(()) => {
            info!("no tracees remain, exiting");
            0
        }
        Err(err) => {
            eprintln!("tracekit: event loop failed: {}", err);
            1
        }
    }
}

fn main() {
    std::process::exit(run());
}

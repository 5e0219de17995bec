use std::sync::Arc;

use clap::Parser;
use log::LevelFilter;
use nix::sys::signal::Signal;

use pidsentry::core::configuration::{self, CliOptions, Mode, Options};
use pidsentry::core::logger::sentry_logger;
use pidsentry::sentry::command::Command;
use pidsentry::sentry::ExitCode;
use pidsentry::utility::{signal, time};

fn main() -> std::process::ExitCode {
    time::init_process_clock();

    // clap prints its own message for parse failures and --help.
    let cli = CliOptions::parse();

    let (options, cmd) = match configuration::validate(cli) {
        Ok(validated) => validated,
        Err(err) => {
            eprintln!("pidsentry: {err}");
            return std::process::ExitCode::from(ExitCode::FAILURE.value());
        }
    };

    let log_level = match options.debug {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if sentry_logger::init(log_level).is_err() {
        eprintln!("pidsentry: Unable to initialise logging");
        return std::process::ExitCode::from(ExitCode::FAILURE.value());
    }

    if let Err(err) = signal::install_handlers() {
        log::error!("Unable to install signal handlers: {err:#}");
        return std::process::ExitCode::from(ExitCode::FAILURE.value());
    }

    let result = match options.mode {
        Mode::Command { relaxed } => run_command(&options, relaxed, &cmd),
        Mode::Supervise => run_supervise(options, cmd),
    };

    let exit_code = match result {
        Ok(exit_code) => exit_code,
        Err(err) => {
            log_failure(&err);
            ExitCode::FAILURE
        }
    };

    log::logger().flush();
    std::process::ExitCode::from(exit_code.value())
}

fn run_supervise(options: Options, cmd: Vec<String>) -> anyhow::Result<ExitCode> {
    log::debug!(
        "watchdog process pid {} pgid {}",
        nix::unistd::getpid(),
        nix::unistd::getpgrp()
    );

    // Broken pipes surface as EPIPE on the write that hit them, never as a
    // fatal signal.
    signal::ignore_signal(Signal::SIGPIPE)?;

    pidsentry::sentry::run_supervise(Arc::new(options), cmd)
}

fn run_command(options: &Options, relaxed: bool, cmd: &[String]) -> anyhow::Result<ExitCode> {
    let pidfile = options.pidfile.as_deref().expect("command mode validated");
    let mut command = Command::create(pidfile, relaxed)?;
    command.run(cmd)
}

/// Report a failure, one line per frame of the error chain, with the errno
/// of the originating syscall on the final frame.
fn log_failure(err: &anyhow::Error) {
    let errno = err.chain().last().and_then(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::raw_os_error)
            .or_else(|| {
                cause
                    .downcast_ref::<nix::errno::Errno>()
                    .map(|errno| *errno as i32)
            })
    });

    let frames: Vec<String> = err.chain().map(ToString::to_string).collect();
    let last = frames.len().saturating_sub(1);
    for (index, frame) in frames.into_iter().enumerate() {
        match (index == last, errno) {
            (true, Some(errno)) => log::error!("{frame} - errno {errno}"),
            _ => log::error!("{frame}"),
        }
    }
}

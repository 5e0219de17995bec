//! End-to-end supervision scenarios, driven against a built pidsentry
//! binary.
//!
//! Set `PIDSENTRY_BIN` to the binary under test, e.g.
//! `PIDSENTRY_BIN=target/debug/pidsentry target/debug/test_supervise`.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use test_utils::{check, named_tests, run_tests, wait_until, TestFn};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

fn pidsentry_bin() -> Option<String> {
    std::env::var("PIDSENTRY_BIN").ok()
}

fn command(bin: &str, args: &[&str]) -> Command {
    let mut command = Command::new(bin);
    command.args(args);
    command.stdin(Stdio::null());
    command
}

/// Read the `--identify` announcements: `watchdog umbilical\n` then
/// `child\n`.
fn read_identity(child: &mut Child) -> Result<(Pid, Pid, Pid), String> {
    let stdout = child.stdout.as_mut().ok_or("stdout not piped")?;
    let mut text = String::new();
    let mut buf = [0u8; 256];
    while !text.contains('\n') || text.matches('\n').count() < 2 {
        let count = stdout.read(&mut buf).map_err(|err| err.to_string())?;
        if count == 0 {
            return Err(format!("identity output truncated: {text:?}"));
        }
        text.push_str(&String::from_utf8_lossy(&buf[..count]));
    }

    let mut lines = text.lines();
    let first = lines.next().ok_or("missing identity line")?;
    let second = lines.next().ok_or("missing child pid line")?;

    let mut pids = first.split_whitespace();
    let watchdog: i32 = pids
        .next()
        .and_then(|pid| pid.parse().ok())
        .ok_or("bad watchdog pid")?;
    let umbilical: i32 = pids
        .next()
        .and_then(|pid| pid.parse().ok())
        .ok_or("bad umbilical pid")?;
    let child_pid: i32 = second.trim().parse().map_err(|_| "bad child pid")?;

    Ok((
        Pid::from_raw(watchdog),
        Pid::from_raw(umbilical),
        Pid::from_raw(child_pid),
    ))
}

/// S1: a trivial child exits cleanly, the pidfile exists for its lifetime
/// and is gone afterwards.
fn test_happy_path() -> Result<(), String> {
    let bin = pidsentry_bin().ok_or("PIDSENTRY_BIN not set")?;
    let dir = check(tempfile::tempdir())?;
    let pidfile = dir.path().join("s1.pid");
    let pidfile_arg = pidfile.to_str().unwrap();

    let mut sentry = check(
        command(&bin, &["-p", pidfile_arg, "-i", "--", "sleep", "2"])
            .stdout(Stdio::piped())
            .spawn(),
    )?;

    let (_, _, child_pid) = read_identity(&mut sentry)?;

    // The identify handshake guarantees the pidfile is already announced.
    let content = std::fs::read_to_string(&pidfile).map_err(|err| err.to_string())?;
    let first_line = content.lines().next().ok_or("empty pidfile")?;
    if first_line != child_pid.to_string() {
        return Err(format!(
            "pidfile names {first_line}, expected {child_pid}"
        ));
    }

    let status = check(sentry.wait())?;
    if status.code() != Some(0) {
        return Err(format!("expected exit 0, got {status:?}"));
    }
    if pidfile.exists() {
        return Err("pidfile survived the child".to_string());
    }
    Ok(())
}

/// S2: SIGTERM to the supervisor is forwarded to the child, and the exit
/// code reports the signal.
fn test_signal_forwarding() -> Result<(), String> {
    let bin = pidsentry_bin().ok_or("PIDSENTRY_BIN not set")?;

    let mut sentry = check(
        command(&bin, &["-i", "--", "sleep", "10"])
            .stdout(Stdio::piped())
            .spawn(),
    )?;

    let _ = read_identity(&mut sentry)?;
    check(kill(Pid::from_raw(sentry.id() as i32), Signal::SIGTERM))?;

    let status = check(sentry.wait())?;
    if status.code() != Some(128 + 15) {
        return Err(format!("expected exit 143, got {status:?}"));
    }
    Ok(())
}

/// S5: a stale pidfile naming a dead process does not block a new sentry.
fn test_stale_pidfile_recovery() -> Result<(), String> {
    let bin = pidsentry_bin().ok_or("PIDSENTRY_BIN not set")?;
    let dir = check(tempfile::tempdir())?;
    let pidfile = dir.path().join("s5.pid");

    std::fs::write(&pidfile, "2147483000\n\nstale-boot:1\nold-keeper\n")
        .map_err(|err| err.to_string())?;

    let status = check(
        command(&bin, &["-p", pidfile.to_str().unwrap(), "--", "true"]).status(),
    )?;
    if status.code() != Some(0) {
        return Err(format!("expected exit 0, got {status:?}"));
    }
    if pidfile.exists() {
        return Err("pidfile not cleaned up".to_string());
    }
    Ok(())
}

/// S6: command mode exposes the supervised pid and holds a keeper
/// reference while the side command runs.
fn test_command_mode_reference() -> Result<(), String> {
    let bin = pidsentry_bin().ok_or("PIDSENTRY_BIN not set")?;
    let dir = check(tempfile::tempdir())?;
    let pidfile = dir.path().join("s6.pid");
    let pidfile_arg = pidfile.to_str().unwrap().to_string();

    let mut sentry = check(
        command(&bin, &["-p", &pidfile_arg, "-i", "--", "sleep", "10"])
            .stdout(Stdio::piped())
            .spawn(),
    )?;
    let (_, _, child_pid) = read_identity(&mut sentry)?;

    let output = check(
        command(
            &bin,
            &["-p", &pidfile_arg, "--command", "--", "printenv", "PIDSENTRY_PID"],
        )
        .stdout(Stdio::piped())
        .output(),
    )?;
    if output.status.code() != Some(0) {
        return Err(format!("command mode failed: {:?}", output.status));
    }
    let reported = String::from_utf8_lossy(&output.stdout);
    if reported.trim() != child_pid.to_string() {
        return Err(format!(
            "PIDSENTRY_PID was {reported:?}, expected {child_pid}"
        ));
    }

    check(kill(Pid::from_raw(sentry.id() as i32), Signal::SIGTERM))?;
    let status = check(sentry.wait())?;
    if status.code() != Some(128 + 15) {
        return Err(format!("expected exit 143, got {status:?}"));
    }
    wait_until(STARTUP_TIMEOUT, || !pidfile.exists())?;
    Ok(())
}

/// S4: SIGKILL of the watchdog itself leaves no reaper, but the umbilical
/// notices the broken socket and kills the child's process group.
fn test_umbilical_cutover() -> Result<(), String> {
    let bin = pidsentry_bin().ok_or("PIDSENTRY_BIN not set")?;

    let mut sentry = check(
        command(&bin, &["-i", "--", "sleep", "60"])
            .stdout(Stdio::piped())
            .spawn(),
    )?;
    let (watchdog, _, child_pid) = read_identity(&mut sentry)?;

    check(kill(watchdog, Signal::SIGKILL))?;

    // The child dies even though no watchdog remained to reap it. It may
    // linger briefly as a zombie of init.
    wait_until(STARTUP_TIMEOUT, || {
        matches!(kill(child_pid, None), Err(nix::errno::Errno::ESRCH))
    })?;

    let status = check(sentry.wait())?;
    if status.code() != Some(128 + 9) {
        return Err(format!("expected exit 137, got {status:?}"));
    }
    Ok(())
}

/// Command mode with `--relaxed` tolerates a missing pidfile and runs the
/// side command without the environment variable.
fn test_command_mode_relaxed() -> Result<(), String> {
    let bin = pidsentry_bin().ok_or("PIDSENTRY_BIN not set")?;
    let dir = check(tempfile::tempdir())?;
    let pidfile = dir.path().join("absent.pid");

    let output = check(
        command(
            &bin,
            &[
                "-p",
                pidfile.to_str().unwrap(),
                "--command",
                "--relaxed",
                "--",
                "sh",
                "-c",
                "test -z \"$PIDSENTRY_PID\"",
            ],
        )
        .output(),
    )?;
    if output.status.code() != Some(0) {
        return Err(format!("relaxed command failed: {:?}", output.status));
    }
    Ok(())
}

fn main() {
    if pidsentry_bin().is_none() {
        println!("PIDSENTRY_BIN not set; skipping supervision scenarios");
        return;
    }

    let tests: Vec<(&str, TestFn)> = vec![
        ("happy_path", Box::new(test_happy_path)),
        ("signal_forwarding", Box::new(test_signal_forwarding)),
        ("stale_pidfile_recovery", Box::new(test_stale_pidfile_recovery)),
        ("umbilical_cutover", Box::new(test_umbilical_cutover)),
        ("command_mode_reference", Box::new(test_command_mode_reference)),
        ("command_mode_relaxed", Box::new(test_command_mode_relaxed)),
    ];

    let tests = named_tests(tests);
    if run_tests(tests.iter().map(|(n, t)| (n, t)), true).is_err() {
        std::process::exit(1);
    }
}

//! Cross-process checks of the pidfile contract.

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult};

use pidsentry::sentry::pidfile::{Pidfile, PidfileOpenError};
use test_utils::{check, named_tests, run_tests, TestFn};

/// Run `test` in a forked child and report its exit status as the result.
fn in_child(test: impl FnOnce() -> Result<(), String>) -> Result<(), String> {
    match check(unsafe { fork() })? {
        ForkResult::Child => {
            let code = match test() {
                Ok(()) => 0,
                Err(msg) => {
                    eprintln!("child failed: {msg}");
                    1
                }
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => match check(waitpid(child, None))? {
            WaitStatus::Exited(_, 0) => Ok(()),
            status => Err(format!("child reported {status:?}")),
        },
    }
}

/// A pidfile created by this process is readable and valid from another
/// process for as long as this process lives.
fn test_pidfile_visible_across_processes() -> Result<(), String> {
    let dir = check(tempfile::tempdir())?;
    let path = dir.path().join("sentry.pid");

    let mut pidfile = check(Pidfile::init(&path))?;
    check(pidfile.create_locked())?;
    check(pidfile.write(getpid(), b"keeper-name"))?;
    check(pidfile.release_lock())?;

    let writer_pid = getpid();

    in_child(move || {
        let mut reader = check(Pidfile::init(&path))?;
        check(reader.open_readonly())?;
        check(reader.acquire_read_lock())?;
        let record = check(reader.read())?;

        if record.signature.pid != writer_pid {
            return Err(format!(
                "expected pid {writer_pid}, read {}",
                record.signature.pid
            ));
        }
        if record.keeper_name.as_deref() != Some(&b"keeper-name"[..]) {
            return Err("keeper name did not round trip".to_string());
        }
        check(reader.release_lock())?;
        Ok(())
    })
}

/// A second creator must observe the live holder and fail with its pid.
fn test_contended_creation_reports_holder() -> Result<(), String> {
    let dir = check(tempfile::tempdir())?;
    let path = dir.path().join("sentry.pid");

    let mut pidfile = check(Pidfile::init(&path))?;
    check(pidfile.create_locked())?;
    check(pidfile.write(getpid(), b"keeper-name"))?;
    check(pidfile.release_lock())?;

    let holder = getpid();

    in_child(move || {
        let mut contender = check(Pidfile::init(&path))?;
        match contender.open_create() {
            Err(PidfileOpenError::Exists(pid)) if pid == holder => Ok(()),
            Err(err) => Err(format!("unexpected failure: {err}")),
            Ok(()) => Err("creation should have been blocked".to_string()),
        }
    })
}

/// A pidfile naming a dead process does not obstruct a new sentry.
fn test_stale_pidfile_is_reclaimed() -> Result<(), String> {
    let dir = check(tempfile::tempdir())?;
    let path = dir.path().join("sentry.pid");

    // Obtain a pid that is certain to be dead, with its authentic pidfile
    // content shape.
    let stale_pid = match check(unsafe { fork() })? {
        ForkResult::Child => unsafe { libc::_exit(0) },
        ForkResult::Parent { child } => {
            check(waitpid(child, None))?;
            child
        }
    };
    std::fs::write(
        &path,
        format!("{stale_pid}\n\nstale-boot:12345\nold-keeper\n"),
    )
    .map_err(|err| err.to_string())?;

    let mut pidfile = check(Pidfile::init(&path))?;
    check(pidfile.create_locked())?;
    check(pidfile.write(getpid(), b"new-keeper"))?;
    check(pidfile.release_lock())?;

    let mut reader = check(Pidfile::init(&path))?;
    check(reader.open_readonly())?;
    check(reader.acquire_read_lock())?;
    let record = check(reader.read())?;
    check(reader.release_lock())?;

    if record.signature.pid != getpid() {
        return Err("stale pidfile was not reclaimed".to_string());
    }
    Ok(())
}

/// Closing the pidfile under the write lock removes it; a dead pid is all a
/// late reader can find.
fn test_closed_pidfile_disappears() -> Result<(), String> {
    let dir = check(tempfile::tempdir())?;
    let path = dir.path().join("sentry.pid");

    let mut pidfile = check(Pidfile::init(&path))?;
    check(pidfile.create_locked())?;
    check(pidfile.write(getpid(), b"keeper-name"))?;
    check(pidfile.release_lock())?;

    check(pidfile.acquire_write_lock())?;
    pidfile.close();

    if path.exists() {
        return Err("pidfile still present after close".to_string());
    }
    Ok(())
}

/// A reader holding the shared lock keeps a writer from deleting the file
/// until the reader is done.
fn test_reader_blocks_writer() -> Result<(), String> {
    let dir = check(tempfile::tempdir())?;
    let path = dir.path().join("sentry.pid");

    let mut pidfile = check(Pidfile::init(&path))?;
    check(pidfile.create_locked())?;
    check(pidfile.write(getpid(), b"keeper-name"))?;
    check(pidfile.release_lock())?;

    let mut reader = check(Pidfile::init(&path))?;
    check(reader.open_readonly())?;
    check(reader.acquire_read_lock())?;

    // Probe the exclusive lock non-blockingly from another process; the
    // shared lock must hold it off.
    in_child(move || {
        use std::os::unix::io::AsRawFd;
        let file = std::fs::File::open(&path).map_err(|err| err.to_string())?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Err("exclusive lock granted while read lock held".to_string());
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EWOULDBLOCK) => Ok(()),
            errno => Err(format!("unexpected errno {errno:?}")),
        }
    })?;

    check(reader.release_lock())?;
    Ok(())
}

fn main() {
    let tests: Vec<(&str, TestFn)> = vec![
        (
            "pidfile_visible_across_processes",
            Box::new(test_pidfile_visible_across_processes),
        ),
        (
            "contended_creation_reports_holder",
            Box::new(test_contended_creation_reports_holder),
        ),
        (
            "stale_pidfile_is_reclaimed",
            Box::new(test_stale_pidfile_is_reclaimed),
        ),
        (
            "closed_pidfile_disappears",
            Box::new(test_closed_pidfile_disappears),
        ),
        ("reader_blocks_writer", Box::new(test_reader_blocks_writer)),
    ];

    let tests = named_tests(tests);
    if run_tests(tests.iter().map(|(n, t)| (n, t)), true).is_err() {
        std::process::exit(1);
    }
}

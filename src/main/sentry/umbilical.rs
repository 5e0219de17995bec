//! The umbilical: an out-of-band monitor process that outlives the watchdog.
//!
//! If the watchdog dies without cleaning up (SIGKILL, a crash, the OOM
//! killer), the kernel still delivers EOF on the umbilical socket pair, and
//! this process kills the child's process group. While running it echoes the
//! watchdog's pings, emits a ping of its own so the watchdog can spot a stuck
//! umbilical, and services the keeper connections of the inherited
//! [`PidServer`].
//!
//! The fork transfers ownership of the PidServer: all of its state lives in
//! OS resources that fork duplicates correctly, and the watchdog must not
//! touch its copy once the fork returns.

use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

use anyhow::Context;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::sentry::pidserver::PidServer;
use crate::utility::fd;
use crate::utility::signal;
use crate::utility::socket::SocketPair;
use crate::utility::time::{Deadline, EventClockTime, LapTimer};

/// A ping from the watchdog, echoed back.
const MSG_PING: u8 = b'.';
/// A clean-stop request from the watchdog.
const MSG_STOP: u8 = b'!';

/// How long the watchdog waits for the umbilical to honour a stop request
/// before abandoning it to die on socket EOF.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The ping cadence of the umbilical itself.
const PING_PERIOD: Duration = Duration::from_secs(1);

pub struct UmbilicalProcess {
    pid: Pid,
}

impl UmbilicalProcess {
    /// Fork the umbilical, transferring the pid server to it. The caller
    /// must drop its own `PidServer` value immediately after this returns
    /// and must not service it again.
    pub fn create(
        child_pgid: Pid,
        socket: &mut SocketPair,
        pid_server: Option<&mut PidServer>,
    ) -> anyhow::Result<Self> {
        match unsafe { unistd::fork() }.context("Unable to fork umbilical process")? {
            ForkResult::Parent { child } => {
                log::debug!("umbilical process pid {child}");
                Ok(Self { pid: child })
            }
            ForkResult::Child => {
                let code = run_umbilical(socket, child_pgid, pid_server);
                unsafe { libc::_exit(code) }
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Ask the umbilical to stop cleanly and wait for it to exit. Reports
    /// false when the wait times out; the umbilical will then exit on its own
    /// once the socket reports EOF.
    pub fn stop(&self, socket: &SocketPair) -> anyhow::Result<bool> {
        log::debug!("stopping umbilical pid {}", self.pid);

        match fd::write_fd(socket.parent_fd(), &[MSG_STOP]) {
            Ok(_) | Err(Errno::EPIPE) | Err(Errno::EAGAIN) | Err(Errno::ECONNRESET) => {}
            Err(errno) => return Err(errno).context("Unable to request umbilical stop"),
        }

        let mut deadline = Deadline::new(Some(STOP_TIMEOUT));
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(true),
                Err(errno) => return Err(errno).context("Unable to reap umbilical process"),
                Ok(WaitStatus::StillAlive) => {
                    let expired = deadline.check(
                        || Ok(false),
                        |_| {
                            std::thread::sleep(Duration::from_millis(100));
                            Ok(false)
                        },
                    );
                    match expired {
                        Ok(_) => continue,
                        Err(Errno::ETIMEDOUT) => return Ok(false),
                        Err(errno) => return Err(errno).context("Unable to wait for umbilical"),
                    }
                }
                Ok(status) => {
                    log::debug!("reaped umbilical pid {} status {status:?}", self.pid);
                    return Ok(true);
                }
            }
        }
    }
}

fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// The umbilical main loop; runs in the forked process and never returns to
/// the caller's code.
fn run_umbilical(
    socket: &mut SocketPair,
    child_pgid: Pid,
    mut pid_server: Option<&mut PidServer>,
) -> i32 {
    // The watchdog's signal handlers are not wanted here; fall back to the
    // default dispositions.
    let _ = signal::reset_dispositions(&[
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGTSTP,
        Signal::SIGCONT,
        Signal::SIGCHLD,
        Signal::SIGALRM,
    ]);

    socket.close_parent();
    let sock_fd = socket.child_fd();

    log::debug!(
        "umbilical pid {} watching child pgid {child_pgid}",
        unistd::getpid()
    );

    let mut ping_timer = LapTimer::new(PING_PERIOD);
    let mut clean_stop = false;

    'monitor: loop {
        let now = EventClockTime::now();
        let timeout = match ping_timer.next_expiry(now) {
            None => PollTimeout::NONE,
            Some(remaining) => {
                let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
                PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
            }
        };

        let mut fds = vec![PollFd::new(borrowed(sock_fd), PollFlags::POLLIN)];
        if let Some(server) = pid_server.as_deref() {
            fds.push(PollFd::new(borrowed(server.listener_fd()), PollFlags::POLLIN));
            fds.push(PollFd::new(borrowed(server.queue_fd()), PollFlags::POLLIN));
        }

        match poll(&mut fds, timeout) {
            Err(Errno::EINTR) => continue,
            Err(_) => break 'monitor,
            Ok(_) => {}
        }

        let sock_ready = !fds[0].revents().unwrap_or(PollFlags::empty()).is_empty();
        let accept_ready = fds
            .get(1)
            .map(|fd| !fd.revents().unwrap_or(PollFlags::empty()).is_empty())
            .unwrap_or(false);
        let clean_ready = fds
            .get(2)
            .map(|fd| !fd.revents().unwrap_or(PollFlags::empty()).is_empty())
            .unwrap_or(false);

        if sock_ready {
            let mut buf = [0u8; 16];
            match fd::read_fd(sock_fd, &mut buf) {
                Ok(0) | Err(Errno::ECONNRESET) => {
                    // The watchdog is gone without a goodbye.
                    log::warn!("Umbilical connection closed");
                    break 'monitor;
                }
                Err(Errno::EAGAIN) => {}
                Err(_) => break 'monitor,
                Ok(count) => {
                    for &byte in &buf[..count] {
                        match byte {
                            MSG_STOP => {
                                log::debug!("umbilical stop requested");
                                clean_stop = true;
                                break 'monitor;
                            }
                            _ => {
                                // Echo the ping so the watchdog sees a live
                                // umbilical.
                                match fd::write_fd(sock_fd, &[byte]) {
                                    Ok(_) | Err(Errno::EAGAIN) => {}
                                    Err(_) => break 'monitor,
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(server) = pid_server.as_deref_mut() {
            if accept_ready {
                if let Err(err) = server.accept() {
                    log::warn!("Unable to accept keeper connection: {err:#}");
                }
            }
            if clean_ready {
                if let Err(err) = server.clean() {
                    log::warn!("Unable to clean keeper connections: {err:#}");
                }
            }
        }

        let now = EventClockTime::now();
        if ping_timer.expired(now) {
            match fd::write_fd(sock_fd, &[MSG_PING]) {
                Ok(_) | Err(Errno::EAGAIN) => {}
                Err(_) => {
                    log::warn!("Umbilical connection broken");
                    break 'monitor;
                }
            }
        }
    }

    // Tear down: the child process group first, then the keeper references.
    // The child is a zombie until the watchdog reaps it, so the pgid cannot
    // have been recycled.
    log::debug!("umbilical killing child pgid {child_pgid}");
    match killpg(child_pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => {
            log::warn!("Unable to kill child pgid {child_pgid} - errno {}", errno as i32);
        }
    }

    drop(pid_server);

    if clean_stop {
        0
    } else {
        255
    }
}

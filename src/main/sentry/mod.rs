//! The sentry: the supervision mesh wiring the pidfile, child, tether,
//! umbilical and keeper together.

pub mod child;
pub mod command;
pub mod monitor;
pub mod pidfile;
pub mod pidserver;
pub mod signature;
pub mod tether;
pub mod umbilical;

use std::io::Write;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::core::configuration::Options;
use crate::sentry::child::ChildProcess;
use crate::sentry::pidfile::{Pidfile, PidfileOpenError};
use crate::sentry::pidserver::PidServer;
use crate::sentry::umbilical::UmbilicalProcess;
use crate::utility::fd;
use crate::utility::fdset;
use crate::utility::jobcontrol::JobControl;
use crate::utility::pipe::{Pipe, StdFdFiller};
use crate::utility::socket::{BellSocketPair, SocketPair};

/// The supervisor's exit code, mapped per POSIX shell conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const FAILURE: ExitCode = ExitCode(255);

    pub fn value(self) -> u8 {
        self.0.clamp(0, 255) as u8
    }
}

/// Map a reaped wait status onto an exit code: statuses cap at 128, and
/// signal deaths report as 128 + the signal number, capped at 255.
pub fn extract_exit_status(status: WaitStatus) -> ExitCode {
    match status {
        WaitStatus::Exited(_, code) => ExitCode(code.min(128)),
        WaitStatus::Signaled(_, signal, _) => ExitCode((128 + signal as i32).min(255)),
        _ => ExitCode::FAILURE,
    }
}

/// Supervise `cmd` to completion.
///
/// The sentry itself must lead a process group: the umbilical holds a
/// reference against that group so it cannot be recycled even after the
/// sentry process dies. When the invoker made us a group member instead, the
/// sentry runs in a forked group-leader child while this process relays job
/// control to it.
pub fn run_supervise(options: Arc<Options>, cmd: Vec<String>) -> anyhow::Result<ExitCode> {
    if unistd::getpid() == unistd::getpgrp() {
        if options.orphaned {
            spawn_orphan_watcher();
        }
        run_sentry(options, cmd, None)
    } else {
        run_supervisor_process(options, cmd)
    }
}

fn run_sentry(
    options: Arc<Options>,
    cmd: Vec<String>,
    parent_pipe: Option<Pipe>,
) -> anyhow::Result<ExitCode> {
    match Sentry::new(options, cmd, parent_pipe) {
        Ok(mut sentry) => sentry.run(),
        Err(err) => match err.downcast_ref::<PidfileOpenError>() {
            Some(PidfileOpenError::Exists(pid)) => {
                log::warn!("Pidfile names active pid {pid}");
                Ok(ExitCode::FAILURE)
            }
            _ => Err(err),
        },
    }
}

/// Relay process: forks the sentry as a process-group leader and forwards
/// job control, mirroring the child's fate in its own exit.
fn run_supervisor_process(options: Arc<Options>, cmd: Vec<String>) -> anyhow::Result<ExitCode> {
    let mut parent_pipe =
        Pipe::new(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).context("Unable to create parent pipe")?;

    match unsafe { unistd::fork() }.context("Unable to fork supervisor process")? {
        ForkResult::Child => {
            let _ = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
            parent_pipe.close_writer();
            let code = match run_sentry(options, cmd, Some(parent_pipe)) {
                Ok(code) => code.value(),
                Err(err) => {
                    log::warn!("{err:#}");
                    ExitCode::FAILURE.value()
                }
            };
            unsafe { libc::_exit(code as i32) }
        }
        ForkResult::Parent { child } => {
            match unistd::setpgid(child, child) {
                Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => {}
                Err(errno) => return Err(errno).context("Unable to set sentry process group"),
            }
            parent_pipe.close_reader();

            if options.orphaned {
                spawn_orphan_watcher();
            }

            let job_control = JobControl::new().context("Unable to watch signals")?;
            {
                let pid = child;
                job_control.watch_signals(move |signal| {
                    let _ = nix::sys::signal::kill(pid, signal);
                });
                job_control.watch_stop(
                    move || {
                        let _ = nix::sys::signal::kill(pid, Signal::SIGTSTP);
                    },
                    move || {
                        let _ = nix::sys::signal::kill(pid, Signal::SIGCONT);
                    },
                );
            }

            // Observe the sentry's fate without reaping so a SIGQUIT core
            // dump can be mirrored before the zombie is collected.
            let status = loop {
                match waitid(Id::Pid(child), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(errno).context("Unable to wait for sentry"),
                    Ok(status) => break status,
                }
            };

            job_control.unwatch_stop();
            job_control.unwatch_signals();

            if let WaitStatus::Signaled(_, Signal::SIGQUIT, true) = status {
                crate::utility::signal::quit_with_core().context("Unable to quit")?;
            }

            let status = loop {
                match nix::sys::wait::waitpid(child, None) {
                    Err(Errno::EINTR) => continue,
                    other => break other.context("Unable to reap sentry")?,
                }
            };
            log::debug!("reaped sentry pid {child} status {status:?}");

            // The sentry already mapped the child's fate onto its own exit
            // status; relay it verbatim so this process is transparent.
            Ok(match status {
                WaitStatus::Exited(_, code) => ExitCode(code),
                other => extract_exit_status(other),
            })
        }
    }
}

/// Exit when reparented to init: useful when the invoker is itself a
/// supervisor that must not leak children.
fn spawn_orphan_watcher() {
    let _ = std::thread::Builder::new()
        .name("parentmonitor".into())
        .spawn(|| loop {
            std::thread::sleep(std::time::Duration::from_secs(3));
            if unistd::getppid() == Pid::from_raw(1) {
                log::warn!("Parent terminated");
                log::logger().flush();
                std::process::exit(ExitCode::FAILURE.value() as i32);
            }
        });
}

struct Sentry {
    options: Arc<Options>,
    child: Arc<ChildProcess>,
    job_control: JobControl,
    umbilical_socket: SocketPair,
    umbilical: UmbilicalProcess,
    pidfile: Option<Pidfile>,
    parent_pipe: Option<Pipe>,
}

impl Sentry {
    /// Launch the supervision mesh: fork the child, publish the pidfile,
    /// fork the umbilical, and release the child to exec.
    fn new(
        options: Arc<Options>,
        cmd: Vec<String>,
        parent_pipe: Option<Pipe>,
    ) -> anyhow::Result<Self> {
        // Occupy fds 0..=2 so no descriptor opened below can be mistaken for
        // the stdio the child must inherit.
        let std_filler = StdFdFiller::new().context("Unable to occupy standard fds")?;

        let mut umbilical_socket =
            SocketPair::new(nix::sys::socket::SockFlag::SOCK_NONBLOCK
                | nix::sys::socket::SockFlag::SOCK_CLOEXEC)
            .context("Unable to create umbilical socket")?;

        let child = Arc::new(ChildProcess::new().context("Unable to create child process")?);

        let mut bell = BellSocketPair::new().context("Unable to create sync socket")?;

        child
            .fork(&cmd, &options, &std_filler.fds(), &bell, &umbilical_socket)
            .context("Unable to fork child process")?;

        // Anchor the pidfile to its directory before leaving the working
        // directory; the path may well be relative.
        let mut pidfile = match &options.pidfile {
            None => None,
            Some(path) => Some(
                Pidfile::init(path)
                    .with_context(|| format!("Cannot initialise pidfile '{}'", path.display()))?,
            ),
        };

        // Do not pin a filesystem. In debug mode stay put so a core file
        // lands somewhere discoverable.
        if options.debug == 0 {
            unistd::chdir("/").context("Unable to change directory to /")?;
        }

        // Free the standard fds, then attach the tether's reading end as
        // stdin so this process holds no reference to the original stdin.
        drop(std_filler);
        unistd::dup2(child.tether_reader_fd(), libc::STDIN_FILENO)
            .context("Unable to dup tether pipe to stdin")?;
        child.close_tether();

        // Purge every descriptor the child must not be able to reach through
        // this process; the survivors are all accounted for.
        let mut keep: Vec<RawFd> = vec![
            libc::STDIN_FILENO,
            libc::STDOUT_FILENO,
            libc::STDERR_FILENO,
            umbilical_socket.parent_fd(),
            umbilical_socket.child_fd(),
            bell.parent_fd(),
            bell.child_fd(),
        ];
        if let Some(pipe) = &parent_pipe {
            keep.push(pipe.reader_fd());
        }
        fdset::close_fds_except(&keep).context("Unable to purge orphaned fds")?;

        let job_control = JobControl::new().context("Unable to watch signals")?;
        let umbilical_pid = Arc::new(AtomicI32::new(0));
        {
            let child = Arc::clone(&child);
            let umbilical_pid = Arc::clone(&umbilical_pid);
            job_control.watch_done(move || {
                let umbilical = Pid::from_raw(umbilical_pid.load(Ordering::Acquire));
                let _ = child.supervise(Some(umbilical));
            });
        }
        {
            let child = Arc::clone(&child);
            job_control.watch_signals(move |signal| {
                // SIGQUIT may dump the child's core; the sympathy dump is
                // decided when the child is reaped.
                let _ = child.kill(signal);
            });
        }
        {
            let pause = Arc::clone(&child);
            let resume = Arc::clone(&child);
            job_control.watch_stop(
                move || {
                    let _ = pause.pause_process_group();
                },
                move || {
                    let _ = resume.resume_process_group();
                },
            );
        }
        {
            let child = Arc::clone(&child);
            job_control.watch_continue(move || {
                child.raise_sigcont();
            });
        }

        // Publish the pidfile before the umbilical exists: creation can fail
        // with a live competitor, and failing first avoids umbilical cleanup.
        let mut pid_server = match &pidfile {
            None => None,
            Some(_) => {
                Some(PidServer::new(child.pid()).context("Cannot create pid server")?)
            }
        };

        if let Some(pidfile) = pidfile.as_mut() {
            let server = pid_server.as_ref().expect("pid server missing");
            announce_child(pidfile, child.pid(), server.abstract_name())?;
        }

        let umbilical =
            UmbilicalProcess::create(child.pgid(), &mut umbilical_socket, pid_server.as_mut())
                .context("Unable to create umbilical process")?;
        umbilical_socket.close_child();

        // The pid server lives on in the umbilical; this copy must not be
        // serviced here again.
        drop(pid_server);

        umbilical_pid.store(umbilical.pid().as_raw(), Ordering::Release);

        if options.identify {
            let mut stdout = std::io::stdout();
            writeln!(stdout, "{} {}", unistd::getpid(), umbilical.pid())
                .and_then(|()| stdout.flush())
                .context("Unable to print watchdog and umbilical pids")?;
        }

        // Wake the child now that the pidfile is announced, and wait for its
        // acknowledgement. A child that died meanwhile shows up as EPIPE and
        // is reported by the reaper instead.
        bell.close_child();
        match bell.ring_parent() {
            Ok(()) | Err(Errno::EPIPE) => {}
            Err(errno) => return Err(errno).context("Unable to activate child process"),
        }
        match bell.wait_parent() {
            Ok(()) | Err(Errno::EPIPE) => {}
            Err(errno) => return Err(errno).context("Unable to synchronise child process"),
        }

        // Print after the acknowledgement, before releasing stdout to tether
        // traffic, so the pid lines cannot co-mingle with child output.
        if options.identify {
            let mut stdout = std::io::stdout();
            writeln!(stdout, "{}", child.pid())
                .and_then(|()| stdout.flush())
                .context("Unable to print child pid")?;
        }

        // The second bell releases the exec; the exec itself closes the
        // child's close-on-exec bell descriptor, completing the handshake.
        match bell.ring_parent() {
            Ok(()) | Err(Errno::EPIPE) => {}
            Err(errno) => return Err(errno).context("Unable to release child process"),
        }

        drop(bell);

        // With no tether traffic expected, or none wanted, replace stdout
        // with a sink so this process adds no reference to the original.
        let mut discard_stdout = options.quiet || options.tether.is_none();
        if !discard_stdout && !fd::is_valid(libc::STDOUT_FILENO) {
            discard_stdout = true;
        }
        if discard_stdout {
            fd::nullify_fd(libc::STDOUT_FILENO).context("Unable to nullify stdout")?;
        }

        Ok(Self {
            options,
            child,
            job_control,
            umbilical_socket,
            umbilical,
            pidfile,
            parent_pipe,
        })
    }

    /// Monitor the child to completion and dismantle the mesh.
    fn run(&mut self) -> anyhow::Result<ExitCode> {
        monitor::monitor_child(
            &self.child,
            self.umbilical.pid(),
            self.umbilical_socket.parent_fd(),
            self.parent_pipe.as_ref().map(|pipe| pipe.reader_fd()),
            &self.options,
        )
        .context("Unable to monitor child process")?;

        self.job_control.unwatch_continue();
        self.job_control.unwatch_signals();
        self.job_control.unwatch_done();

        // Retire the pidfile before reaping: a reader that wins the lock
        // must find either nothing or a terminated process, never a recycled
        // pid.
        if let Some(pidfile) = self.pidfile.as_mut() {
            pidfile
                .acquire_write_lock()
                .context("Cannot lock pidfile")?;
            pidfile.close();
        }
        self.pidfile = None;

        // Stop the umbilical first so the exit status of the child is the
        // last line this process emits.
        match self.umbilical.stop(&self.umbilical_socket) {
            Ok(true) => {}
            Ok(false) => log::warn!("Unable to stop umbilical process cleanly"),
            Err(err) => return Err(err),
        }

        // The umbilical also kills the process group; doing it here as well
        // covers an umbilical that died early. The child is already dead, so
        // its exit status cannot change.
        let _ = self.child.kill_process_group();

        log::debug!("reaping child pid {}", self.child.pid());
        let status = self.child.reap().context("Unable to reap child process")?;
        log::debug!("reaped child status {status:?}");

        self.umbilical_socket.close_parent();

        crate::utility::signal::reset_dispositions(&[Signal::SIGPIPE])
            .context("Unable to reset SIGPIPE")?;

        if self.child.sympathetic_quit_pending() {
            log::logger().flush();
            crate::utility::signal::quit_with_core().context("Unable to quit in sympathy")?;
        }

        Ok(extract_exit_status(status))
    }
}

/// Create and fill the pidfile, retrying while the freshly created file
/// keeps turning into a zombie under us.
fn announce_child(pidfile: &mut Pidfile, pid: Pid, keeper_name: &[u8]) -> anyhow::Result<()> {
    pidfile.create_locked().with_context(|| {
        format!("Cannot create pidfile '{}'", pidfile.path().display())
    })?;

    log::debug!("initialised pidfile '{}'", pidfile.path().display());

    pidfile
        .write(pid, keeper_name)
        .with_context(|| format!("Cannot write pidfile '{}'", pidfile.path().display()))?;

    // The content is complete; with the lock released, any competitor will
    // see a live process and leave the file alone.
    pidfile
        .release_lock()
        .context("Cannot release pidfile lock")?;
    Ok(())
}

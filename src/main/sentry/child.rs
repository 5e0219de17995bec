//! The supervised child process: fork protocol, tether placement, state
//! classification and signalling.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::core::configuration::{Options, TetherTarget};
use crate::utility::latch::EventLatch;
use crate::utility::pipe::Pipe;
use crate::utility::socket::{BellSocketPair, SocketPair};

/// A non-consuming classification of a watched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildProcessState {
    Running,
    Stopped,
    Trapped,
    Exited(i32),
    Killed(Signal),
    Dumped(Signal),
}

/// Classify `pid` without reaping it.
pub fn monitor_process_child(pid: Pid) -> nix::Result<ChildProcessState> {
    let flags = WaitPidFlag::WNOHANG
        | WaitPidFlag::WNOWAIT
        | WaitPidFlag::WEXITED
        | WaitPidFlag::WSTOPPED
        | WaitPidFlag::WCONTINUED;
    let state = match waitid(Id::Pid(pid), flags)? {
        WaitStatus::StillAlive | WaitStatus::Continued(_) => ChildProcessState::Running,
        WaitStatus::Stopped(..) => ChildProcessState::Stopped,
        WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(_) => ChildProcessState::Trapped,
        WaitStatus::Exited(_, status) => ChildProcessState::Exited(status),
        WaitStatus::Signaled(_, signal, true) => ChildProcessState::Dumped(signal),
        WaitStatus::Signaled(_, signal, false) => ChildProcessState::Killed(signal),
    };
    Ok(state)
}

/// The forked command child, shared between the orchestrator, the monitor
/// loop and the job-control callbacks.
pub struct ChildProcess {
    pid: AtomicI32,
    pgid: AtomicI32,
    tether: Mutex<Option<Pipe>>,
    pub latch_child: Arc<EventLatch>,
    pub latch_umbilical: Arc<EventLatch>,
    // Monitor registry slot: the continuation latch of the live monitor, if
    // one is running. Signal-driven code wakes the event loop through here.
    cont_slot: Mutex<Option<Arc<EventLatch>>>,
    quit_pending: AtomicBool,
}

impl ChildProcess {
    pub fn new() -> anyhow::Result<Self> {
        // Only the reading end of the tether is non-blocking. The writing end
        // is used by the child process, and perhaps inherited by processes it
        // forks in turn.
        let tether = Pipe::new(OFlag::empty())?;
        crate::utility::fd::set_cloexec(tether.reader_fd(), true)?;
        crate::utility::fd::set_nonblocking(tether.reader_fd(), true)?;

        Ok(Self {
            pid: AtomicI32::new(0),
            pgid: AtomicI32::new(0),
            tether: Mutex::new(Some(tether)),
            latch_child: Arc::new(EventLatch::new("child")),
            latch_umbilical: Arc::new(EventLatch::new("umbilical")),
            cont_slot: Mutex::new(None),
            quit_pending: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.pid.load(Ordering::Acquire))
    }

    pub fn pgid(&self) -> Pid {
        Pid::from_raw(self.pgid.load(Ordering::Acquire))
    }

    pub fn tether_reader_fd(&self) -> RawFd {
        self.tether
            .lock()
            .unwrap()
            .as_ref()
            .expect("tether closed")
            .reader_fd()
    }

    /// Drop both ends of the tether pipe in this process, leaving the only
    /// references in the child and in the descriptors dup'd over stdio.
    pub fn close_tether(&self) {
        self.tether.lock().unwrap().take();
    }

    /// Fork the user command as a process-group leader, sequenced over the
    /// bell socket so the command cannot exec before the pidfile exists.
    pub fn fork(
        &self,
        cmd: &[String],
        options: &Options,
        filler_fds: &[RawFd],
        bell: &BellSocketPair,
        umbilical_socket: &SocketPair,
    ) -> anyhow::Result<()> {
        let plan = {
            let tether = self.tether.lock().unwrap();
            let tether = tether.as_ref().expect("tether closed");
            ExecPlan::new(cmd, options, tether.reader_fd(), tether.writer_fd())?
        };

        let close_fds: Vec<RawFd> = filler_fds
            .iter()
            .copied()
            .chain([
                umbilical_socket.parent_fd(),
                umbilical_socket.child_fd(),
                bell.parent_fd(),
            ])
            .collect();
        let bell_child_fd = bell.child_fd();

        match unsafe { unistd::fork() }.context("Unable to fork child process")? {
            ForkResult::Child => {
                let code = run_child_process(&plan, &close_fds, bell_child_fd);
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                // Force the process group from this side too; relying on the
                // child alone would race signal delivery to the group.
                match unistd::setpgid(child, child) {
                    Ok(()) | Err(Errno::EACCES) | Err(Errno::ESRCH) => {}
                    Err(errno) => return Err(errno).context("Unable to set child process group"),
                }

                self.pid.store(child.as_raw(), Ordering::Release);
                // Even a terminated child remains a zombie until reaped, so
                // the process group query is safe here.
                let pgid = unistd::getpgid(Some(child)).unwrap_or(child);
                self.pgid.store(pgid.as_raw(), Ordering::Release);

                log::debug!("running child pid {child} in pgid {pgid}");
                assert_eq!(self.pid(), self.pgid());

                // The child might have terminated before the pid was
                // recorded; force a supervision pass to cover that window.
                self.supervise(None)?;
                Ok(())
            }
        }
    }

    fn supervise_one(
        &self,
        role: &str,
        pid: Pid,
        latch: &EventLatch,
    ) -> nix::Result<Option<ChildProcessState>> {
        let state = match monitor_process_child(pid) {
            Ok(state) => state,
            Err(Errno::ECHILD) => return Ok(None),
            Err(errno) => return Err(errno),
        };

        match state {
            ChildProcessState::Running => {
                log::debug!("{role} pid {pid} running");
                latch.set();
            }
            ChildProcessState::Stopped | ChildProcessState::Trapped => {
                log::debug!("{role} pid {pid} state {state:?}");
            }
            ChildProcessState::Exited(status) => {
                log::debug!("{role} pid {pid} exited with status {status}");
                latch.disable();
            }
            ChildProcessState::Killed(signal) | ChildProcessState::Dumped(signal) => {
                log::debug!("{role} pid {pid} killed by {signal}");
                latch.disable();
            }
        }
        Ok(Some(state))
    }

    /// Classify the child (and the umbilical, when known) after SIGCHLD,
    /// updating the event latches.
    ///
    /// A reaper can be surprised by adopted descendants; classifying only the
    /// recorded pids guards against a stranger's state reaching the latches.
    pub fn supervise(&self, umbilical_pid: Option<Pid>) -> nix::Result<()> {
        if let Some(umbilical_pid) = umbilical_pid {
            if umbilical_pid.as_raw() != 0 {
                self.supervise_one("umbilical", umbilical_pid, &self.latch_umbilical)?;
            }
        }

        let pid = self.pid();
        if pid.as_raw() == 0 {
            return Ok(());
        }
        let state = self.supervise_one("child", pid, &self.latch_child)?;

        // If the child was killed by SIGQUIT and dumped core, arrange to dump
        // core in sympathy once cleanup completes.
        if state == Some(ChildProcessState::Dumped(Signal::SIGQUIT)) {
            self.quit_pending.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub fn sympathetic_quit_pending(&self) -> bool {
        self.quit_pending.load(Ordering::Acquire)
    }

    pub fn kill(&self, signal: Signal) -> nix::Result<()> {
        let pid = self.pid();
        if pid.as_raw() == 0 {
            return Ok(());
        }
        log::debug!("sending {signal} to child pid {pid}");
        kill(pid, signal)
    }

    /// SIGKILL the whole child process group. Also attempted by the
    /// umbilical; one of the two is expected to succeed.
    pub fn kill_process_group(&self) -> nix::Result<()> {
        let pgid = self.pgid();
        if pgid.as_raw() == 0 {
            return Ok(());
        }
        killpg(pgid, Signal::SIGKILL)
    }

    pub fn pause_process_group(&self) -> nix::Result<()> {
        let pgid = self.pgid();
        if pgid.as_raw() == 0 {
            return Ok(());
        }
        killpg(pgid, Signal::SIGSTOP)
    }

    pub fn resume_process_group(&self) -> nix::Result<()> {
        let pgid = self.pgid();
        if pgid.as_raw() == 0 {
            return Ok(());
        }
        killpg(pgid, Signal::SIGCONT)
    }

    /// Register or clear the running monitor's continuation latch.
    pub fn set_monitor(&self, cont_latch: Option<Arc<EventLatch>>) {
        *self.cont_slot.lock().unwrap() = cont_latch;
    }

    /// Wake the monitor after SIGCONT, if one is running.
    pub fn raise_sigcont(&self) {
        if let Some(latch) = self.cont_slot.lock().unwrap().as_ref() {
            latch.set();
        }
    }

    /// Reap the terminated child. The pid is cleared so no further signals
    /// can target a recycled process.
    pub fn reap(&self) -> nix::Result<WaitStatus> {
        let pid = self.pid();
        assert!(pid.as_raw() != 0);
        let status = loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                other => break other?,
            }
        };
        self.pid.store(0, Ordering::Release);
        Ok(status)
    }
}

/// Everything the child needs between fork and exec, computed before the
/// fork so the child only runs async-signal-safe operations plus exec.
#[derive(Debug)]
struct ExecPlan {
    argv: Vec<CString>,
    envp: Option<Vec<CString>>,
    tether_read_fd: RawFd,
    tether_write_fd: RawFd,
    // None when untethered: the child closes the pipe without installing it.
    target_fd: Option<RawFd>,
}

impl ExecPlan {
    fn new(
        cmd: &[String],
        options: &Options,
        tether_read_fd: RawFd,
        tether_write_fd: RawFd,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!cmd.is_empty(), "Missing command for execution");

        let target_fd = options.tether.map(|target| match target {
            TetherTarget::Fd(fd) => fd,
            // Allocating a new descriptor means advertising the pipe's write
            // end wherever it already sits.
            TetherTarget::Allocate => tether_write_fd,
        });

        let mut argv = cmd.to_vec();
        let mut env_override = None;

        if let (Some(name), Some(target_fd)) = (options.name.as_deref(), target_fd) {
            let fd_arg = target_fd.to_string();
            if is_env_name(name) {
                env_override = Some((name.to_string(), fd_arg));
            } else {
                // Scan from the first argument, leaving the command name
                // intact.
                let replaced = argv.iter().skip(1).position(|arg| arg.contains(name));
                match replaced {
                    Some(index) => {
                        argv[index + 1] = argv[index + 1].replacen(name, &fd_arg, 1);
                    }
                    None => anyhow::bail!("Unable to find matching argument '{name}'"),
                }
            }
        }

        let argv = argv
            .into_iter()
            .map(|arg| CString::new(arg).context("Command argument contains NUL"))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let envp = match env_override {
            None => None,
            Some((name, value)) => {
                let mut envp = Vec::new();
                for (key, val) in std::env::vars() {
                    if key != name {
                        envp.push(CString::new(format!("{key}={val}"))?);
                    }
                }
                envp.push(CString::new(format!("{name}={value}"))?);
                Some(envp)
            }
        };

        Ok(Self {
            argv,
            envp,
            tether_read_fd,
            tether_write_fd,
            target_fd,
        })
    }
}

/// Whether a tether name advertises through the environment rather than by
/// argument substitution.
fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// The child side of the fork. Runs with the parent's memory snapshot; all
/// decisions were taken pre-fork, leaving closes, the bell rendezvous, dup2
/// and exec.
fn run_child_process(plan: &ExecPlan, close_fds: &[RawFd], bell_fd: RawFd) -> i32 {
    const EXIT_FAILURE: i32 = 1;

    for &fd in close_fds {
        let _ = unistd::close(fd);
    }

    // Wait until the parent has created the pidfile; this ordering is what
    // lets readers trust that the pidfile describes a live, announced child.
    let mut bell_byte = [0u8; 1];
    match crate::utility::fd::read_fd(bell_fd, &mut bell_byte) {
        Ok(1) => {}
        _ => return EXIT_FAILURE,
    }
    if crate::utility::fd::write_fd(bell_fd, &bell_byte).is_err() {
        return EXIT_FAILURE;
    }

    let _ = unistd::close(plan.tether_read_fd);

    match plan.target_fd {
        None => {
            let _ = unistd::close(plan.tether_write_fd);
        }
        Some(target_fd) => {
            if target_fd != plan.tether_write_fd {
                if unistd::dup2(plan.tether_write_fd, target_fd).is_err() {
                    return EXIT_FAILURE;
                }
                let _ = unistd::close(plan.tether_write_fd);
            }
        }
    }

    // Wait for the watchdog to announce the child pid. The exec below closes
    // the close-on-exec bell socket, which is the final synchronisation: past
    // that point the child shares no descriptors with the watchdog beyond
    // the tether.
    match crate::utility::fd::read_fd(bell_fd, &mut bell_byte) {
        Ok(1) => {}
        _ => return EXIT_FAILURE,
    }

    let result = match &plan.envp {
        Some(envp) => unistd::execvpe(&plan.argv[0], &plan.argv, envp),
        None => unistd::execvp(&plan.argv[0], &plan.argv),
    };

    let err = result.unwrap_err();
    let message = format!(
        "pidsentry: Unable to execute '{}' - errno {}\n",
        plan.argv[0].to_string_lossy(),
        err as i32
    );
    let _ = crate::utility::fd::write_all_fd(libc::STDERR_FILENO, message.as_bytes());
    EXIT_FAILURE
}

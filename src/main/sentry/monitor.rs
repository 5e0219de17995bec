//! The child monitoring event loop.
//!
//! Single-threaded and strictly non-blocking: the poll call is the only
//! suspension point. Four descriptors are watched (the tether thread's
//! control pipe, the umbilical socket, the optional invoker pipe, and the
//! event pipe fed by latches) alongside four lap timers (tether inactivity,
//! umbilical ping/echo, the termination signal plan, and the post-mortem
//! drain nudge).
//!
//! Timeouts run in two half-period cycles so that a stopped process is
//! noticed on the first half-cycle and the timeout deferred, rather than
//! punishing a SIGSTOP with a termination plan.

use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::core::configuration::Options;
use crate::sentry::child::{monitor_process_child, ChildProcess, ChildProcessState};
use crate::sentry::tether::TetherThread;
use crate::utility::fd;
use crate::utility::latch::EventLatch;
use crate::utility::pipe::{EventPipe, Pipe};
use crate::utility::time::{EventClockTime, LapTimer};

/// The timeout is split into this many cycles so a stoppage can be detected
/// before the timeout fires.
const TIMEOUT_CYCLES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminationAction {
    Terminate,
    Abort,
}

impl TerminationAction {
    /// The escalation plan; the final entry repeats until the child dies.
    fn plan(self) -> [Signal; 2] {
        match self {
            Self::Terminate => [Signal::SIGTERM, Signal::SIGKILL],
            Self::Abort => [Signal::SIGABRT, Signal::SIGKILL],
        }
    }
}

struct Monitor<'a> {
    child: &'a ChildProcess,
    child_pid: Pid,
    umbilical_pid: Pid,
    tether_thread: TetherThread,
    event_pipe: Arc<EventPipe>,
    cont_latch: Arc<EventLatch>,

    // Poll slots; None once closed.
    tether_fd: Option<RawFd>,
    umbilical_fd: Option<RawFd>,
    parent_fd: Option<RawFd>,

    tether_timer: LapTimer,
    umbilical_timer: LapTimer,
    termination_timer: LapTimer,
    disconnection_timer: LapTimer,

    tether_timeout: Option<Duration>,
    signal_period: Duration,

    // Active plan and the index of the next signal to deliver.
    termination: Option<(TerminationAction, usize)>,

    umbilical_cycles: u32,
    umbilical_preempt: bool,
    tether_cycles: u32,

    child_latch_disabled: bool,
    umbilical_latch_disabled: bool,
}

/// Run the monitoring loop until the child has terminated and the tether has
/// drained.
pub fn monitor_child(
    child: &ChildProcess,
    umbilical_pid: Pid,
    umbilical_fd: RawFd,
    parent_fd: Option<RawFd>,
    options: &Options,
) -> anyhow::Result<()> {
    log::debug!("start monitoring child");

    // The null pipe backs the tether thread's shutdown dup2s; it must outlive
    // the thread.
    let null_pipe = Pipe::new(nix::fcntl::OFlag::O_CLOEXEC | nix::fcntl::OFlag::O_NONBLOCK)
        .context("Unable to create null pipe")?;

    let tether_thread = TetherThread::new(null_pipe.reader_fd(), options.drain_timeout)
        .context("Unable to create tether thread")?;

    let event_pipe = Arc::new(EventPipe::new().context("Unable to create event pipe")?);
    let cont_latch = Arc::new(EventLatch::new("continue"));

    child.latch_child.bind_pipe(Arc::clone(&event_pipe));
    child.latch_umbilical.bind_pipe(Arc::clone(&event_pipe));
    cont_latch.bind_pipe(Arc::clone(&event_pipe));

    let tether_period = match options.tether_timeout {
        Some(timeout) if options.tether.is_some() => timeout / TIMEOUT_CYCLES,
        _ => Duration::ZERO,
    };

    let mut monitor = Monitor {
        child,
        child_pid: child.pid(),
        umbilical_pid,
        tether_thread,
        event_pipe: Arc::clone(&event_pipe),
        cont_latch: Arc::clone(&cont_latch),
        tether_fd: None,
        umbilical_fd: Some(umbilical_fd),
        parent_fd,
        tether_timer: LapTimer::new(tether_period),
        umbilical_timer: LapTimer::new(options.umbilical_timeout / TIMEOUT_CYCLES),
        termination_timer: LapTimer::new(Duration::ZERO),
        disconnection_timer: LapTimer::new(Duration::ZERO),
        tether_timeout: options.tether_timeout,
        signal_period: options.signal_period,
        termination: None,
        umbilical_cycles: TIMEOUT_CYCLES,
        umbilical_preempt: false,
        tether_cycles: 0,
        child_latch_disabled: false,
        umbilical_latch_disabled: false,
    };
    monitor.tether_fd = options
        .tether
        .is_some()
        .then(|| monitor.tether_thread.control_monitor_fd());

    // Expire the umbilical timer immediately so the umbilical is activated to
    // monitor the watchdog from the outset.
    monitor.umbilical_timer.trigger();

    child.set_monitor(Some(Arc::clone(&cont_latch)));

    // Catch up on any child or umbilical state change that predates the
    // SIGCHLD watch; the latches surface it through the event pipe.
    child
        .supervise(Some(umbilical_pid))
        .context("Unable to assess supervised processes")?;

    let result = monitor.run();

    child.set_monitor(None);
    child.latch_child.unbind_pipe();
    child.latch_umbilical.unbind_pipe();
    cont_latch.unbind_pipe();

    let mut tether_thread = monitor.tether_thread;
    if result.is_err() {
        // The loop bailed out before the child-termination flush.
        let _ = tether_thread.flush();
    }
    tether_thread.join();
    drop(null_pipe);

    log::debug!("stop monitoring child");
    result
}

impl<'a> Monitor<'a> {
    fn run(&mut self) -> anyhow::Result<()> {
        while !self.completed() {
            let now = EventClockTime::now();
            let timeout = self.poll_timeout(now);

            enum Slot {
                Tether,
                Umbilical,
                Parent,
                EventPipe,
            }

            let mut slots = Vec::with_capacity(4);
            if let Some(fd) = self.tether_fd {
                // The control pipe only ever signals by disconnecting.
                slots.push((Slot::Tether, fd, PollFlags::empty()));
            }
            if let Some(fd) = self.umbilical_fd {
                slots.push((Slot::Umbilical, fd, PollFlags::POLLIN));
            }
            if let Some(fd) = self.parent_fd {
                slots.push((Slot::Parent, fd, PollFlags::empty()));
            }
            slots.push((
                Slot::EventPipe,
                self.event_pipe.reader_fd(),
                PollFlags::POLLIN,
            ));

            let mut pollfds: Vec<PollFd> = slots
                .iter()
                .map(|&(_, fd, events)| {
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, events)
                })
                .collect();

            match poll(&mut pollfds, timeout) {
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno).context("Unable to poll"),
                Ok(_) => {}
            }

            let revents: Vec<PollFlags> = pollfds
                .iter()
                .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                .collect();

            let now = EventClockTime::now();

            for ((slot, _, _), revents) in slots.iter().zip(revents) {
                if revents.is_empty() {
                    continue;
                }
                match slot {
                    Slot::Tether => self.on_tether_disconnect(),
                    Slot::Umbilical => self.on_umbilical_readable(now)?,
                    Slot::Parent => self.on_parent_disconnect(now),
                    Slot::EventPipe => self.on_event_pipe(now)?,
                }
            }

            self.run_timers(now)?;
        }
        Ok(())
    }

    /// The loop completes when the child has terminated and the tether
    /// thread has shut down its control pipe.
    fn completed(&self) -> bool {
        self.child_latch_disabled && self.tether_fd.is_none()
    }

    fn poll_timeout(&self, now: EventClockTime) -> PollTimeout {
        let next = [
            &self.tether_timer,
            &self.umbilical_timer,
            &self.termination_timer,
            &self.disconnection_timer,
        ]
        .iter()
        .filter_map(|timer| timer.next_expiry(now))
        .min();

        match next {
            None => PollTimeout::NONE,
            Some(remaining) => {
                let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
                PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
            }
        }
    }

    fn run_timers(&mut self, now: EventClockTime) -> anyhow::Result<()> {
        if self.tether_timer.expired(now) {
            self.on_tether_timer(now)?;
        }
        if self.umbilical_timer.expired(now) {
            self.on_umbilical_timer(now)?;
        }
        if self.termination_timer.expired(now) {
            self.on_termination_timer()?;
        }
        if self.disconnection_timer.expired(now) {
            log::debug!("disconnecting tether thread");
            self.tether_thread.ping().context("Unable to ping tether thread")?;
        }
        Ok(())
    }

    /// The tether control pipe disconnected: the drain is complete.
    fn on_tether_disconnect(&mut self) {
        log::debug!("disconnect tether control");
        self.tether_fd = None;
    }

    /// The invoker's pipe disconnected: the parent is gone, terminate.
    fn on_parent_disconnect(&mut self, now: EventClockTime) {
        log::warn!("Parent has terminated");
        self.parent_fd = None;
        self.activate_termination(TerminationAction::Terminate, now);
    }

    fn close_umbilical(&mut self, now: EventClockTime) {
        self.umbilical_fd = None;
        self.umbilical_timer.disarm();
        self.activate_termination(TerminationAction::Terminate, now);
    }

    fn on_umbilical_readable(&mut self, now: EventClockTime) -> anyhow::Result<()> {
        let fd = self.umbilical_fd.expect("umbilical slot closed");

        // If the far end closed without reading the previous ping, the read
        // reports ECONNRESET; treat it like end of file.
        let mut buf = [0u8; 1];
        match fd::read_fd(fd, &mut buf) {
            Ok(0) => {
                log::debug!("umbilical connection closed");
                self.close_umbilical(now);
            }
            Err(Errno::ECONNRESET) => {
                log::warn!("Umbilical connection broken");
                self.close_umbilical(now);
            }
            Err(Errno::EAGAIN) => {}
            Err(errno) => return Err(errno).context("Unable to read umbilical connection"),
            Ok(_) => {
                log::debug!("received umbilical connection echo");

                // Echo received; schedule the next ping, immediately if the
                // timer was preempted by a continuation.
                self.umbilical_cycles = TIMEOUT_CYCLES;
                if self.umbilical_preempt {
                    self.umbilical_preempt = false;
                    self.umbilical_timer.trigger();
                } else {
                    self.umbilical_timer.restart(now);
                }
            }
        }
        Ok(())
    }

    fn on_event_pipe(&mut self, now: EventClockTime) -> anyhow::Result<()> {
        log::debug!("checking event pipe");
        match self.event_pipe.drain() {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(errno) => return Err(errno).context("Unable to drain event pipe"),
        }

        if let Some(enabled) = self.child.latch_child.poll() {
            self.on_child_event(enabled, now)?;
        }
        if let Some(enabled) = self.child.latch_umbilical.poll() {
            self.on_umbilical_event(enabled, now);
        }
        if let Some(enabled) = self.cont_latch.poll() {
            if enabled {
                log::debug!("detected continuation after stoppage");
                self.on_continuation(now);
            }
        }
        Ok(())
    }

    fn on_child_event(&mut self, enabled: bool, now: EventClockTime) -> anyhow::Result<()> {
        if enabled {
            // Running again after a stoppage; restart the tether timeout so
            // the stoppage is not mistaken for inactivity.
            log::debug!("child pid {} is running", self.child_pid);
            self.restart_tether_timer(now);
        } else {
            log::debug!("child pid {} has terminated", self.child_pid);
            self.child_latch_disabled = true;

            // No further input can be produced, so the tether can flush now.
            // Do not exit the event loop until the drain completes.
            self.tether_thread
                .flush()
                .context("Unable to flush tether thread")?;

            // Nudge the drain once per second so it cannot block forever on
            // a stalled stdout.
            self.disconnection_timer.set_period(Duration::from_secs(1));
            self.disconnection_timer.restart(now);
        }
        Ok(())
    }

    fn on_umbilical_event(&mut self, enabled: bool, now: EventClockTime) {
        if enabled {
            log::debug!("umbilical pid {} is running", self.umbilical_pid);
            if self.umbilical_cycles != TIMEOUT_CYCLES {
                self.umbilical_cycles = 0;
                self.umbilical_timer.restart(now);
            }
        } else {
            log::debug!("umbilical pid {} has terminated", self.umbilical_pid);
            self.umbilical_latch_disabled = true;
        }
    }

    /// The process was stopped and has continued. Bring the umbilical
    /// conversation forward so the outage is not read as a timeout.
    fn on_continuation(&mut self, _now: EventClockTime) {
        if self.umbilical_cycles != TIMEOUT_CYCLES {
            // Waiting on an echo; expire the timer so the state machine runs
            // immediately.
            self.umbilical_timer.trigger();
        } else {
            // About to receive an echo; follow it with an immediate ping.
            self.umbilical_preempt = true;
        }
    }

    fn restart_tether_timer(&mut self, now: EventClockTime) {
        if self.tether_timer.active() {
            self.tether_cycles = 0;
            self.tether_timer.restart(now);
        }
    }

    fn on_tether_timer(&mut self, now: EventClockTime) -> anyhow::Result<()> {
        // Absence of tether activity only counts against a child that is
        // actually runnable.
        match monitor_process_child(self.child_pid) {
            Err(Errno::ECHILD) => {}
            Err(errno) => return Err(errno).context("Unable to assess child process"),
            Ok(ChildProcessState::Stopped) | Ok(ChildProcessState::Trapped) => {
                log::debug!("deferred tether timeout while child is stopped");
                self.tether_cycles = 0;
                return Ok(());
            }
            Ok(_) => {
                // Use the time of the last observed activity to align the
                // timeout with the activity itself.
                let since = self.tether_thread.activity_since();
                if now.since(since) < self.tether_timer.period() {
                    self.tether_timer.restart_at(since);
                    self.tether_cycles = 0;
                    return Ok(());
                }

                self.tether_cycles += 1;
                if self.tether_cycles < TIMEOUT_CYCLES {
                    return Ok(());
                }
            }
        }

        if let Some(timeout) = self.tether_timeout {
            log::warn!("Tether timeout after {}s", timeout.as_secs());
        }
        self.activate_termination(TerminationAction::Abort, now);
        Ok(())
    }

    fn on_umbilical_timer(&mut self, now: EventClockTime) -> anyhow::Result<()> {
        if self.umbilical_latch_disabled {
            // The umbilical is already gone; the broken socket carries the
            // consequences.
            return Ok(());
        }

        if self.umbilical_cycles != TIMEOUT_CYCLES {
            // Waiting on an echo. A stopped umbilical defers the timeout; a
            // vanished one is left to surface as a broken connection.
            match monitor_process_child(self.umbilical_pid) {
                Err(Errno::ECHILD) => return Ok(()),
                Err(errno) => return Err(errno).context("Unable to assess umbilical process"),
                Ok(ChildProcessState::Stopped) | Ok(ChildProcessState::Trapped) => {
                    log::debug!("deferred timeout while umbilical is stopped");
                    self.umbilical_cycles = 0;
                }
                Ok(_) => {
                    self.umbilical_cycles += 1;
                    if self.umbilical_cycles == TIMEOUT_CYCLES {
                        log::warn!("Umbilical connection timed out");
                        self.activate_termination(TerminationAction::Terminate, now);
                    }
                }
            }
            return Ok(());
        }

        // Time to ping.
        let Some(fd) = self.umbilical_fd else {
            return Ok(());
        };
        match fd::write_fd(fd, b".") {
            Ok(_) => {
                log::debug!("sent umbilical ping");
                // Expect an echo before the next ping is due.
                self.umbilical_cycles = 0;
            }
            Err(Errno::EAGAIN) => {
                log::debug!("blocked write to umbilical");
            }
            Err(Errno::EPIPE) => {
                // The umbilical monitor is gone and the connection closed.
                log::warn!("Umbilical connection closed");
                self.close_umbilical(now);
            }
            Err(errno) => return Err(errno).context("Unable to ping umbilical"),
        }
        Ok(())
    }

    /// Arm the escalation plan. The first plan to arm wins; later triggers
    /// cannot downgrade it.
    fn activate_termination(&mut self, action: TerminationAction, _now: EventClockTime) {
        // The child may well already be dead; the plan tolerates signalling a
        // zombie.
        self.tether_timer.disarm();

        if self.termination.is_some() {
            return;
        }
        log::debug!("activating termination timer");
        self.termination = Some((action, 0));
        self.termination_timer.set_period(self.signal_period);
        self.termination_timer.trigger();
    }

    fn on_termination_timer(&mut self) -> anyhow::Result<()> {
        let Some((action, index)) = self.termination else {
            return Ok(());
        };

        let plan = action.plan();
        let signal = plan[index.min(plan.len() - 1)];
        if index + 1 < plan.len() {
            self.termination = Some((action, index + 1));
        }

        log::warn!("Killing child pid {} with {}", self.child_pid, signal);
        match kill(self.child_pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(errno).context("Unable to signal child process"),
        }
    }
}

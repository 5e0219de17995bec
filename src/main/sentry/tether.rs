//! The tether thread: a blocking bridge from the child's tether pipe to the
//! watchdog's stdout.
//!
//! The monitoring loop must stay strictly non-blocking, but stdout is
//! inherited from the invoker and may block at any time. This thread absorbs
//! that blocking. It prefers `splice(2)` and falls back to a bounce buffer
//! when stdout is opened with `O_APPEND`, which splice does not support
//! (https://bugzilla.kernel.org/show_bug.cgi?id=82841).
//!
//! The control pipe sequences shutdown: the monitor writes one byte when the
//! child has terminated, the thread drains the remaining data within the
//! configured deadline, then retires the reader end of the control pipe so
//! the monitor observes the disconnect on the writer end. SIGALRM serves as a
//! wakeup nudge and is unblocked only on this thread.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::Signal;
use nix::unistd;

use crate::utility::fd;
use crate::utility::pipe::Pipe;
use crate::utility::signal::ThreadSigMask;
use crate::utility::time::{EventClockTime, LapTimer};

const BOUNCE_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Stopped,
    Running,
    Stopping,
}

struct Shared {
    state: Mutex<ThreadState>,
    state_changed: Condvar,
    activity_since: Mutex<EventClockTime>,
    pthread: Mutex<Option<Pthread>>,
}

pub struct TetherThread {
    control: Pipe,
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
    flushed: bool,
}

impl TetherThread {
    /// Start the tether thread. `null_read_fd` must stay open until after
    /// [`TetherThread::join`]; it backs the shutdown dup2 of stdin and the
    /// control pipe.
    pub fn new(null_read_fd: RawFd, drain_timeout: Option<Duration>) -> anyhow::Result<Self> {
        let control = Pipe::new(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(ThreadState::Stopped),
            state_changed: Condvar::new(),
            activity_since: Mutex::new(EventClockTime::now()),
            pthread: Mutex::new(None),
        });

        let thread = {
            // Block everything while spawning so the new thread starts with
            // all signals masked; it unblocks SIGALRM for itself.
            let _mask = ThreadSigMask::block_all()?;

            let shared = Arc::clone(&shared);
            let control_read_fd = control.reader_fd();
            thread::Builder::new()
                .name("tether".into())
                .spawn(move || thread_main(&shared, control_read_fd, null_read_fd, drain_timeout))?
        };

        // Do not return until the thread is actually servicing the pipes.
        {
            let mut state = shared.state.lock().unwrap();
            while *state == ThreadState::Stopped {
                state = shared.state_changed.wait(state).unwrap();
            }
        }

        Ok(Self {
            control,
            shared,
            thread: Some(thread),
            flushed: false,
        })
    }

    /// The descriptor the monitor watches: it reports an error event once the
    /// thread has retired its end of the control pipe.
    pub fn control_monitor_fd(&self) -> RawFd {
        self.control.writer_fd()
    }

    /// The last time the thread observed data moving.
    pub fn activity_since(&self) -> EventClockTime {
        *self.shared.activity_since.lock().unwrap()
    }

    /// Ask the thread to start draining: the child has terminated and no
    /// more input will be produced. Racing against a thread that already
    /// finished is benign.
    pub fn flush(&mut self) -> nix::Result<()> {
        log::debug!("flushing tether thread");
        match fd::write_fd(self.control.writer_fd(), &[0u8]) {
            Ok(_) | Err(Errno::EPIPE) | Err(Errno::EAGAIN) => {
                self.flushed = true;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Nudge the thread with SIGALRM so a blocking write cannot stall the
    /// drain forever.
    pub fn ping(&self) -> nix::Result<()> {
        log::debug!("ping tether thread");
        if let Some(pthread) = *self.shared.pthread.lock().unwrap() {
            pthread_kill(pthread, Signal::SIGALRM)?;
        }
        Ok(())
    }

    /// Wait for the thread to finish. Callers flush first; the thread only
    /// reaches its exit wait after the drain completes.
    pub fn join(mut self) {
        assert!(self.flushed);
        self.join_impl();
    }

    fn join_impl(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock().unwrap();
            *state = ThreadState::Stopping;
            self.shared.state_changed.notify_all();
        }
        let _ = thread.join();
    }
}

impl Drop for TetherThread {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.flush();
            self.join_impl();
        }
    }
}

fn set_activity(shared: &Shared, now: EventClockTime) {
    *shared.activity_since.lock().unwrap() = now;
}

fn thread_main(
    shared: &Shared,
    control_fd: RawFd,
    null_read_fd: RawFd,
    drain_timeout: Option<Duration>,
) {
    *shared.pthread.lock().unwrap() = Some(pthread_self());
    {
        let mut state = shared.state.lock().unwrap();
        *state = ThreadState::Running;
        shared.state_changed.notify_all();
    }

    // Do not open or close files on this thread; it races the main thread
    // forking processes that must inherit a controlled descriptor table. The
    // source is the tether pipe installed as stdin, known non-blocking; the
    // destination is the inherited stdout, likely blocking.
    let src_fd = libc::STDIN_FILENO;
    let dst_fd = libc::STDOUT_FILENO;

    let use_copy = match nix::fcntl::fcntl(dst_fd, FcntlArg::F_GETFL) {
        Ok(flags) => OFlag::from_bits_retain(flags).contains(OFlag::O_APPEND),
        Err(_) => true,
    };

    let alarm_mask = ThreadSigMask::unblock(&[Signal::SIGALRM]);

    run_transfer(shared, src_fd, dst_fd, control_fd, use_copy, drain_timeout);

    drop(alarm_mask);

    // Replace stdin so SIGPIPE can propagate to the child, and retire the
    // reader half of the control pipe without closing the descriptor; the
    // monitor is waiting for the control pipe to report the disconnect.
    let _ = unistd::dup2(null_read_fd, src_fd);
    let _ = unistd::dup2(null_read_fd, control_fd);

    log::debug!("tether emptied");

    let mut state = shared.state.lock().unwrap();
    while *state == ThreadState::Running {
        state = shared.state_changed.wait(state).unwrap();
    }
}

fn run_transfer(
    shared: &Shared,
    src_fd: RawFd,
    dst_fd: RawFd,
    control_fd: RawFd,
    use_copy: bool,
    drain_timeout: Option<Duration>,
) {
    let mut buffer = [0u8; BOUNCE_BUFFER_SIZE];
    let mut buffered: (usize, usize) = (0, 0);

    let mut control_events = PollFlags::POLLIN;
    let mut input_events = PollFlags::POLLIN;
    let mut output_events = PollFlags::empty();
    let mut control_armed = true;

    let mut drain_timer = LapTimer::new(Duration::ZERO);

    while control_armed {
        let now = EventClockTime::now();
        let timeout = match drain_timer.next_expiry(now) {
            None => PollTimeout::NONE,
            Some(remaining) => {
                let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
                PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
            }
        };

        let (control_ready, transfer_ready) = {
            let mut fds = [
                PollFd::new(
                    unsafe { std::os::unix::io::BorrowedFd::borrow_raw(control_fd) },
                    control_events,
                ),
                PollFd::new(
                    unsafe { std::os::unix::io::BorrowedFd::borrow_raw(src_fd) },
                    input_events,
                ),
                PollFd::new(
                    unsafe { std::os::unix::io::BorrowedFd::borrow_raw(dst_fd) },
                    output_events,
                ),
            ];
            match poll(&mut fds, timeout) {
                Err(Errno::EINTR) => continue,
                Err(_) => return,
                Ok(_) => (
                    fds[0].revents().unwrap_or(PollFlags::empty()) != PollFlags::empty(),
                    fds[1].revents().unwrap_or(PollFlags::empty()) != PollFlags::empty()
                        || fds[2].revents().unwrap_or(PollFlags::empty()) != PollFlags::empty(),
                ),
            }
        };

        let now = EventClockTime::now();

        if control_ready {
            let mut byte = [0u8; 1];
            match fd::read_fd(control_fd, &mut byte) {
                Ok(_) | Err(Errno::EAGAIN) => {}
                Err(_) => return,
            }
            log::debug!("tether disconnection request received");

            // A zero drain timeout means the drain is unbounded.
            match drain_timeout {
                Some(timeout) => {
                    drain_timer.set_period(timeout);
                    drain_timer.restart(now);
                }
                None => drain_timer.disarm(),
            }
            control_events = PollFlags::empty();
        }

        if transfer_ready {
            set_activity(shared, now);

            let drained = if use_copy {
                copy_step(
                    src_fd,
                    dst_fd,
                    &mut buffer,
                    &mut buffered,
                    &mut input_events,
                    &mut output_events,
                )
            } else {
                splice_step(src_fd, dst_fd, &mut input_events, &mut output_events)
            };

            match drained {
                Err(_) => return,
                Ok(true) => control_armed = false,
                Ok(false) => {}
            }
        }

        if drain_timer.expired(now) {
            // Drain deadline passed; force completion.
            drain_timer.disarm();
            control_armed = false;
        }
    }
}

/// One bounce-buffer transfer step. Returns true once the tether is drained:
/// no pending input, or the output side is broken.
fn copy_step(
    src_fd: RawFd,
    dst_fd: RawFd,
    buffer: &mut [u8],
    buffered: &mut (usize, usize),
    input_events: &mut PollFlags,
    output_events: &mut PollFlags,
) -> nix::Result<bool> {
    let (start, end) = *buffered;

    if start == end {
        if fd::available_bytes(src_fd)? == 0 {
            log::debug!("tether drain input empty");
            return Ok(true);
        }

        // This read does not block: the pipe is private to the sentry and
        // only this thread consumes it.
        match unistd::read(src_fd, buffer) {
            Ok(0) => {
                log::debug!("tether drain input closed");
                return Ok(true);
            }
            Ok(count) => {
                *buffered = (0, count);
                *input_events = PollFlags::empty();
                *output_events = PollFlags::POLLOUT;
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(err) => return Err(err),
        }
    } else {
        // This write may block; that is the reason this thread exists.
        match unistd::write(
            unsafe { std::os::unix::io::BorrowedFd::borrow_raw(dst_fd) },
            &buffer[start..end],
        ) {
            Ok(0) => {
                log::debug!("tether drain output closed");
                return Ok(true);
            }
            Ok(count) => {
                *buffered = (start + count, end);
                if buffered.0 == buffered.1 {
                    *buffered = (0, 0);
                    *input_events = PollFlags::POLLIN;
                    *output_events = PollFlags::empty();
                }
            }
            Err(Errno::EPIPE) => {
                log::debug!("tether drain output broken");
                return Ok(true);
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(false)
}

/// One splice transfer step. Returns true once the tether is drained.
fn splice_step(
    src_fd: RawFd,
    dst_fd: RawFd,
    input_events: &mut PollFlags,
    output_events: &mut PollFlags,
) -> nix::Result<bool> {
    // With no input pending, the poll can only have fired for an input or
    // output disconnect; either way the tether is drained.
    let available = fd::available_bytes(src_fd)?;
    if available == 0 {
        log::debug!("tether drain input empty");
        return Ok(true);
    }

    match fd::splice_fd(src_fd, dst_fd, available) {
        Ok(0) => {
            log::debug!("tether drain output closed");
            return Ok(true);
        }
        Ok(count) => {
            log::debug!("drained {count} bytes from fd {src_fd} to fd {dst_fd}");
            if fd::wait_read_ready(src_fd, Some(Duration::ZERO))? {
                // More input pending but the output queue is full; wait for
                // the output side.
                *input_events = PollFlags::empty();
                *output_events = PollFlags::POLLOUT;
            } else {
                *input_events = PollFlags::POLLIN;
                *output_events = PollFlags::empty();
            }
        }
        Err(Errno::EPIPE) => {
            log::debug!("tether drain output broken");
            return Ok(true);
        }
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => {}
        Err(err) => return Err(err),
    }

    Ok(false)
}

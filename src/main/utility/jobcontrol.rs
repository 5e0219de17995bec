//! Job-control signal watching.
//!
//! Signals are observed on a dedicated dispatch thread rather than in handler
//! context, so the registered callbacks are ordinary code. The watchdog
//! registers callbacks to forward signals to the child, pause and resume the
//! child process group, reap on SIGCHLD, and observe continuation.

use std::sync::{Arc, Mutex};
use std::thread;

use nix::sys::signal::Signal;
use signal_hook::consts::signal::{
    SIGCHLD, SIGCONT, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGTSTP,
};
use signal_hook::iterator::{Handle, Signals};

type SignalWatch = Box<dyn Fn(Signal) + Send>;
type Watch = Box<dyn Fn() + Send>;

#[derive(Default)]
struct Watches {
    raise: Option<SignalWatch>,
    reap: Option<Watch>,
    pause: Option<Watch>,
    resume: Option<Watch>,
    cont: Option<Watch>,
}

/// Owns the signal dispatch thread for the life of the supervisor.
pub struct JobControl {
    watches: Arc<Mutex<Watches>>,
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl JobControl {
    pub fn new() -> anyhow::Result<Self> {
        let mut signals = Signals::new([
            SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGTSTP, SIGCONT, SIGCHLD,
        ])?;
        let handle = signals.handle();

        let watches: Arc<Mutex<Watches>> = Arc::new(Mutex::new(Watches::default()));
        let dispatch = Arc::clone(&watches);

        let thread = thread::Builder::new()
            .name("jobcontrol".into())
            .spawn(move || {
                for signal in signals.forever() {
                    dispatch_signal(&dispatch, signal);
                }
            })?;

        Ok(Self {
            watches,
            handle,
            thread: Some(thread),
        })
    }

    /// Forward asynchronous termination signals to the callback.
    pub fn watch_signals(&self, raise: impl Fn(Signal) + Send + 'static) {
        self.watches.lock().unwrap().raise = Some(Box::new(raise));
    }

    pub fn unwatch_signals(&self) {
        self.watches.lock().unwrap().raise = None;
    }

    /// Invoke the callback on SIGCHLD.
    pub fn watch_done(&self, reap: impl Fn() + Send + 'static) {
        self.watches.lock().unwrap().reap = Some(Box::new(reap));
    }

    pub fn unwatch_done(&self) {
        self.watches.lock().unwrap().reap = None;
    }

    /// Invoke `pause` before this process stops on SIGTSTP, and `resume`
    /// when it continues.
    pub fn watch_stop(
        &self,
        pause: impl Fn() + Send + 'static,
        resume: impl Fn() + Send + 'static,
    ) {
        let mut watches = self.watches.lock().unwrap();
        watches.pause = Some(Box::new(pause));
        watches.resume = Some(Box::new(resume));
    }

    pub fn unwatch_stop(&self) {
        let mut watches = self.watches.lock().unwrap();
        watches.pause = None;
        watches.resume = None;
    }

    /// Invoke the callback on SIGCONT, after any resume callback.
    pub fn watch_continue(&self, cont: impl Fn() + Send + 'static) {
        self.watches.lock().unwrap().cont = Some(Box::new(cont));
    }

    pub fn unwatch_continue(&self) {
        self.watches.lock().unwrap().cont = None;
    }
}

fn dispatch_signal(watches: &Mutex<Watches>, signal: i32) {
    match signal {
        SIGCHLD => {
            let watches = watches.lock().unwrap();
            if let Some(reap) = &watches.reap {
                reap();
            }
        }
        SIGTSTP => {
            {
                let watches = watches.lock().unwrap();
                if let Some(pause) = &watches.pause {
                    pause();
                }
            }
            // Stop this process as well; the lock is released first so the
            // resume path is not blocked when the process continues.
            let _ = signal_hook::low_level::emulate_default_handler(SIGTSTP);
        }
        SIGCONT => {
            let watches = watches.lock().unwrap();
            if let Some(resume) = &watches.resume {
                resume();
            }
            if let Some(cont) = &watches.cont {
                cont();
            }
        }
        other => {
            let watches = watches.lock().unwrap();
            if let Some(raise) = &watches.raise {
                if let Ok(signal) = Signal::try_from(other) {
                    raise(signal);
                }
            }
        }
    }
}

impl Drop for JobControl {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(counter: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < expected {
            assert!(Instant::now() < deadline, "callback never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn dispatches_watched_signals() {
        let control = JobControl::new().unwrap();

        let raised = Arc::new(AtomicUsize::new(0));
        let reaped = Arc::new(AtomicUsize::new(0));
        {
            let raised = Arc::clone(&raised);
            control.watch_signals(move |signal| {
                assert_eq!(signal, Signal::SIGHUP);
                raised.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let reaped = Arc::clone(&reaped);
            control.watch_done(move || {
                reaped.fetch_add(1, Ordering::SeqCst);
            });
        }

        nix::sys::signal::raise(Signal::SIGHUP).unwrap();
        wait_for(&raised, 1);

        nix::sys::signal::raise(Signal::SIGCHLD).unwrap();
        wait_for(&reaped, 1);

        control.unwatch_signals();
        control.unwatch_done();
    }

    #[test]
    fn continue_runs_resume_then_cont() {
        let control = JobControl::new().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let order = Arc::clone(&order);
            let seen = Arc::clone(&seen);
            control.watch_stop(
                || {},
                move || {
                    order.lock().unwrap().push("resume");
                    seen.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        {
            let order = Arc::clone(&order);
            let seen = Arc::clone(&seen);
            control.watch_continue(move || {
                order.lock().unwrap().push("cont");
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        nix::sys::signal::raise(Signal::SIGCONT).unwrap();
        wait_for(&seen, 2);
        // Other tests may raise SIGCONT of their own; only the relative
        // order matters.
        assert_eq!(&order.lock().unwrap()[..2], ["resume", "cont"]);
    }
}

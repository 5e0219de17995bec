//! Process-wide signal plumbing.
//!
//! Handlers installed here do nothing beyond bumping an atomic counter; every
//! other reaction to a signal happens on the job-control dispatch thread or in
//! an event loop that observes the counter.

use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

static SIGCONT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of SIGCONT deliveries observed by this process.
pub fn sigcont_count() -> u64 {
    SIGCONT_COUNT.load(Ordering::Acquire)
}

/// Install the SIGCONT counter and the SIGALRM wakeup handler.
///
/// The SIGALRM handler is deliberately empty: its only purpose is to give
/// `pthread_kill(SIGALRM)` an effect, interrupting a poll with EINTR on the
/// targeted thread. Threads that must not be woken keep SIGALRM blocked.
pub fn install_handlers() -> anyhow::Result<()> {
    unsafe {
        signal_hook::low_level::register(libc::SIGCONT, || {
            SIGCONT_COUNT.fetch_add(1, Ordering::AcqRel);
        })
    }?;

    extern "C" fn alarm_handler(_: libc::c_int) {}

    let action = SigAction::new(
        SigHandler::Handler(alarm_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGALRM, &action) }?;

    Ok(())
}

/// RAII adjustment of the calling thread's signal mask. The previous mask is
/// restored on drop.
#[derive(Debug)]
pub struct ThreadSigMask {
    saved: SigSet,
}

impl ThreadSigMask {
    /// Block every signal on the calling thread.
    pub fn block_all() -> nix::Result<Self> {
        Self::apply(SigmaskHow::SIG_BLOCK, SigSet::all())
    }

    /// Unblock the given signals on the calling thread.
    pub fn unblock(signals: &[Signal]) -> nix::Result<Self> {
        let mut set = SigSet::empty();
        for signal in signals {
            set.add(*signal);
        }
        Self::apply(SigmaskHow::SIG_UNBLOCK, set)
    }

    fn apply(how: SigmaskHow, set: SigSet) -> nix::Result<Self> {
        let mut saved = SigSet::empty();
        signal::pthread_sigmask(how, Some(&set), Some(&mut saved))?;
        Ok(Self { saved })
    }
}

impl Drop for ThreadSigMask {
    fn drop(&mut self) {
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None);
    }
}

/// Discard the given signal for the whole process.
pub fn ignore_signal(signal: Signal) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(signal, &action) }?;
    Ok(())
}

/// Restore the default disposition for the given signals. Used by forked
/// processes that must not inherit the watchdog's handlers.
pub fn reset_dispositions(signals: &[Signal]) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in signals {
        unsafe { signal::sigaction(*signal, &action) }?;
    }
    Ok(())
}

/// Terminate with SIGQUIT under the default disposition so the parent
/// observes the same outcome as the child that dumped core.
pub fn quit_with_core() -> nix::Result<()> {
    reset_dispositions(&[Signal::SIGQUIT])?;

    let mut set = SigSet::empty();
    set.add(Signal::SIGQUIT);
    signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)?;

    signal::raise(Signal::SIGQUIT)?;

    // SIGQUIT is fatal by default; reaching this point means delivery was
    // interfered with.
    Err(Errno::EINTR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmask_restores_on_drop() {
        let before = SigSet::thread_get_mask().unwrap();
        {
            let _mask = ThreadSigMask::block_all().unwrap();
            let blocked = SigSet::thread_get_mask().unwrap();
            assert!(blocked.contains(Signal::SIGUSR1));
        }
        let after = SigSet::thread_get_mask().unwrap();
        assert_eq!(
            before.contains(Signal::SIGUSR1),
            after.contains(Signal::SIGUSR1)
        );
    }

    #[test]
    fn sigcont_counter_tracks_delivery() {
        install_handlers().unwrap();

        let seen = sigcont_count();
        signal::raise(Signal::SIGCONT).unwrap();
        assert!(sigcont_count() > seen);
    }
}

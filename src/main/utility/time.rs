//! Clocks, deadlines and lap timers for the supervision event loops.
//!
//! All waits are measured on the event clock: the monotonic clock paired with
//! a [`SigContTracker`]. A whole-process stop followed by SIGCONT increments
//! the tracked counter, and any interval spanning such an increment is
//! discarded rather than treated as elapsed time. This keeps job-control
//! stoppages from masquerading as timeouts.

use std::convert::TryFrom;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use once_cell::sync::Lazy;

use crate::utility::signal;

static PROCESS_CLOCK_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Anchor the process elapsed-time base. Called once during startup so that
/// diagnostic timestamps measure from program start rather than first use.
pub fn init_process_clock() {
    Lazy::force(&PROCESS_CLOCK_BASE);
}

/// Time elapsed since [`init_process_clock`].
pub fn process_uptime() -> Duration {
    PROCESS_CLOCK_BASE.elapsed()
}

/// Helper for formatting times.
#[derive(Debug, Eq, PartialEq)]
pub struct TimeParts {
    pub hours: u32,
    pub mins: u32,
    pub secs: u64,
    pub nanos: u64,
}

impl TimeParts {
    pub fn from_nanos(total_nanos: u128) -> Self {
        // Total number of integer seconds.
        let whole_secs = u64::try_from(total_nanos / 1_000_000_000).unwrap();
        // Total number of integer minutes.
        let whole_mins = u32::try_from(whole_secs / 60).unwrap();
        // Total number of integer hours, which is also the hours part.
        let whole_hours = whole_mins / 60;

        // Integer minutes, after whole hours are subtracted out.
        let mins_part = whole_mins - whole_hours * 60;
        // Integers secs, after integer minutes are subtracted out.
        let secs_part = whole_secs - u64::from(whole_mins) * 60;
        // Nanos, after integer secs are subtracted out.
        let nanos_part =
            u64::try_from(total_nanos - u128::from(whole_secs) * 1_000_000_000).unwrap();

        Self {
            hours: whole_hours,
            mins: mins_part,
            secs: secs_part,
            nanos: nanos_part,
        }
    }
}

/// An instant on the event clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventClockTime(Instant);

impl EventClockTime {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Duration since `earlier`, zero if `earlier` is in the future.
    pub fn since(&self, earlier: EventClockTime) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

/// Samples the process-wide SIGCONT counter. `check()` reports whether the
/// process was stopped and continued since the previous observation, and
/// resynchronizes the tracker.
#[derive(Debug, Clone)]
pub struct SigContTracker {
    seen: u64,
}

impl SigContTracker {
    pub fn new() -> Self {
        Self {
            seen: signal::sigcont_count(),
        }
    }

    pub fn check(&mut self) -> bool {
        let count = signal::sigcont_count();
        let continued = count != self.seen;
        self.seen = count;
        continued
    }
}

impl Default for SigContTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A deadline for a sequence of I/O steps.
///
/// The first expiry check always passes so that the caller gets at least one
/// attempt. A SIGCONT observed between checks restarts the measured interval
/// instead of expiring it.
#[derive(Debug)]
pub struct Deadline {
    since: Option<EventClockTime>,
    duration: Option<Duration>,
    remaining: Duration,
    tracker: SigContTracker,
    expired: bool,
}

impl Deadline {
    /// `None` means unbounded: `check` never times out.
    pub fn new(duration: Option<Duration>) -> Self {
        Self {
            since: None,
            duration,
            remaining: Duration::ZERO,
            tracker: SigContTracker::new(),
            expired: false,
        }
    }

    pub fn expired(&self) -> bool {
        self.expired
    }

    /// Run one poll/wait step against the deadline.
    ///
    /// `poll` probes for readiness without blocking. If the probe reports not
    /// ready and the deadline has not expired, `wait` blocks for at most the
    /// remaining time. Returns `Ok(true)` when ready, `Ok(false)` when not
    /// ready (including when a SIGCONT restarted the interval), and
    /// `Err(ETIMEDOUT)` once the deadline expires.
    pub fn check<P, W>(&mut self, mut poll: P, mut wait: W) -> nix::Result<bool>
    where
        P: FnMut() -> nix::Result<bool>,
        W: FnMut(Option<Duration>) -> nix::Result<bool>,
    {
        let now = EventClockTime::now();

        // In case the process is stopped after the time is latched, probe the
        // fds once more before ruling on the deadline.
        let mut ready = poll()?;

        if let Some(duration) = self.duration {
            match self.since {
                None => {
                    self.since = Some(now);
                    self.remaining = duration;
                }
                Some(since) => {
                    let elapsed = now.since(since);
                    if elapsed >= duration {
                        if self.tracker.check() {
                            // Stopped and continued; discard the interval.
                            self.since = None;
                            return Ok(false);
                        }
                        self.expired = true;
                        return Err(Errno::ETIMEDOUT);
                    }
                    self.remaining = duration - elapsed;
                }
            }
        }

        if !ready {
            ready = wait(self.duration.map(|_| self.remaining))?;
        }

        Ok(ready)
    }
}

/// A periodic timer for poll loops.
///
/// A zero period disables the timer. `trigger()` forces expiry on the next
/// check regardless of elapsed time; `restart_at()` realigns the lap with an
/// externally observed activity time.
#[derive(Debug)]
pub struct LapTimer {
    period: Duration,
    since: EventClockTime,
    forced: bool,
}

impl LapTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            since: EventClockTime::now(),
            forced: false,
        }
    }

    pub fn active(&self) -> bool {
        !self.period.is_zero()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
        self.forced = false;
    }

    pub fn disarm(&mut self) {
        self.set_period(Duration::ZERO);
    }

    pub fn restart(&mut self, now: EventClockTime) {
        self.since = now;
        self.forced = false;
    }

    pub fn restart_at(&mut self, since: EventClockTime) {
        self.since = since;
        self.forced = false;
    }

    /// Expire on the next check.
    pub fn trigger(&mut self) {
        self.forced = true;
    }

    /// Check for expiry and, if expired, begin the next lap.
    pub fn expired(&mut self, now: EventClockTime) -> bool {
        if !self.active() {
            return false;
        }
        if self.forced || now.since(self.since) >= self.period {
            self.since = now;
            self.forced = false;
            true
        } else {
            false
        }
    }

    /// Time until the next expiry, `None` when inactive.
    pub fn next_expiry(&self, now: EventClockTime) -> Option<Duration> {
        if !self.active() {
            return None;
        }
        if self.forced {
            return Some(Duration::ZERO);
        }
        Some(self.period.saturating_sub(now.since(self.since)))
    }
}

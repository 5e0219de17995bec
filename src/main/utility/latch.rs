//! Event latches connecting signal-driven callbacks to a poll loop.
//!
//! A latch is set from the job-control dispatch thread when the watched
//! process is observed running, and disabled when it terminates. Each
//! transition raises the bound event pipe; the owning event loop drains the
//! pipe and consumes the transition with [`EventLatch::poll`].

use std::sync::{Arc, Mutex};

use crate::utility::pipe::EventPipe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Off,
    On,
    Disabled,
}

#[derive(Debug)]
struct Inner {
    state: LatchState,
    changed: bool,
    pipe: Option<Arc<EventPipe>>,
}

#[derive(Debug)]
pub struct EventLatch {
    name: &'static str,
    inner: Mutex<Inner>,
}

impl EventLatch {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                state: LatchState::Off,
                changed: false,
                pipe: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record that the watched subject is running. Returns false once the
    /// latch has been disabled.
    pub fn set(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            LatchState::Disabled => false,
            LatchState::On => true,
            LatchState::Off => {
                inner.state = LatchState::On;
                inner.changed = true;
                raise(&inner);
                true
            }
        }
    }

    /// Permanently disable the latch; the consuming poll reports the subject
    /// as terminated.
    pub fn disable(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == LatchState::Disabled {
            return false;
        }
        inner.state = LatchState::Disabled;
        inner.changed = true;
        raise(&inner);
        true
    }

    pub fn disabled(&self) -> bool {
        self.inner.lock().unwrap().state == LatchState::Disabled
    }

    /// Consume a pending transition. `Some(true)` means the subject was
    /// observed running, `Some(false)` that it terminated. A set latch resets
    /// to off when consumed so later activity can trigger again.
    pub fn poll(&self) -> Option<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.changed {
            return None;
        }
        inner.changed = false;
        match inner.state {
            LatchState::On => {
                inner.state = LatchState::Off;
                Some(true)
            }
            LatchState::Disabled => Some(false),
            LatchState::Off => None,
        }
    }

    /// Bind transitions to an event pipe. A transition recorded while
    /// unbound is surfaced immediately on bind.
    pub fn bind_pipe(&self, pipe: Arc<EventPipe>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.changed {
            let _ = pipe.raise();
        }
        inner.pipe = Some(pipe);
    }

    pub fn unbind_pipe(&self) {
        self.inner.lock().unwrap().pipe = None;
    }
}

fn raise(inner: &Inner) {
    if let Some(pipe) = &inner.pipe {
        let _ = pipe.raise();
    }
}

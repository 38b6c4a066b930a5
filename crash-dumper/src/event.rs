//! The request/complete/quit handshake between callers and the dump thread.
//!
//! Each signal is manual-reset: once set it stays set, and is observed by
//! every waiter, until it is explicitly reset. All three share a single lock
//! so that the dump thread can wait on more than one of them at a time.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Signal {
    /// A caller has stored a request and wants a dump written
    Request = 0x1,
    /// The dump thread has finished the last request
    Complete = 0x2,
    /// The dump thread should exit
    Quit = 0x4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The set was closed, no signal will ever be delivered again
    Closed,
    TimedOut,
}

struct State {
    signaled: u8,
    closed: bool,
}

pub(crate) struct SignalSet {
    state: Mutex<State>,
    cvar: Condvar,
}

impl SignalSet {
    pub(crate) const fn new() -> Self {
        Self {
            state: parking_lot::const_mutex(State {
                signaled: 0,
                closed: false,
            }),
            cvar: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn set(&self, signal: Signal) {
        let mut state = self.state.lock();
        state.signaled |= signal as u8;
        self.cvar.notify_all();
    }

    #[inline]
    pub(crate) fn reset(&self, signal: Signal) {
        self.state.lock().signaled &= !(signal as u8);
    }

    #[cfg(test)]
    #[inline]
    pub(crate) fn is_set(&self, signal: Signal) -> bool {
        self.state.lock().signaled & signal as u8 != 0
    }

    /// Closes the set, every current and future wait fails with
    /// [`WaitError::Closed`]
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cvar.notify_all();
    }

    /// Waits until one of `signals` is set, returning the first one, in the
    /// order they were specified, that is.
    ///
    /// The signal is not reset.
    pub(crate) fn wait_any(
        &self,
        signals: &[Signal],
        timeout: Option<Duration>,
    ) -> Result<Signal, WaitError> {
        let deadline = timeout.map(|to| Instant::now() + to);
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(WaitError::Closed);
            }

            if let Some(sig) = signals
                .iter()
                .find(|sig| state.signaled & **sig as u8 != 0)
            {
                return Ok(*sig);
            }

            match deadline {
                Some(deadline) => {
                    if self.cvar.wait_until(&mut state, deadline).timed_out() {
                        return signals
                            .iter()
                            .find(|sig| state.signaled & **sig as u8 != 0)
                            .copied()
                            .ok_or(WaitError::TimedOut);
                    }
                }
                None => self.cvar.wait(&mut state),
            }
        }
    }

    #[inline]
    pub(crate) fn wait(&self, signal: Signal, timeout: Option<Duration>) -> Result<(), WaitError> {
        self.wait_any(&[signal], timeout).map(|_| ())
    }
}

//! Waitable notification primitives shared by the stage threads.
//!
//! - [`Signal`]: a coalescing level-triggered flag that can be waited on together with an
//!   input channel ([`Signal::wait_io`]). Control events always win over input.
//! - [`Semaphore`]: a counting semaphore whose blocking acquire can be aborted by a [`Signal`].
//!
//! Both are built on bounded `crossbeam-channel` channels so they can take part in a single
//! [`Select`] together with other channels (device errors, byte-source chunks).

use std::io;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Select, Sender, bounded};

use crate::error::SourceError;

/// How long a byte source waits per readiness attempt before re-checking its deadline.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Result of waiting on a [`Signal`] together with an input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// The signal is set. Reported even when input is ready too.
    Signal,
    /// The input channel has a message pending.
    Input,
    /// The input channel was disconnected.
    Error,
    Timeout,
}

/// A coalescing binary flag.
///
/// Setting an already set signal is a no-op and waiting never consumes the flag: it stays set
/// until [`Signal::clear`] is called. Clones refer to the same flag.
#[derive(Clone)]
pub struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    pub fn set(&self) {
        // A full channel means the flag is already raised.
        let _ = self.tx.try_send(());
    }

    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub fn is_set(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Block until the signal is set.
    pub fn wait(&self) {
        let mut sel = Select::new();
        sel.recv(&self.rx);
        sel.ready();
    }

    /// Block until the signal is set or `timeout` elapses. Returns `true` if set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let mut sel = Select::new();
        sel.recv(&self.rx);
        sel.ready_timeout(timeout).is_ok()
    }

    /// Wait for either this signal or a pending message on `input`, without consuming either.
    ///
    /// `None` as timeout blocks indefinitely.
    pub fn wait_io<T>(&self, input: &Receiver<T>, timeout: Option<Duration>) -> WaitEvent {
        if self.is_set() {
            return WaitEvent::Signal;
        }

        let mut sel = Select::new();
        let sig = sel.recv(&self.rx);
        let inp = sel.recv(input);
        let ready = match timeout {
            Some(t) => match sel.ready_timeout(t) {
                Ok(index) => index,
                Err(_) => return WaitEvent::Timeout,
            },
            None => sel.ready(),
        };

        if ready == sig || self.is_set() {
            WaitEvent::Signal
        } else if ready == inp && input.is_empty() {
            // A receive is "ready" on a disconnected channel even though nothing is queued.
            WaitEvent::Error
        } else {
            WaitEvent::Input
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Input readiness after the retry policy has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Closed,
}

/// Wait for `input` to become readable, retrying on timeouts until `deadline`.
///
/// A raised `signal` aborts the wait with [`SourceError::Interrupted`] so the caller can return
/// to its event loop and handle the control event.
pub fn wait_readable<T>(
    signal: &Signal,
    input: &Receiver<T>,
    deadline: Option<Instant>,
) -> Result<Readiness, SourceError> {
    loop {
        let slice = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(RETRY_INTERVAL),
            None => RETRY_INTERVAL,
        };
        match signal.wait_io(input, Some(slice)) {
            WaitEvent::Input => return Ok(Readiness::Ready),
            WaitEvent::Error => return Ok(Readiness::Closed),
            WaitEvent::Signal => return Err(SourceError::Interrupted),
            WaitEvent::Timeout => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(SourceError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for input",
                    )));
                }
            }
        }
    }
}

/// Counting semaphore with abortable acquire.
pub struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Semaphore {
    /// Create a semaphore holding `count` permits.
    pub fn new(count: usize) -> Self {
        let (tx, rx) = bounded(count.max(1));
        for _ in 0..count {
            let _ = tx.try_send(());
        }
        Self { tx, rx }
    }

    /// Number of permits currently available (best-effort snapshot).
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    pub fn release(&self) {
        if self.tx.try_send(()).is_err() {
            tracing::warn!("semaphore released beyond its capacity");
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Take one permit, blocking until one is available.
    pub fn acquire_blocking(&self) -> bool {
        self.rx.recv().is_ok()
    }

    /// Take one permit, waiting at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Take one permit, or give up as soon as `abort` is set.
    ///
    /// Returns `false` without consuming a permit when the signal is (or becomes) set, even if a
    /// permit is available at the same time.
    pub fn acquire(&self, abort: &Signal) -> bool {
        loop {
            if abort.is_set() {
                return false;
            }

            let mut sel = Select::new();
            let permit = sel.recv(&self.rx);
            sel.recv(abort.receiver());
            let ready = sel.ready();

            if abort.is_set() {
                return false;
            }
            if ready == permit && self.rx.try_recv().is_ok() {
                return true;
            }
            // Another waiter took the permit first.
        }
    }
}

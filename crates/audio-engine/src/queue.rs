//! Thread-safe event queue with priority insertion and atomic flush.
//!
//! Each pipeline stage owns one [`EventQueue`] and is the only consumer of it. Producers post:
//! - [`Post::Back`] for data, preserving FIFO order
//! - [`Post::Front`] for control events that must jump queued data
//! - [`Post::Flush`] to replace everything pending with a single event
//!
//! The queue's [`Signal`] is set exactly while the queue is non-empty, so a consumer can wait on
//! it together with other readiness sources (pool permits, device errors, input channels).
//! A second signal is set while at least one control event is pending; blocking byte sources
//! use it so that only commands, not stream bookkeeping, interrupt their reads.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::event::{Event, EventKind};
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Post {
    Back,
    Front,
    Flush,
}

struct Pending {
    list: VecDeque<Event>,
    controls: usize,
}

pub struct EventQueue {
    pending: Mutex<Pending>,
    signal: Signal,
    control: Signal,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                list: VecDeque::new(),
                controls: 0,
            }),
            signal: Signal::new(),
            control: Signal::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The readiness signal, set while events are pending.
    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Set while a control event is pending.
    pub fn control_signal(&self) -> &Signal {
        &self.control
    }

    fn take_front(&self, pending: &mut Pending) -> Option<Event> {
        let event = pending.list.pop_front()?;
        if event.kind().is_control() {
            pending.controls -= 1;
            if pending.controls == 0 {
                self.control.clear();
            }
        }
        if pending.list.is_empty() {
            self.signal.clear();
        }
        Some(event)
    }

    pub fn post(&self, event: Event, mode: Post) {
        let is_control = event.kind().is_control();
        let stale = {
            let mut pending = self.lock();
            let stale = match mode {
                Post::Back => {
                    pending.list.push_back(event);
                    None
                }
                Post::Front => {
                    pending.list.push_front(event);
                    None
                }
                Post::Flush => {
                    pending.controls = 0;
                    self.control.clear();
                    Some(std::mem::replace(&mut pending.list, VecDeque::from([event])))
                }
            };
            if is_control {
                pending.controls += 1;
                self.control.set();
            }
            self.signal.set();
            stale
        };
        // Dropping flushed packets returns them to their pools, which must not happen under the
        // queue lock.
        drop(stale);
    }

    pub fn pop(&self) -> Option<Event> {
        let mut pending = self.lock();
        self.take_front(&mut pending)
    }

    /// Block until an event is available.
    pub fn wait(&self) -> Event {
        loop {
            if let Some(event) = self.pop() {
                return event;
            }
            self.signal.wait();
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.pop() {
                return Some(event);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.signal.wait_timeout(left) {
                return self.pop();
            }
        }
    }

    /// Pop the head unless its kind is one of `kinds`.
    pub fn pop_if_not(&self, kinds: &[EventKind]) -> Option<Event> {
        let mut pending = self.lock();
        match pending.list.front() {
            Some(head) if !kinds.contains(&head.kind()) => self.take_front(&mut pending),
            _ => None,
        }
    }

    /// True when the head exists and its kind is not one of `kinds`.
    pub fn peek_if_not(&self, kinds: &[EventKind]) -> bool {
        self.lock()
            .list
            .front()
            .is_some_and(|head| !kinds.contains(&head.kind()))
    }

    pub fn head_kind(&self) -> Option<EventKind> {
        self.lock().list.front().map(Event::kind)
    }

    /// True when a control event is waiting at the head of the queue.
    ///
    /// Long running producers poll this to bail out before they would block.
    pub fn check_abort(&self) -> bool {
        self.head_kind().is_some_and(EventKind::is_control)
    }

    pub fn len(&self) -> usize {
        self.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().list.is_empty()
    }
}

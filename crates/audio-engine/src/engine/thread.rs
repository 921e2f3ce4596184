//! One named OS thread paired with the event queue it consumes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::event::{Event, Notification};
use crate::queue::{EventQueue, Post};

pub struct EngineThread {
    name: String,
    fifo: Arc<EventQueue>,
    handle: Option<JoinHandle<()>>,
}

impl EngineThread {
    /// Start `body` on a new thread called `name`. The body owns the consuming side of `fifo`.
    pub fn spawn<F>(name: &str, fifo: Arc<EventQueue>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .with_context(|| format!("spawn {name} thread"))?;
        tracing::debug!(thread = name, "engine thread started");
        Ok(Self {
            name: name.to_string(),
            fifo,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fifo(&self) -> &Arc<EventQueue> {
        &self.fifo
    }

    pub fn post(&self, event: Event, mode: Post) {
        self.fifo.post(event, mode);
    }

    /// Wait for the thread to finish. Returns `false` if it panicked.
    pub fn join(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match handle.join() {
            Ok(()) => {
                tracing::debug!(thread = %self.name, "engine thread stopped");
                true
            }
            Err(_) => {
                tracing::error!(thread = %self.name, "engine thread panicked");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Sending side of the engine's notification channel.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Notification>,
}

impl Notifier {
    pub fn new(tx: Sender<Notification>) -> Self {
        Self { tx }
    }

    pub fn send(&self, notification: Notification) {
        // The front end may have stopped listening; the engine keeps running regardless.
        let _ = self.tx.send(notification);
    }

    /// Report a fatal condition. Each stage calls this exactly once per failure.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(error = %message, "engine error");
        self.send(Notification::Error(message));
    }
}

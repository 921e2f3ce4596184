//! Input stage: byte source plus demuxer, feeding the decoder stage.
//!
//! States:
//! - `Idle`: no stream is being read; the thread sleeps on its queue
//! - `Processing`: one input packet per loop iteration is filled by the demuxer
//! - `Error`: the last stream failed; behaves like `Idle` until the next `Open`
//!
//! Control events reach this stage at the front of its queue. Whatever the stage tells the
//! decoder to throw away is posted with [`Post::Flush`].

use std::sync::Arc;

use crate::demux::{Demuxer, ReadStatus, ReaderContext, open_demuxer};
use crate::engine::thread::Notifier;
use crate::event::{Event, Notification};
use crate::format::ContainerFormat;
use crate::packet::PacketPool;
use crate::queue::{EventQueue, Post};
use crate::source::{ByteSource, ByteSourceExt, SourceRegistry, Whence};

/// Bytes read up front to guess the container format.
const PROBE_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputState {
    Idle,
    Processing,
    Error,
}

pub(crate) struct InputStage {
    fifo: Arc<EventQueue>,
    decoder: Arc<EventQueue>,
    pool: PacketPool,
    sources: SourceRegistry,
    notify: Notifier,
    state: InputState,
    url: String,
    source: Option<Box<dyn ByteSource>>,
    reader: Option<Box<dyn Demuxer>>,
    stream: u32,
}

impl InputStage {
    pub(crate) fn new(
        fifo: Arc<EventQueue>,
        decoder: Arc<EventQueue>,
        pool: PacketPool,
        sources: SourceRegistry,
        notify: Notifier,
    ) -> Self {
        Self {
            fifo,
            decoder,
            pool,
            sources,
            notify,
            state: InputState::Idle,
            url: String::new(),
            source: None,
            reader: None,
            stream: 0,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            let event = if self.state == InputState::Processing {
                match self.fifo.pop() {
                    Some(event) => event,
                    None => {
                        self.step();
                        continue;
                    }
                }
            } else {
                self.fifo.wait()
            };
            if !self.handle(event) {
                break;
            }
        }
        tracing::debug!("input stage exiting");
    }

    fn set_state(&mut self, state: InputState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, stream = self.stream, "input state");
            self.state = state;
        }
    }

    /// Returns `false` once the stage must exit.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Open(url) => self.open(url, false),
            Event::OpenFlush(url) => self.open(url, true),
            Event::Seek(pos) => self.seek(pos),
            Event::Close => {
                self.close_input();
                self.decoder.post(Event::Flush { offset: 0, close: true }, Post::Flush);
                self.set_state(InputState::Idle);
            }
            Event::Quit => {
                self.close_input();
                self.decoder.post(Event::Quit, Post::Flush);
                return false;
            }
            Event::End { stream } => {
                // The output stage finished playing a stream.
                if stream == self.stream && self.state != InputState::Processing {
                    self.close_input();
                    self.set_state(InputState::Idle);
                }
            }
            Event::Eos => self.notify.send(Notification::Eos),
            other => tracing::debug!(kind = ?other.kind(), "input stage ignores event"),
        }
        true
    }

    /// Fill one input packet.
    fn step(&mut self) {
        // Any queued event, control or not, interrupts the wait for a free packet.
        let Some(packet) = self.pool.acquire(self.fifo.signal()) else {
            return;
        };
        let (Some(source), Some(reader)) = (self.source.as_deref_mut(), self.reader.as_mut()) else {
            self.set_state(InputState::Idle);
            return;
        };
        let mut ctx = ReaderContext {
            source,
            output: &self.decoder,
            control: &self.fifo,
            stream: self.stream,
        };
        match reader.process(&mut ctx, packet) {
            ReadStatus::Ok => {}
            ReadStatus::Done => {
                tracing::debug!(stream = self.stream, url = %self.url, "input stream done");
                self.set_state(InputState::Idle);
            }
            ReadStatus::Error(e) if e.is_interrupted() => {}
            ReadStatus::Error(e) => {
                tracing::warn!(stream = self.stream, url = %self.url, error = %e, "demux failed");
                self.fail_stream(format!("Error reading {}: {e}", self.url));
            }
        }
    }

    fn open(&mut self, url: String, flush: bool) {
        self.close_input();
        if flush {
            self.decoder.post(Event::Flush { offset: 0, close: false }, Post::Flush);
        }
        tracing::info!(url = %url, "opening input");

        let mut source = match self.sources.open(&url, self.fifo.control_signal()) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "source open failed");
                self.fail(format!("Unable to open {url}."));
                return;
            }
        };

        let format = match probe_format(source.as_mut(), &url) {
            Ok(format) => format,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "format probe failed");
                self.fail(format!("Unable to open {url}."));
                return;
            }
        };
        let Some(mut reader) = open_demuxer(format) else {
            self.fail(format!("No reader available for {format} format."));
            return;
        };

        self.stream = self.stream.wrapping_add(1);
        let mut ctx = ReaderContext {
            source: source.as_mut(),
            output: &self.decoder,
            control: &self.fifo,
            stream: self.stream,
        };
        if let Err(e) = reader.init(&mut ctx) {
            tracing::warn!(url = %url, format = %format, error = %e, "reader init failed");
            self.fail("Failed to initialize reader".to_string());
            return;
        }

        tracing::debug!(url = %url, format = %format, stream = self.stream, "input opened");
        self.url = url;
        self.source = Some(source);
        self.reader = Some(reader);
        self.set_state(InputState::Processing);
    }

    fn seek(&mut self, pos: f64) {
        let Some(reader) = self.reader.as_mut() else {
            tracing::debug!("seek without an open input");
            return;
        };
        if !reader.can_seek() {
            tracing::debug!(url = %self.url, "input is not seekable");
            return;
        }
        let Some(offset) = reader.seek_offset(pos.clamp(0.0, 1.0)) else {
            return;
        };
        self.decoder.post(Event::Flush { offset, close: false }, Post::Flush);

        let Some(source) = self.source.as_deref_mut() else {
            return;
        };
        let mut ctx = ReaderContext {
            source,
            output: &self.decoder,
            control: &self.fifo,
            stream: self.stream,
        };
        if reader.seek(&mut ctx, offset) {
            tracing::debug!(offset, stream = self.stream, "seek done");
            self.set_state(InputState::Processing);
        } else {
            self.fail_stream(format!("Unable to seek in {}.", self.url));
        }
    }

    fn close_input(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!(url = %self.url, stream = self.stream, "input closed");
        }
        self.source = None;
    }

    /// Failure before a stream was handed downstream.
    fn fail(&mut self, message: String) {
        self.close_input();
        self.notify.error(message);
        self.set_state(InputState::Error);
    }

    /// Failure of a stream the downstream stages already know about.
    fn fail_stream(&mut self, message: String) {
        self.fail(message);
        self.decoder.post(Event::Flush { offset: 0, close: true }, Post::Flush);
    }
}

/// Guess the container from the first bytes, falling back to the source hint and the URL.
fn probe_format(source: &mut dyn ByteSource, url: &str) -> Result<ContainerFormat, crate::error::SourceError> {
    if !source.serial() {
        let mut head = [0u8; PROBE_BYTES];
        let n = source.read_full(&mut head)?;
        source.position(0, Whence::Begin)?;
        let probed = ContainerFormat::probe(&head[..n]);
        if probed != ContainerFormat::Unknown {
            return Ok(probed);
        }
    }
    Ok(match source.format_hint() {
        ContainerFormat::Unknown => ContainerFormat::from_path(url),
        hint => hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use std::io::Cursor;
    use std::thread;
    use std::time::Duration;

    use crate::source::StreamSource;

    fn stage(sources: SourceRegistry) -> (Arc<EventQueue>, Arc<EventQueue>, Receiver<Notification>, InputStage) {
        let fifo = Arc::new(EventQueue::new());
        let decoder = Arc::new(EventQueue::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let stage = InputStage::new(fifo.clone(), decoder.clone(), PacketPool::new(64, 2), sources, Notifier::new(tx));
        (fifo, decoder, rx, stage)
    }

    #[test]
    fn missing_source_reports_one_error() {
        let (fifo, decoder, rx, stage) = stage(SourceRegistry::new());
        fifo.post(Event::Open("/nonexistent/track.mka".into()), Post::Back);
        fifo.post(Event::Quit, Post::Back);
        stage.run();

        let errors: Vec<_> = rx.try_iter().collect();
        assert_eq!(errors, vec![Notification::Error("Unable to open /nonexistent/track.mka.".into())]);
        assert!(matches!(decoder.pop(), Some(Event::Quit)));
    }

    #[test]
    fn unknown_container_is_rejected() {
        let mut sources = SourceRegistry::new();
        sources.register(
            "mem",
            Arc::new(|_: &str, _: &crate::signal::Signal| -> Result<Box<dyn ByteSource>, crate::error::SourceError> {
                Ok(Box::new(StreamSource::new(Cursor::new(vec![0u8; 128]))))
            }),
        );
        let (fifo, _decoder, rx, stage) = stage(sources);
        fifo.post(Event::Open("mem://noise.bin".into()), Post::Back);
        fifo.post(Event::Quit, Post::Back);
        stage.run();
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![Notification::Error("No reader available for unknown format.".into())]
        );
    }

    #[test]
    fn close_flushes_decoder_and_eos_is_reported() {
        let (fifo, decoder, rx, stage) = stage(SourceRegistry::new());
        let handle = thread::spawn(move || stage.run());
        fifo.post(Event::Eos, Post::Back);
        fifo.post(Event::Close, Post::Front);
        thread::sleep(Duration::from_millis(20));
        fifo.post(Event::Quit, Post::Front);
        handle.join().unwrap();

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Notification::Eos]);
        // Quit replaced the flush that Close posted.
        assert!(matches!(decoder.pop(), Some(Event::Quit)));
        assert!(decoder.is_empty());
    }
}

//! Decoder stage: compressed packets in, PCM packets out.
//!
//! Holds at most one decoder, keyed by codec. A decoder error is fatal to the stream: the
//! decoder is dropped, the input stage is asked to close, and packets of the failed stream are
//! discarded until the next `Configure`.

use std::sync::Arc;

use crate::decode::{Decoder, DecoderContext, DecoderRegistry, DecoderStatus};
use crate::engine::thread::Notifier;
use crate::event::{ConfigureEvent, Event};
use crate::packet::{Packet, PacketPool};
use crate::queue::{EventQueue, Post};

pub(crate) struct DecoderStage {
    fifo: Arc<EventQueue>,
    input: Arc<EventQueue>,
    output: Arc<EventQueue>,
    pool: PacketPool,
    registry: DecoderRegistry,
    notify: Notifier,
    decoder: Option<Box<dyn Decoder>>,
    stream: u32,
    /// Set after a fatal error until the next stream is configured.
    failed: bool,
}

impl DecoderStage {
    pub(crate) fn new(
        fifo: Arc<EventQueue>,
        input: Arc<EventQueue>,
        output: Arc<EventQueue>,
        pool: PacketPool,
        registry: DecoderRegistry,
        notify: Notifier,
    ) -> Self {
        Self {
            fifo,
            input,
            output,
            pool,
            registry,
            notify,
            decoder: None,
            stream: 0,
            failed: false,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            self.resume_pending();
            let event = self.fifo.wait();
            if !self.handle(event) {
                break;
            }
        }
        tracing::debug!("decoder stage exiting");
    }

    /// Finish output an earlier call left behind, unless a command must be served first.
    fn resume_pending(&mut self) {
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };
        if !decoder.has_pending() || self.fifo.check_abort() {
            return;
        }
        let ctx = DecoderContext {
            pool: &self.pool,
            fifo: &self.fifo,
            output: &self.output,
            stream: self.stream,
        };
        if let DecoderStatus::Error(e) = decoder.resume(&ctx) {
            self.fatal(format!("Fatal decoder error: {e}"));
        }
    }

    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Configure(cfg) => self.configure(cfg),
            Event::Meta(meta) => self.output.post(Event::Meta(meta), Post::Back),
            Event::Buffer(packet) => self.decode(packet),
            Event::Flush { offset, close } => {
                if close {
                    self.decoder = None;
                } else if let Some(decoder) = self.decoder.as_mut() {
                    decoder.flush(offset);
                }
                self.output.post(Event::Flush { offset, close }, Post::Flush);
            }
            Event::End { stream } => self.output.post(Event::End { stream }, Post::Back),
            Event::Quit => {
                self.decoder = None;
                self.output.post(Event::Quit, Post::Flush);
                return false;
            }
            other => tracing::debug!(kind = ?other.kind(), "decoder stage ignores event"),
        }
        true
    }

    fn configure(&mut self, mut cfg: ConfigureEvent) {
        self.failed = false;
        let reuse = self.decoder.as_ref().is_some_and(|d| d.codec() == cfg.codec);
        if !reuse {
            self.decoder = self.registry.create(cfg.codec);
        }
        let Some(decoder) = self.decoder.as_mut() else {
            self.abort_stream(format!("No decoder available for {}.", cfg.codec));
            return;
        };
        let input_af = cfg.af;
        if !decoder.init(&mut cfg) {
            self.decoder = None;
            self.abort_stream(format!("Failed to initialize {} decoder.", cfg.codec));
            return;
        }
        tracing::debug!(codec = %cfg.codec, input = %input_af, output = %cfg.af, reused = reuse, "decoder configured");
        self.output.post(Event::Configure(cfg), Post::Back);
    }

    fn decode(&mut self, packet: Packet) {
        if self.failed {
            return;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            tracing::debug!(stream = packet.stream, "packet without decoder dropped");
            return;
        };
        self.stream = packet.stream;
        let ctx = DecoderContext {
            pool: &self.pool,
            fifo: &self.fifo,
            output: &self.output,
            stream: self.stream,
        };
        match decoder.process(&ctx, packet) {
            DecoderStatus::Ok | DecoderStatus::Interrupted => {}
            DecoderStatus::Done => tracing::debug!(stream = self.stream, "decoder done"),
            DecoderStatus::Error(e) => self.fatal(format!("Fatal decoder error: {e}")),
        }
    }

    fn fatal(&mut self, message: String) {
        self.decoder = None;
        self.abort_stream(message);
    }

    /// Stop the current stream: ask the input stage to close and report once.
    fn abort_stream(&mut self, message: String) {
        self.failed = true;
        self.input.post(Event::Close, Post::Front);
        self.notify.error(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::event::{EventKind, Notification};
    use crate::format::{AudioFormat, Codec, sample};

    struct Broken;

    impl Decoder for Broken {
        fn codec(&self) -> Codec {
            Codec::Pcm
        }
        fn init(&mut self, _cfg: &mut ConfigureEvent) -> bool {
            true
        }
        fn process(&mut self, _ctx: &DecoderContext<'_>, _packet: Packet) -> DecoderStatus {
            DecoderStatus::Error(DecodeError::Corrupt("bad frame".into()))
        }
        fn resume(&mut self, _ctx: &DecoderContext<'_>) -> DecoderStatus {
            DecoderStatus::Ok
        }
        fn has_pending(&self) -> bool {
            false
        }
        fn flush(&mut self, _offset: i64) {}
    }

    struct Harness {
        fifo: Arc<EventQueue>,
        input: Arc<EventQueue>,
        output: Arc<EventQueue>,
        notes: crossbeam_channel::Receiver<Notification>,
        stage: DecoderStage,
    }

    fn harness(registry: DecoderRegistry) -> Harness {
        let (fifo, input, output) = (
            Arc::new(EventQueue::new()),
            Arc::new(EventQueue::new()),
            Arc::new(EventQueue::new()),
        );
        let (tx, notes) = crossbeam_channel::unbounded();
        let stage = DecoderStage::new(
            fifo.clone(),
            input.clone(),
            output.clone(),
            PacketPool::new(256, 4),
            registry,
            Notifier::new(tx),
        );
        Harness {
            fifo,
            input,
            output,
            notes,
            stage,
        }
    }

    fn pcm_configure() -> Event {
        Event::Configure(ConfigureEvent::new(Codec::Pcm, AudioFormat::new(sample::S16, 44_100, 2)))
    }

    fn drain_kinds(q: &EventQueue) -> Vec<EventKind> {
        std::iter::from_fn(|| q.pop()).map(|e| e.kind()).collect()
    }

    #[test]
    fn decode_error_closes_input_exactly_once() {
        let mut registry = DecoderRegistry::new();
        registry.register(Codec::Pcm, Arc::new(|_: Codec| -> Box<dyn Decoder> { Box::new(Broken) }));
        let h = harness(registry);

        let packets = PacketPool::new(16, 3);
        h.fifo.post(pcm_configure(), Post::Back);
        for _ in 0..3 {
            let mut p = packets.try_acquire().unwrap();
            p.append(&[0u8; 8]);
            h.fifo.post(Event::Buffer(p), Post::Back);
        }
        h.fifo.post(Event::Quit, Post::Back);
        h.stage.run();

        assert_eq!(drain_kinds(&h.input), vec![EventKind::Close]);
        let errors: Vec<_> = h.notes.try_iter().collect();
        assert_eq!(errors, vec![Notification::Error("Fatal decoder error: corrupt stream: bad frame".into())]);
        assert_eq!(packets.available(), 3);
    }

    #[test]
    fn unknown_codec_reports_and_closes() {
        let h = harness(DecoderRegistry::new());
        h.fifo.post(pcm_configure(), Post::Back);
        h.fifo.post(Event::End { stream: 1 }, Post::Back);
        h.fifo.post(Event::Quit, Post::Back);
        h.stage.run();

        assert_eq!(drain_kinds(&h.input), vec![EventKind::Close]);
        assert_eq!(
            h.notes.try_iter().collect::<Vec<_>>(),
            vec![Notification::Error("No decoder available for PCM.".into())]
        );
        assert_eq!(drain_kinds(&h.output), vec![EventKind::Quit]);
    }

    #[test]
    fn pcm_stream_reaches_output_in_order() {
        let h = harness(DecoderRegistry::with_defaults());
        let packets = PacketPool::new(16, 1);
        let mut p = packets.try_acquire().unwrap();
        p.append(&[1, 0, 2, 0, 3, 0, 4, 0]);
        p.stream = 1;
        p.stream_position = 0;

        h.fifo.post(pcm_configure(), Post::Back);
        h.fifo.post(Event::Buffer(p), Post::Back);
        h.fifo.post(Event::End { stream: 1 }, Post::Back);
        let stage = h.stage;
        let handle = std::thread::spawn(move || stage.run());

        let mut kinds = Vec::new();
        while kinds.len() < 3 {
            if let Some(event) = h.output.wait_timeout(std::time::Duration::from_secs(2)) {
                if let Event::Buffer(out) = &event {
                    assert_eq!(out.size(), 8);
                    assert_eq!(out.stream, 1);
                }
                kinds.push(event.kind());
            } else {
                break;
            }
        }
        h.fifo.post(Event::Quit, Post::Front);
        handle.join().unwrap();
        assert_eq!(kinds, vec![EventKind::Configure, EventKind::Buffer, EventKind::End]);
        assert!(h.input.is_empty());
    }
}

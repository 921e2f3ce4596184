//! Decoder stage plugins.
//!
//! A [`Decoder`] turns compressed packets from the input pool into PCM packets taken from the
//! decoder stage's own pool. Decoders never allocate packets themselves; they ask the
//! [`DecoderContext`] for one, which may refuse when a command is waiting so the stage can
//! service it.
//!
//! Built in:
//! - [`PcmDecoder`]: pass-through with byte order normalisation
//! - [`SymphoniaDecoder`]: FLAC, Vorbis, AAC, MP3 and ALAC via Symphonia, decoding to `f32`

mod bridge;
mod pcm;

pub use bridge::SymphoniaDecoder;
pub use pcm::PcmDecoder;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DecodeError;
use crate::event::{ConfigureEvent, Event};
use crate::format::{AudioFormat, Codec};
use crate::packet::{Packet, PacketPool};
use crate::queue::{EventQueue, Post};

/// How long a decoder waits for an output packet before re-checking its queue.
const OUTPUT_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub enum DecoderStatus {
    Ok,
    /// The decoder will not produce anything more for this stream.
    Done,
    /// Fatal for the stream.
    Error(DecodeError),
    /// Output was cut short by a pending command; the rest is kept for [`Decoder::resume`].
    Interrupted,
}

/// What a decoder needs from the decoder stage while it runs.
pub struct DecoderContext<'a> {
    /// Pool PCM packets are taken from.
    pub pool: &'a PacketPool,
    /// Decoder stage queue, polled for pending commands.
    pub fifo: &'a EventQueue,
    /// Output stage queue.
    pub output: &'a EventQueue,
    pub stream: u32,
}

impl DecoderContext<'_> {
    /// True when a command or flush at the head of the decoder queue must be handled first.
    pub fn aborted(&self) -> bool {
        self.fifo.check_abort()
    }

    /// Take an empty packet from the output pool.
    ///
    /// Waits while the pool is exhausted. Returns `None` as soon as a command or flush is at the
    /// head of the decoder queue.
    pub fn get_output_packet(&self) -> Option<Packet> {
        let control = self.fifo.control_signal();
        loop {
            if self.aborted() {
                return None;
            }
            // A command queued behind data keeps the control signal raised without being
            // serviceable yet, so poll instead of spinning on it.
            let packet = if control.is_set() {
                self.pool.acquire_timeout(OUTPUT_RETRY)
            } else {
                self.pool.acquire(control)
            };
            if packet.is_some() {
                return packet;
            }
        }
    }

    pub fn post(&self, event: Event) {
        self.output.post(event, Post::Back);
    }
}

pub trait Decoder: Send {
    fn codec(&self) -> Codec;

    /// Set up for a new stream. On success `cfg.af` is rewritten to the format the decoder
    /// produces.
    fn init(&mut self, cfg: &mut ConfigureEvent) -> bool;

    /// Decode `packet` and post the resulting PCM packets to the output stage.
    fn process(&mut self, ctx: &DecoderContext<'_>, packet: Packet) -> DecoderStatus;

    /// Write out output held back by an earlier [`DecoderStatus::Interrupted`].
    fn resume(&mut self, ctx: &DecoderContext<'_>) -> DecoderStatus;

    /// True while interrupted output is waiting for [`Decoder::resume`].
    fn has_pending(&self) -> bool;

    /// Drop decoder state after a seek. Frames before `offset` are discarded.
    fn flush(&mut self, offset: i64);
}

/// Decoded PCM waiting to be cut into output packets.
///
/// Tracks the frame position of its first byte so output packets carry positions, and drops
/// frames that fall before a seek target or inside the stream's lead-in.
#[derive(Debug, Default)]
pub(crate) struct PendingOutput {
    af: AudioFormat,
    data: Vec<u8>,
    cursor: usize,
    position: i64,
    length: i64,
    eos: bool,
    skip_until: i64,
    lead_in: u64,
    /// Stream setup to post ahead of the next output packet after a format change.
    announce: Option<ConfigureEvent>,
}

impl PendingOutput {
    pub(crate) fn reset(&mut self, af: AudioFormat, length: i64, lead_in: u64) {
        *self = PendingOutput {
            af,
            length,
            lead_in,
            skip_until: -1,
            position: -1,
            ..PendingOutput::default()
        };
    }

    pub(crate) fn format(&self) -> AudioFormat {
        self.af
    }

    /// Switch to the format in `cfg` for everything pushed from now on. `cfg` reaches the
    /// output stage ahead of the first packet in the new format. Only call while empty.
    pub(crate) fn reformat(&mut self, cfg: ConfigureEvent) {
        self.af = cfg.af;
        self.announce = Some(cfg);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cursor >= self.data.len()
    }

    pub(crate) fn clear(&mut self, skip_until: i64) {
        self.data.clear();
        self.cursor = 0;
        self.eos = false;
        self.position = -1;
        self.skip_until = skip_until;
    }

    /// Queue decoded bytes that start at frame `position` (-1 when unknown).
    pub(crate) fn push(&mut self, mut bytes: &[u8], position: i64, eos: bool) {
        let frame = self.af.frame_size().max(1);
        let mut position = position;
        if self.lead_in > 0 {
            let frames = (bytes.len() / frame) as u64;
            let drop = frames.min(self.lead_in);
            self.lead_in -= drop;
            bytes = &bytes[drop as usize * frame..];
        }
        if self.skip_until >= 0 && position >= 0 {
            let frames = (bytes.len() / frame) as i64;
            let drop = (self.skip_until - position).clamp(0, frames);
            bytes = &bytes[drop as usize * frame..];
            position += drop;
            if drop < frames {
                self.skip_until = -1;
            }
        }
        if self.is_empty() {
            self.data.clear();
            self.cursor = 0;
            self.position = position;
        }
        self.data.extend_from_slice(bytes);
        self.eos |= eos;
    }

    /// Cut queued bytes into output packets and post them.
    pub(crate) fn write(&mut self, ctx: &DecoderContext<'_>) -> DecoderStatus {
        if !self.is_empty() {
            if let Some(cfg) = self.announce.take() {
                ctx.post(Event::Configure(cfg));
            }
        }
        let frame = self.af.frame_size().max(1);
        while !self.is_empty() {
            let Some(mut out) = ctx.get_output_packet() else {
                return DecoderStatus::Interrupted;
            };
            let remaining = self.data.len() - self.cursor;
            let room = (out.capacity() / frame).max(1) * frame;
            let n = remaining.min(room);
            out.append(&self.data[self.cursor..self.cursor + n]);
            out.af = self.af;
            out.stream = ctx.stream;
            out.stream_position = self.position;
            out.stream_length = self.length;
            self.cursor += n;
            if self.position >= 0 {
                self.position += (n / frame) as i64;
            }
            if self.is_empty() && self.eos {
                out.set_eos();
                self.eos = false;
            }
            ctx.post(Event::Buffer(out));
        }
        self.data.clear();
        self.cursor = 0;
        DecoderStatus::Ok
    }
}

pub type DecoderFactory = Arc<dyn Fn(Codec) -> Box<dyn Decoder> + Send + Sync>;

/// Decoder factories keyed by codec.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: HashMap<Codec, DecoderFactory>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the PCM pass-through and the Symphonia codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Codec::Pcm, Arc::new(|_: Codec| -> Box<dyn Decoder> { Box::new(PcmDecoder::new()) }));
        let symphonia: DecoderFactory =
            Arc::new(|codec: Codec| -> Box<dyn Decoder> { Box::new(SymphoniaDecoder::new(codec)) });
        for codec in SymphoniaDecoder::CODECS {
            registry.register(*codec, symphonia.clone());
        }
        registry
    }

    pub fn register(&mut self, codec: Codec, factory: DecoderFactory) {
        self.factories.insert(codec, factory);
    }

    pub fn create(&self, codec: Codec) -> Option<Box<dyn Decoder>> {
        self.factories.get(&codec).map(|factory| factory(codec))
    }

    pub fn supports(&self, codec: Codec) -> bool {
        self.factories.contains_key(&codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::sample;

    fn context<'a>(pool: &'a PacketPool, fifo: &'a EventQueue, output: &'a EventQueue) -> DecoderContext<'a> {
        DecoderContext {
            pool,
            fifo,
            output,
            stream: 3,
        }
    }

    #[test]
    fn pending_output_splits_on_packet_capacity() {
        let pool = PacketPool::new(8, 4);
        let (fifo, output) = (EventQueue::new(), EventQueue::new());
        let ctx = context(&pool, &fifo, &output);
        let mut pending = PendingOutput::default();
        pending.reset(AudioFormat::new(sample::S16, 44_100, 2), 100, 0);
        pending.push(&[1u8; 20], 10, true);
        assert!(matches!(pending.write(&ctx), DecoderStatus::Ok));

        let mut positions = Vec::new();
        while let Some(Event::Buffer(p)) = output.pop() {
            positions.push((p.stream_position, p.size(), p.is_eos(), p.stream));
        }
        assert_eq!(positions, vec![(10, 8, false, 3), (12, 8, false, 3), (14, 4, true, 3)]);
    }

    #[test]
    fn skip_and_lead_in_drop_frames() {
        let mut pending = PendingOutput::default();
        pending.reset(AudioFormat::new(sample::S16, 44_100, 1), -1, 2);
        pending.push(&[0, 0, 1, 1, 2, 2], 0, false);
        assert_eq!(pending.data, vec![2, 2]);

        pending.clear(5);
        pending.push(&[3, 3, 4, 4, 5, 5, 6, 6], 3, false);
        assert_eq!(pending.data, vec![5, 5, 6, 6]);
        assert_eq!(pending.position, 5);
    }

    #[test]
    fn format_change_is_announced_before_its_pcm() {
        let pool = PacketPool::new(64, 2);
        let (fifo, output) = (EventQueue::new(), EventQueue::new());
        let ctx = context(&pool, &fifo, &output);
        let mut pending = PendingOutput::default();
        pending.reset(AudioFormat::new(sample::FLOAT, 44_100, 2), -1, 0);

        let mono = AudioFormat::new(sample::FLOAT, 22_050, 1);
        pending.reformat(ConfigureEvent::new(Codec::Mpeg, mono));
        pending.push(&[0u8; 16], 0, false);
        assert!(matches!(pending.write(&ctx), DecoderStatus::Ok));

        let Some(Event::Configure(cfg)) = output.pop() else {
            panic!("expected the new format first");
        };
        assert_eq!(cfg.af, mono);
        let Some(Event::Buffer(p)) = output.pop() else {
            panic!("expected pcm after the new format");
        };
        assert_eq!(p.af, mono);
        assert_eq!(p.size(), 16);

        // Announced once only.
        pending.push(&[0u8; 8], 4, false);
        assert!(matches!(pending.write(&ctx), DecoderStatus::Ok));
        assert!(matches!(output.pop(), Some(Event::Buffer(_))));
        assert!(output.is_empty());
    }

    #[test]
    fn output_packet_refused_while_command_pending() {
        let pool = PacketPool::new(8, 1);
        let (fifo, output) = (EventQueue::new(), EventQueue::new());
        let ctx = context(&pool, &fifo, &output);
        fifo.post(Event::Flush { offset: 0, close: false }, Post::Flush);
        assert!(ctx.get_output_packet().is_none());
        fifo.pop();
        assert!(ctx.get_output_packet().is_some());
    }

    #[test]
    fn interrupted_write_keeps_the_rest() {
        let pool = PacketPool::new(4, 1);
        let (fifo, output) = (EventQueue::new(), EventQueue::new());
        let ctx = context(&pool, &fifo, &output);
        let mut pending = PendingOutput::default();
        pending.reset(AudioFormat::new(sample::S16, 8_000, 1), -1, 0);
        pending.push(&[7u8; 8], 0, false);

        // The only packet stays queued downstream, then a command arrives.
        let writer = std::thread::scope(|s| {
            let h = s.spawn(|| pending.write(&ctx));
            std::thread::sleep(Duration::from_millis(30));
            fifo.post(Event::Quit, Post::Front);
            h.join().unwrap()
        });
        assert!(matches!(writer, DecoderStatus::Interrupted));
        assert!(!pending.is_empty());
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn registry_knows_builtin_codecs() {
        let registry = DecoderRegistry::with_defaults();
        assert!(registry.supports(Codec::Pcm));
        assert!(registry.supports(Codec::Flac));
        assert!(!registry.supports(Codec::Opus));
        assert_eq!(registry.create(Codec::Vorbis).unwrap().codec(), Codec::Vorbis);
    }
}

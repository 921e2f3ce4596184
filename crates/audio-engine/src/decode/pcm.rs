use crate::decode::{Decoder, DecoderContext, DecoderStatus, PendingOutput};
use crate::event::ConfigureEvent;
use crate::format::{AudioFormat, Codec, SampleType};
use crate::packet::Packet;

/// Raw PCM pass-through.
///
/// Samples are copied unchanged except for byte order, which is normalised to native so the
/// output stage only ever converts between encodings.
#[derive(Default)]
pub struct PcmDecoder {
    input: AudioFormat,
    out: PendingOutput,
    scratch: Vec<u8>,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

fn swap_in_place(data: &mut [u8], width: usize) {
    if width > 1 {
        for sample in data.chunks_exact_mut(width) {
            sample.reverse();
        }
    }
}

impl Decoder for PcmDecoder {
    fn codec(&self) -> Codec {
        Codec::Pcm
    }

    fn init(&mut self, cfg: &mut ConfigureEvent) -> bool {
        let af = cfg.af;
        if af.is_undefined() || af.sample_type() == SampleType::Iec958 {
            tracing::warn!(format = %af, "pcm decoder cannot handle format");
            return false;
        }
        self.input = af;
        let mut native = af;
        if !native.is_native_order() {
            native.swap();
        }
        self.out.reset(native, cfg.stream_length, cfg.stream_offset_start);
        cfg.af = native;
        tracing::debug!(input = %af, output = %native, "pcm decoder configured");
        true
    }

    fn process(&mut self, ctx: &DecoderContext<'_>, packet: Packet) -> DecoderStatus {
        let frame = self.input.frame_size().max(1);
        let whole = packet.size() / frame * frame;
        self.scratch.clear();
        self.scratch.extend_from_slice(&packet.data()[..whole]);
        if !self.input.is_native_order() {
            swap_in_place(&mut self.scratch, self.input.packing());
        }
        self.out.push(&self.scratch, packet.stream_position, packet.is_eos());
        drop(packet);
        self.out.write(ctx)
    }

    fn resume(&mut self, ctx: &DecoderContext<'_>) -> DecoderStatus {
        self.out.write(ctx)
    }

    fn has_pending(&self) -> bool {
        !self.out.is_empty()
    }

    fn flush(&mut self, offset: i64) {
        self.out.clear(offset);
    }
}

//! Symphonia codec bridge.
//!
//! Demuxing stays in this crate; only Symphonia's codec layer is used:
//! - codec parameters are rebuilt from the `Configure` event
//! - each packet is decoded on its own into interleaved `f32`
//! - recoverable decode errors skip the packet, anything else ends the stream

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{
    CODEC_TYPE_AAC, CODEC_TYPE_ALAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_NULL,
    CODEC_TYPE_VORBIS, CodecParameters, CodecType, DecoderOptions,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet as CodecPacket;

use crate::decode::{Decoder, DecoderContext, DecoderStatus, PendingOutput};
use crate::demux::lacing::{self, Lacing};
use crate::error::DecodeError;
use crate::event::ConfigureEvent;
use crate::format::{AudioFormat, Codec, sample};
use crate::packet::Packet;

pub struct SymphoniaDecoder {
    codec: Codec,
    inner: Option<Box<dyn symphonia::core::codecs::Decoder>>,
    samples: Option<SampleBuffer<f32>>,
    sample_frames: usize,
    out: PendingOutput,
    bytes: Vec<u8>,
    /// Setup of the current stream, re-announced when the decoded format changes.
    config: ConfigureEvent,
}

impl SymphoniaDecoder {
    pub const CODECS: &'static [Codec] = &[Codec::Flac, Codec::Vorbis, Codec::Aac, Codec::Mpeg, Codec::Alac];

    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            inner: None,
            samples: None,
            sample_frames: 0,
            out: PendingOutput::default(),
            bytes: Vec::new(),
            config: ConfigureEvent::default(),
        }
    }
}

fn codec_type(codec: Codec) -> CodecType {
    match codec {
        Codec::Flac => CODEC_TYPE_FLAC,
        Codec::Vorbis => CODEC_TYPE_VORBIS,
        Codec::Aac => CODEC_TYPE_AAC,
        Codec::Mpeg => CODEC_TYPE_MP3,
        Codec::Alac => CODEC_TYPE_ALAC,
        _ => CODEC_TYPE_NULL,
    }
}

fn channels_for(count: u8) -> Option<Channels> {
    if count == 0 || count > 8 {
        return None;
    }
    Some(Channels::from_bits_truncate((1u32 << count) - 1))
}

/// Rewrite container setup bytes into the form Symphonia's decoders expect.
///
/// - Vorbis: the three Xiph-laced header packets become identification + setup headers
/// - FLAC: a `fLaC` stream header is reduced to the STREAMINFO block body
fn extra_data(codec: Codec, blob: &[u8]) -> Result<Vec<u8>, DecodeError> {
    match codec {
        Codec::Vorbis => {
            let (sizes, header) = lacing::decode(Lacing::Xiph, blob)
                .map_err(|e| DecodeError::Unsupported(format!("vorbis headers: {e}")))?;
            if sizes.len() != 3 {
                return Err(DecodeError::Unsupported(format!("{} vorbis headers", sizes.len())));
            }
            let ident = &blob[header..header + sizes[0]];
            let setup = &blob[header + sizes[0] + sizes[1]..];
            Ok([ident, setup].concat())
        }
        Codec::Flac if blob.starts_with(b"fLaC") => blob
            .get(8..42)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| DecodeError::Unsupported("truncated STREAMINFO".into())),
        _ => Ok(blob.to_vec()),
    }
}

impl SymphoniaDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        let Some(inner) = self.inner.as_mut() else {
            return Err(DecodeError::Backend("decoder not initialised".into()));
        };
        let ts = packet.stream_position.max(0) as u64;
        let codec_packet = CodecPacket::new_from_slice(0, ts, 0, packet.data());
        let decoded = match inner.decode(&codec_packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(reason)) => {
                tracing::warn!(codec = %self.codec, reason, "skipping undecodable packet");
                return Ok(());
            }
            Err(SymphoniaError::ResetRequired) => {
                inner.reset();
                return Ok(());
            }
            Err(e) => return Err(DecodeError::Corrupt(e.to_string())),
        };
        if decoded.frames() == 0 {
            return Ok(());
        }

        let spec = *decoded.spec();
        let channels = spec.channels.count() as u8;
        let af = self.out.format();
        if spec.rate != af.rate || channels != af.channels {
            tracing::debug!(rate = spec.rate, channels, "decoded format differs from container");
            self.config.af = AudioFormat::new(sample::FLOAT, spec.rate, channels);
            self.out.reformat(self.config.clone());
        }

        if self.samples.is_none() || self.sample_frames < decoded.capacity() {
            self.sample_frames = decoded.capacity();
            self.samples = Some(SampleBuffer::<f32>::new(self.sample_frames as u64, spec));
        }
        if let Some(buf) = self.samples.as_mut() {
            buf.copy_interleaved_ref(decoded);
            self.bytes.clear();
            self.bytes.extend(buf.samples().iter().flat_map(|s| s.to_ne_bytes()));
        }
        Ok(())
    }
}

impl Decoder for SymphoniaDecoder {
    fn codec(&self) -> Codec {
        self.codec
    }

    fn init(&mut self, cfg: &mut ConfigureEvent) -> bool {
        let kind = codec_type(cfg.codec);
        if kind == CODEC_TYPE_NULL {
            return false;
        }
        let mut params = CodecParameters::new();
        params.for_codec(kind).with_sample_rate(cfg.af.rate);
        if let Some(channels) = channels_for(cfg.af.channels) {
            params.with_channels(channels);
        }
        if cfg.stream_length > 0 {
            params.with_n_frames(cfg.stream_length as u64);
        }
        if let Some(blob) = cfg.codec_data.as_deref() {
            match extra_data(cfg.codec, blob) {
                Ok(data) => {
                    params.with_extra_data(data.into_boxed_slice());
                }
                Err(e) => {
                    tracing::warn!(codec = %cfg.codec, error = %e, "bad codec setup data");
                    return false;
                }
            }
        }

        match symphonia::default::get_codecs().make(&params, &DecoderOptions::default()) {
            Ok(inner) => self.inner = Some(inner),
            Err(e) => {
                tracing::warn!(codec = %cfg.codec, error = %e, "symphonia rejected codec");
                return false;
            }
        }
        self.codec = cfg.codec;
        self.samples = None;
        self.sample_frames = 0;
        let af = AudioFormat::new(sample::FLOAT, cfg.af.rate, cfg.af.channels);
        self.out.reset(af, cfg.stream_length, cfg.stream_offset_start);
        cfg.af = af;
        self.config = ConfigureEvent {
            codec_data: None,
            ..cfg.clone()
        };
        tracing::debug!(codec = %self.codec, format = %af, "symphonia decoder configured");
        true
    }

    fn process(&mut self, ctx: &DecoderContext<'_>, packet: Packet) -> DecoderStatus {
        if let Err(e) = self.decode(&packet) {
            return DecoderStatus::Error(e);
        }
        if !self.bytes.is_empty() {
            self.out.push(&self.bytes, packet.stream_position, packet.is_eos());
            self.bytes.clear();
        }
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
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
        self.out.clear(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_types_map_known_codecs() {
        assert_eq!(codec_type(Codec::Flac), CODEC_TYPE_FLAC);
        assert_eq!(codec_type(Codec::Mpeg), CODEC_TYPE_MP3);
        assert_eq!(codec_type(Codec::Opus), CODEC_TYPE_NULL);
    }

    #[test]
    fn channels_cover_count() {
        assert_eq!(channels_for(2).unwrap().count(), 2);
        assert_eq!(channels_for(6).unwrap().count(), 6);
        assert!(channels_for(0).is_none());
    }

    #[test]
    fn vorbis_headers_drop_comment_packet() {
        let headers: [&[u8]; 3] = [b"IDENT", b"COMMENTS", b"SETUP"];
        let sizes: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        let mut blob = lacing::encode(Lacing::Xiph, &sizes);
        for h in headers {
            blob.extend_from_slice(h);
        }
        assert_eq!(extra_data(Codec::Vorbis, &blob).unwrap(), b"IDENTSETUP");
    }

    #[test]
    fn flac_stream_header_is_stripped() {
        let mut blob = b"fLaC".to_vec();
        blob.extend([0x80, 0, 0, 34]);
        blob.extend(0u8..34);
        blob.extend([1, 2, 3]);
        let info = extra_data(Codec::Flac, &blob).unwrap();
        assert_eq!(info, (0u8..34).collect::<Vec<_>>());
    }

    #[test]
    fn init_rejects_codecs_without_backend() {
        let mut dec = SymphoniaDecoder::new(Codec::Opus);
        let mut cfg = ConfigureEvent::new(Codec::Opus, AudioFormat::new(sample::FLOAT, 48_000, 2));
        assert!(!dec.init(&mut cfg));
    }
}

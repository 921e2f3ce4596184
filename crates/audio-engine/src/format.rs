//! Audio format descriptors, codec ids and container detection.
//!
//! An [`AudioFormat`] packs the sample encoding into a 16-bit descriptor:
//! - bits 0..3: sample type ([`SampleType`])
//! - bit 3: byte order (0 = little endian, 1 = big endian)
//! - bits 8..13: bits per sample minus one
//! - bits 13..16: bytes per sample minus one
//!
//! Format equality (including rate, channel count and channel map) is what the output stage
//! uses to decide whether a device has to be reconfigured.

use std::fmt;

use serde::{Deserialize, Serialize};

const TYPE_MASK: u16 = 0x7;
const ORDER_SHIFT: u16 = 3;
const BITS_SHIFT: u16 = 8;
const BITS_MASK: u16 = 0x1f;
const PACK_SHIFT: u16 = 13;
const PACK_MASK: u16 = 0x7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Signed = 0,
    Unsigned = 1,
    Float = 2,
    Iec958 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little = 0,
    Big = 1,
}

impl ByteOrder {
    pub const NATIVE: ByteOrder = if cfg!(target_endian = "big") {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    };
}

const fn descriptor(kind: SampleType, order: ByteOrder, bits: u16, pack: u16) -> u16 {
    (kind as u16) | ((order as u16) << ORDER_SHIFT) | ((bits - 1) << BITS_SHIFT) | ((pack - 1) << PACK_SHIFT)
}

/// Named sample encodings. Unsuffixed names are native endian.
pub mod sample {
    use super::{ByteOrder, SampleType, descriptor};

    const N: ByteOrder = ByteOrder::NATIVE;

    pub const UNKNOWN: u16 = 0;
    pub const S8: u16 = descriptor(SampleType::Signed, N, 8, 1);
    pub const U8: u16 = descriptor(SampleType::Unsigned, N, 8, 1);
    pub const S16: u16 = descriptor(SampleType::Signed, N, 16, 2);
    pub const S16_LE: u16 = descriptor(SampleType::Signed, ByteOrder::Little, 16, 2);
    pub const S16_BE: u16 = descriptor(SampleType::Signed, ByteOrder::Big, 16, 2);
    /// 24-bit samples in 4-byte containers.
    pub const S24: u16 = descriptor(SampleType::Signed, N, 24, 4);
    pub const S24_LE: u16 = descriptor(SampleType::Signed, ByteOrder::Little, 24, 4);
    /// 24-bit samples packed into 3 bytes.
    pub const S24_3: u16 = descriptor(SampleType::Signed, N, 24, 3);
    pub const S24_3LE: u16 = descriptor(SampleType::Signed, ByteOrder::Little, 24, 3);
    pub const S24_3BE: u16 = descriptor(SampleType::Signed, ByteOrder::Big, 24, 3);
    pub const S32: u16 = descriptor(SampleType::Signed, N, 32, 4);
    pub const S32_LE: u16 = descriptor(SampleType::Signed, ByteOrder::Little, 32, 4);
    pub const S32_BE: u16 = descriptor(SampleType::Signed, ByteOrder::Big, 32, 4);
    pub const FLOAT: u16 = descriptor(SampleType::Float, N, 32, 4);
    pub const FLOAT_LE: u16 = descriptor(SampleType::Float, ByteOrder::Little, 32, 4);
    pub const FLOAT_BE: u16 = descriptor(SampleType::Float, ByteOrder::Big, 32, 4);
}

/// Speaker roles stored 4 bits per channel in [`AudioFormat::channelmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Na = 0,
    Mono = 1,
    FrontLeft = 2,
    FrontRight = 3,
    FrontCenter = 4,
    BackLeft = 5,
    BackRight = 6,
    BackCenter = 7,
    SideLeft = 8,
    SideRight = 9,
    Lfe = 10,
}

impl Channel {
    fn from_bits(bits: u32) -> Channel {
        match bits {
            1 => Channel::Mono,
            2 => Channel::FrontLeft,
            3 => Channel::FrontRight,
            4 => Channel::FrontCenter,
            5 => Channel::BackLeft,
            6 => Channel::BackRight,
            7 => Channel::BackCenter,
            8 => Channel::SideLeft,
            9 => Channel::SideRight,
            10 => Channel::Lfe,
            _ => Channel::Na,
        }
    }
}

pub const CHANNELMAP_MONO: u32 = Channel::Mono as u32;
pub const CHANNELMAP_STEREO: u32 = (Channel::FrontLeft as u32) | ((Channel::FrontRight as u32) << 4);

/// Channel map for `channels` in WAVE order.
pub fn default_channelmap(channels: u8) -> u32 {
    const WAVE_ORDER: [Channel; 8] = [
        Channel::FrontLeft,
        Channel::FrontRight,
        Channel::FrontCenter,
        Channel::Lfe,
        Channel::BackLeft,
        Channel::BackRight,
        Channel::SideLeft,
        Channel::SideRight,
    ];
    match channels {
        0 => 0,
        1 => CHANNELMAP_MONO,
        n => WAVE_ORDER
            .iter()
            .take(n as usize)
            .enumerate()
            .fold(0, |map, (i, role)| map | ((*role as u32) << (4 * i))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioFormat {
    pub rate: u32,
    pub format: u16,
    pub channels: u8,
    pub channelmap: u32,
}

impl AudioFormat {
    /// Format with the default channel map for `channels`.
    pub fn new(format: u16, rate: u32, channels: u8) -> Self {
        Self {
            rate,
            format,
            channels,
            channelmap: default_channelmap(channels),
        }
    }

    pub fn from_parts(kind: SampleType, order: ByteOrder, bits: u16, pack: u16, rate: u32, channels: u8) -> Self {
        Self::new(descriptor(kind, order, bits.clamp(1, 32), pack.clamp(1, 8)), rate, channels)
    }

    pub fn is_undefined(&self) -> bool {
        self.format == sample::UNKNOWN || self.rate == 0 || self.channels == 0
    }

    pub fn sample_type(&self) -> SampleType {
        match self.format & TYPE_MASK {
            0 => SampleType::Signed,
            1 => SampleType::Unsigned,
            2 => SampleType::Float,
            _ => SampleType::Iec958,
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        if (self.format >> ORDER_SHIFT) & 1 == 1 {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn bits(&self) -> u16 {
        ((self.format >> BITS_SHIFT) & BITS_MASK) + 1
    }

    /// Bytes per sample.
    pub fn packing(&self) -> usize {
        (((self.format >> PACK_SHIFT) & PACK_MASK) + 1) as usize
    }

    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.packing()
    }

    pub fn is_native_order(&self) -> bool {
        self.packing() == 1 || self.byte_order() == ByteOrder::NATIVE
    }

    pub fn is_float(&self) -> bool {
        self.sample_type() == SampleType::Float
    }

    /// Flip the byte order. Single-byte formats have no byte order and are left alone.
    pub fn swap(&mut self) {
        if self.packing() > 1 {
            self.format ^= 1 << ORDER_SHIFT;
        }
    }

    /// Step the sample encoding down to the next format a device is likely to accept.
    ///
    /// Returns `false` when there is nothing left to try.
    pub fn compatible(&mut self) -> bool {
        let native = {
            let mut f = *self;
            if !f.is_native_order() {
                f.swap();
            }
            f.format
        };
        let next = match native {
            sample::S24_3 => sample::S24,
            sample::S24 => sample::S32,
            sample::S32 => sample::S16,
            sample::FLOAT => sample::S32,
            _ => return false,
        };
        self.format = next;
        true
    }

    /// Role of channel `index` according to the channel map.
    pub fn channel(&self, index: u8) -> Channel {
        if index >= 8 {
            return Channel::Na;
        }
        Channel::from_bits((self.channelmap >> (4 * index as u32)) & 0xf)
    }

    pub fn reset(&mut self) {
        *self = AudioFormat::default();
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            return write!(f, "undefined");
        }
        let kind = match self.sample_type() {
            SampleType::Signed => "s",
            SampleType::Unsigned => "u",
            SampleType::Float => "f",
            SampleType::Iec958 => "iec958-",
        };
        let order = match self.byte_order() {
            ByteOrder::Little => "le",
            ByteOrder::Big => "be",
        };
        write!(
            f,
            "{kind}{}/{}{order} {}Hz {}ch",
            self.bits(),
            self.packing(),
            self.rate,
            self.channels
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    #[default]
    Invalid,
    Pcm,
    Flac,
    Vorbis,
    Musepack,
    Mpeg,
    Aac,
    Opus,
    Alac,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Invalid => "Invalid",
            Codec::Pcm => "PCM",
            Codec::Flac => "FLAC",
            Codec::Vorbis => "Vorbis",
            Codec::Musepack => "Musepack",
            Codec::Mpeg => "MPEG",
            Codec::Aac => "AAC",
            Codec::Opus => "Opus",
            Codec::Alac => "ALAC",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContainerFormat {
    #[default]
    Unknown,
    Wav,
    Ogg,
    Flac,
    Mp3,
    Mp4,
    Aac,
    Musepack,
    Matroska,
}

impl ContainerFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerFormat::Unknown => "unknown",
            ContainerFormat::Wav => "wav",
            ContainerFormat::Ogg => "ogg",
            ContainerFormat::Flac => "flac",
            ContainerFormat::Mp3 => "mp3",
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Aac => "aac",
            ContainerFormat::Musepack => "musepack",
            ContainerFormat::Matroska => "matroska",
        }
    }

    pub fn from_extension(ext: &str) -> ContainerFormat {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => ContainerFormat::Wav,
            "ogg" | "oga" | "opus" => ContainerFormat::Ogg,
            "flac" => ContainerFormat::Flac,
            "mp3" => ContainerFormat::Mp3,
            "m4a" | "m4b" | "mp4" => ContainerFormat::Mp4,
            "aac" => ContainerFormat::Aac,
            "mpc" => ContainerFormat::Musepack,
            "mka" | "mkv" | "webm" => ContainerFormat::Matroska,
            _ => ContainerFormat::Unknown,
        }
    }

    /// Resolve from a path or URL by its extension, ignoring any query string.
    pub fn from_path(path: &str) -> ContainerFormat {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let name = path.rsplit('/').next().unwrap_or(path);
        match name.rsplit_once('.') {
            Some((_, ext)) => ContainerFormat::from_extension(ext),
            None => ContainerFormat::Unknown,
        }
    }

    pub fn from_mime(mime: &str) -> ContainerFormat {
        let mime = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
        match mime.as_str() {
            "audio/wav" | "audio/x-wav" | "audio/wave" => ContainerFormat::Wav,
            "audio/ogg" | "application/ogg" | "audio/opus" | "audio/vorbis" => ContainerFormat::Ogg,
            "audio/flac" | "audio/x-flac" => ContainerFormat::Flac,
            "audio/mpeg" | "audio/mp3" => ContainerFormat::Mp3,
            "audio/mp4" | "audio/x-m4a" => ContainerFormat::Mp4,
            "audio/aac" | "audio/aacp" => ContainerFormat::Aac,
            "audio/x-musepack" => ContainerFormat::Musepack,
            "audio/x-matroska" | "audio/webm" | "video/webm" | "video/x-matroska" => ContainerFormat::Matroska,
            _ => ContainerFormat::Unknown,
        }
    }

    /// Recognise a container from its first bytes.
    pub fn probe(head: &[u8]) -> ContainerFormat {
        if head.starts_with(b"OggS") {
            ContainerFormat::Ogg
        } else if head.starts_with(&[0x1a, 0x45, 0xdf, 0xa3]) {
            ContainerFormat::Matroska
        } else if head.starts_with(b"fLaC") {
            ContainerFormat::Flac
        } else if head.starts_with(b"RIFF") {
            ContainerFormat::Wav
        } else if head.starts_with(b"ID3") {
            ContainerFormat::Mp3
        } else if head.starts_with(b"MPCK") {
            ContainerFormat::Musepack
        } else {
            ContainerFormat::Unknown
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayGainMode {
    #[default]
    Off,
    Track,
    Album,
}

/// Replay gain values in dB and linear peaks. NaN means unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayGain {
    pub album_gain: f64,
    pub album_peak: f64,
    pub track_gain: f64,
    pub track_peak: f64,
}

impl Default for ReplayGain {
    fn default() -> Self {
        Self {
            album_gain: f64::NAN,
            album_peak: f64::NAN,
            track_gain: f64::NAN,
            track_peak: f64::NAN,
        }
    }
}

impl ReplayGain {
    /// Linear scale factor for `mode`, clipped so that `scale * peak <= 1`.
    ///
    /// Falls back to the other gain pair when the requested one is missing.
    pub fn scale(&self, mode: ReplayGainMode) -> Option<f64> {
        let (gain, peak) = match mode {
            ReplayGainMode::Off => return None,
            ReplayGainMode::Track if !self.track_gain.is_nan() => (self.track_gain, self.track_peak),
            ReplayGainMode::Album if !self.album_gain.is_nan() => (self.album_gain, self.album_peak),
            ReplayGainMode::Track => (self.album_gain, self.album_peak),
            ReplayGainMode::Album => (self.track_gain, self.track_peak),
        };
        if gain.is_nan() {
            return None;
        }
        let mut scale = 10f64.powf(gain / 20.0);
        if peak.is_finite() && peak > 0.0 && scale * peak > 1.0 {
            scale = 1.0 / peak;
        }
        Some(scale)
    }
}

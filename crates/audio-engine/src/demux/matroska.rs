//! Matroska / WebM audio demuxer.
//!
//! Header parsing walks the EBML header and the Segment children up to the first Cluster,
//! collecting Info, Tracks, Cues and the SeekHead. After that, clusters are streamed one block
//! at a time; laced blocks are split into frames that share the block timestamp and each frame
//! goes out in its own packet.
//!
//! Seeking looks up the last cue at or before the target (minus the codec's pre-roll), jumps to
//! that cluster and drops blocks until the target is reached.

use std::collections::VecDeque;

use crate::demux::ebml::{
    self, Element, finish_element, for_each_child, read_binary, read_element, read_float, read_string, read_uint,
};
use crate::demux::lacing::{self, Lacing};
use crate::demux::{Demuxer, ReadStatus, ReaderContext};
use crate::error::{DemuxError, SourceError};
use crate::event::{ConfigureEvent, Event};
use crate::format::{AudioFormat, Codec, ContainerFormat, sample};
use crate::packet::Packet;
use crate::source::{ByteSource, ByteSourceExt, Whence};

mod id {
    pub const EBML: u32 = 0x1a45dfa3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const SEGMENT: u32 = 0x18538067;
    pub const SEEK_HEAD: u32 = 0x114d9b74;
    pub const SEEK: u32 = 0x4dbb;
    pub const SEEK_ID: u32 = 0x53ab;
    pub const SEEK_POSITION: u32 = 0x53ac;
    pub const INFO: u32 = 0x1549a966;
    pub const TIMECODE_SCALE: u32 = 0x2ad7b1;
    pub const DURATION: u32 = 0x4489;
    pub const TRACKS: u32 = 0x1654ae6b;
    pub const TRACK_ENTRY: u32 = 0xae;
    pub const TRACK_NUMBER: u32 = 0xd7;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63a2;
    pub const CODEC_DELAY: u32 = 0x56aa;
    pub const SEEK_PRE_ROLL: u32 = 0x56bb;
    pub const AUDIO: u32 = 0xe1;
    pub const SAMPLING_FREQUENCY: u32 = 0xb5;
    pub const CHANNELS: u32 = 0x9f;
    pub const BIT_DEPTH: u32 = 0x6264;
    pub const CUES: u32 = 0x1c53bb6b;
    pub const CUE_POINT: u32 = 0xbb;
    pub const CUE_TIME: u32 = 0xb3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xb7;
    pub const CUE_TRACK: u32 = 0xf7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xf1;
    pub const CLUSTER: u32 = 0x1f43b675;
    pub const TIMECODE: u32 = 0xe7;
    pub const SIMPLE_BLOCK: u32 = 0xa3;
    pub const BLOCK_GROUP: u32 = 0xa0;
    pub const BLOCK: u32 = 0xa1;
    pub const TAGS: u32 = 0x1254c367;
    pub const CHAPTERS: u32 = 0x1043a770;
    pub const ATTACHMENTS: u32 = 0x1941a469;
}

const TRACK_TYPE_AUDIO: u64 = 2;
const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;
const OPUS_RATE: u32 = 48_000;
/// Opus needs 80 ms of decoded audio before a seek point to converge.
const OPUS_PREROLL: i64 = 3840;
/// Bytes scanned for the next cluster after an interrupted read.
const RESYNC_LIMIT: u64 = 4 * 1024 * 1024;

fn is_top_level(id: u32) -> bool {
    matches!(
        id,
        id::CLUSTER | id::CUES | id::TAGS | id::CHAPTERS | id::ATTACHMENTS | id::SEEK_HEAD | id::INFO | id::TRACKS
    )
}

pub fn codec_from_id(codec_id: &str) -> Codec {
    match codec_id {
        "A_OPUS" => Codec::Opus,
        "A_VORBIS" => Codec::Vorbis,
        "A_FLAC" => Codec::Flac,
        "A_MPEG/L3" => Codec::Mpeg,
        "A_ALAC" => Codec::Alac,
        "A_MPC" => Codec::Musepack,
        "A_PCM/INT/LIT" | "A_PCM/INT/BIG" | "A_PCM/FLOAT/IEEE" => Codec::Pcm,
        id if id.starts_with("A_AAC") => Codec::Aac,
        _ => Codec::Invalid,
    }
}

/// Seek index entry. `time` is in timecode ticks, `cluster_position` is relative to the
/// Segment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cue {
    pub time: u64,
    pub cluster_position: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Track {
    pub number: u64,
    pub codec: Codec,
    pub af: AudioFormat,
    pub codec_private: Option<Vec<u8>>,
    /// Frames the decoder drops at the start of the stream.
    pub preskip: u64,
    /// Frames to decode ahead of a seek target.
    pub preroll: i64,
    pub cues: Vec<Cue>,
}

struct TrackEntry {
    number: u64,
    kind: u64,
    codec_id: String,
    private: Option<Vec<u8>>,
    codec_delay_ns: u64,
    seek_preroll_ns: u64,
    rate: f64,
    channels: u64,
    bit_depth: u64,
}

impl TrackEntry {
    fn parse(src: &mut dyn ByteSource, element: &Element) -> Result<Self, DemuxError> {
        let mut entry = TrackEntry {
            number: 0,
            kind: 0,
            codec_id: String::new(),
            private: None,
            codec_delay_ns: 0,
            seek_preroll_ns: 0,
            rate: 8000.0,
            channels: 1,
            bit_depth: 0,
        };
        for_each_child(src, element, |src, child| {
            match child.id {
                id::TRACK_NUMBER => entry.number = read_uint(src, child)?,
                id::TRACK_TYPE => entry.kind = read_uint(src, child)?,
                id::CODEC_ID => entry.codec_id = read_string(src, child)?,
                id::CODEC_PRIVATE => entry.private = Some(read_binary(src, child)?),
                id::CODEC_DELAY => entry.codec_delay_ns = read_uint(src, child)?,
                id::SEEK_PRE_ROLL => entry.seek_preroll_ns = read_uint(src, child)?,
                id::AUDIO => for_each_child(src, child, |src, audio| {
                    match audio.id {
                        id::SAMPLING_FREQUENCY => entry.rate = read_float(src, audio)?,
                        id::CHANNELS => entry.channels = read_uint(src, audio)?,
                        id::BIT_DEPTH => entry.bit_depth = read_uint(src, audio)?,
                        _ => {}
                    }
                    Ok(())
                })?,
                _ => {}
            }
            Ok(())
        })?;
        Ok(entry)
    }

    fn into_track(self) -> Option<Track> {
        if self.kind != TRACK_TYPE_AUDIO {
            return None;
        }
        let codec = codec_from_id(&self.codec_id);
        let mut channels = u8::try_from(self.channels).ok().filter(|c| *c > 0)?;
        let rate = self.rate.round() as u32;
        let ns_to_frames = |ns: u64, rate: u32| (ns as u128 * rate as u128 / 1_000_000_000) as u64;

        let (af, preskip, preroll) = match codec {
            Codec::Invalid => return None,
            Codec::Opus => {
                let head = self.private.as_deref().filter(|p| p.len() >= 19 && p.starts_with(b"OpusHead"));
                let preskip = match head {
                    Some(h) => {
                        channels = h[9].max(1);
                        u16::from_le_bytes([h[10], h[11]]) as u64
                    }
                    None => ns_to_frames(self.codec_delay_ns, OPUS_RATE),
                };
                let preroll = OPUS_PREROLL.max(ns_to_frames(self.seek_preroll_ns, OPUS_RATE) as i64);
                (AudioFormat::new(sample::FLOAT, OPUS_RATE, channels), preskip, preroll)
            }
            Codec::Pcm => {
                let format = match (self.codec_id.as_str(), self.bit_depth) {
                    ("A_PCM/INT/LIT", 16) => sample::S16_LE,
                    ("A_PCM/INT/LIT", 24) => sample::S24_3LE,
                    ("A_PCM/INT/LIT", 32) => sample::S32_LE,
                    ("A_PCM/INT/BIG", 16) => sample::S16_BE,
                    ("A_PCM/INT/BIG", 24) => sample::S24_3BE,
                    ("A_PCM/INT/BIG", 32) => sample::S32_BE,
                    ("A_PCM/FLOAT/IEEE", 32) => sample::FLOAT_LE,
                    _ => return None,
                };
                (AudioFormat::new(format, rate, channels), 0, 0)
            }
            _ => (
                AudioFormat::new(sample::FLOAT, rate, channels),
                ns_to_frames(self.codec_delay_ns, rate),
                ns_to_frames(self.seek_preroll_ns, rate) as i64,
            ),
        };
        if af.rate == 0 {
            return None;
        }
        Some(Track {
            number: self.number,
            codec,
            af,
            codec_private: self.private,
            preskip,
            preroll,
            cues: Vec::new(),
        })
    }
}

pub struct MatroskaReader {
    track: Option<Track>,
    parsed: bool,
    /// A read was interrupted mid-element; resynchronise on the next cluster.
    desynced: bool,
    finished: bool,
    segment_offset: u64,
    segment_end: Option<u64>,
    first_cluster: Option<u64>,
    cues_position: Option<u64>,
    cue_index: Vec<(u64, Cue)>,
    in_cluster: bool,
    cluster_end: Option<u64>,
    cluster_timecode: u64,
    timecode_scale: u64,
    duration: Option<f64>,
    stream_length: i64,
    block: Vec<u8>,
    block_position: i64,
    frames: VecDeque<(usize, usize)>,
    /// Last filled packet, posted once the next one is known so the final one can carry EOS.
    held: Option<Packet>,
    seek_target: Option<i64>,
}

impl Default for MatroskaReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MatroskaReader {
    pub fn new() -> Self {
        Self {
            track: None,
            parsed: false,
            desynced: false,
            finished: false,
            segment_offset: 0,
            segment_end: None,
            first_cluster: None,
            cues_position: None,
            cue_index: Vec::new(),
            in_cluster: false,
            cluster_end: None,
            cluster_timecode: 0,
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            duration: None,
            stream_length: -1,
            block: Vec::new(),
            block_position: 0,
            frames: VecDeque::new(),
            held: None,
            seek_target: None,
        }
    }

    /// The selected audio track, once headers are parsed.
    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    fn rate(&self) -> u32 {
        self.track.as_ref().map_or(0, |t| t.af.rate)
    }

    fn timecode_to_frames(&self, timecode: u64) -> i64 {
        (timecode as u128 * self.timecode_scale as u128 * self.rate() as u128 / 1_000_000_000) as i64
    }

    fn frames_to_timecode(&self, frames: i64) -> u64 {
        let denom = self.timecode_scale as u128 * self.rate() as u128;
        if denom == 0 {
            return 0;
        }
        (frames.max(0) as u128 * 1_000_000_000 / denom) as u64
    }

    fn parse_headers(&mut self, ctx: &mut ReaderContext<'_>) -> Result<(), DemuxError> {
        let src = &mut *ctx.source;
        let header = read_element(src)?;
        if header.id != id::EBML {
            return Err(DemuxError::malformed(header.id, "missing EBML header"));
        }
        let mut doc_type = String::from("matroska");
        for_each_child(src, &header, |src, child| {
            if child.id == id::DOC_TYPE {
                doc_type = read_string(src, child)?;
            }
            Ok(())
        })?;
        if doc_type != "matroska" && doc_type != "webm" {
            return Err(DemuxError::UnsupportedDocType(doc_type));
        }

        let segment = loop {
            let el = read_element(src)?;
            if el.id == id::SEGMENT {
                break el;
            }
            if el.is_unknown_size() {
                return Err(DemuxError::malformed(el.id, "unknown size before segment"));
            }
            finish_element(src, &el)?;
        };
        self.segment_offset = segment.offset;
        self.segment_end = segment.end();

        loop {
            let pos = src.tell()?;
            if self.segment_end.is_some_and(|end| pos >= end) {
                break;
            }
            let el = match read_element(src) {
                Ok(el) => el,
                Err(DemuxError::Source(SourceError::Eof)) => break,
                Err(e) => return Err(e),
            };
            match el.id {
                id::CLUSTER => {
                    self.first_cluster = Some(pos);
                    self.enter_cluster(&el);
                    break;
                }
                _ if el.is_unknown_size() => {
                    return Err(DemuxError::malformed(el.id, "unknown size outside cluster"));
                }
                id::SEEK_HEAD => self.parse_seek_head(src, &el)?,
                id::INFO => self.parse_info(src, &el)?,
                id::TRACKS => self.parse_tracks(src, &el)?,
                id::CUES => self.parse_cues(src, &el)?,
                _ => {}
            }
            finish_element(src, &el)?;
        }

        if self.track.is_none() {
            return Err(DemuxError::NoSupportedTrack);
        }

        // Cues stored after the clusters are reachable through the SeekHead.
        if self.cue_index.is_empty() && !src.serial() {
            if let Some(rel) = self.cues_position {
                let resume = src.tell()?;
                src.position((self.segment_offset + rel) as i64, Whence::Begin)?;
                let el = read_element(src)?;
                if el.id == id::CUES {
                    self.parse_cues(src, &el)?;
                }
                src.position(resume as i64, Whence::Begin)?;
            }
        }
        self.attach_cues();

        let rate = self.rate() as f64;
        self.stream_length = match self.duration {
            Some(d) if d > 0.0 => (d * self.timecode_scale as f64 * rate / 1e9) as i64,
            _ => -1,
        };

        let Some(track) = self.track.as_ref() else {
            return Err(DemuxError::NoSupportedTrack);
        };
        tracing::debug!(
            track = track.number,
            codec = %track.codec,
            format = %track.af,
            length = self.stream_length,
            cues = track.cues.len(),
            "matroska headers parsed"
        );
        let mut configure = ConfigureEvent::new(track.codec, track.af);
        configure.stream_length = self.stream_length;
        configure.stream_offset_start = track.preskip;
        configure.codec_data = track.codec_private.clone();
        ctx.post(Event::Configure(configure));
        self.parsed = true;
        Ok(())
    }

    fn parse_seek_head(&mut self, src: &mut dyn ByteSource, el: &Element) -> Result<(), DemuxError> {
        for_each_child(src, el, |src, seek| {
            if seek.id != id::SEEK {
                return Ok(());
            }
            let mut target = None;
            let mut position = None;
            for_each_child(src, seek, |src, child| {
                match child.id {
                    id::SEEK_ID => target = ebml::decode_id(&read_binary(src, child)?).map(|(id, _)| id),
                    id::SEEK_POSITION => position = Some(read_uint(src, child)?),
                    _ => {}
                }
                Ok(())
            })?;
            if target == Some(id::CUES) {
                self.cues_position = position;
            }
            Ok(())
        })
    }

    fn parse_info(&mut self, src: &mut dyn ByteSource, el: &Element) -> Result<(), DemuxError> {
        for_each_child(src, el, |src, child| {
            match child.id {
                id::TIMECODE_SCALE => {
                    self.timecode_scale = read_uint(src, child)?.max(1);
                }
                id::DURATION => self.duration = Some(read_float(src, child)?),
                _ => {}
            }
            Ok(())
        })
    }

    fn parse_tracks(&mut self, src: &mut dyn ByteSource, el: &Element) -> Result<(), DemuxError> {
        for_each_child(src, el, |src, child| {
            if child.id != id::TRACK_ENTRY {
                return Ok(());
            }
            let entry = TrackEntry::parse(src, child)?;
            let (number, codec_id) = (entry.number, entry.codec_id.clone());
            if self.track.is_some() {
                return Ok(());
            }
            match entry.into_track() {
                Some(track) => self.track = Some(track),
                None => tracing::debug!(track = number, codec = %codec_id, "skipping matroska track"),
            }
            Ok(())
        })
    }

    fn parse_cues(&mut self, src: &mut dyn ByteSource, el: &Element) -> Result<(), DemuxError> {
        for_each_child(src, el, |src, point| {
            if point.id != id::CUE_POINT {
                return Ok(());
            }
            let mut time = 0;
            let mut positions = Vec::new();
            for_each_child(src, point, |src, child| {
                match child.id {
                    id::CUE_TIME => time = read_uint(src, child)?,
                    id::CUE_TRACK_POSITIONS => {
                        let mut track = 0;
                        let mut cluster = None;
                        for_each_child(src, child, |src, pos| {
                            match pos.id {
                                id::CUE_TRACK => track = read_uint(src, pos)?,
                                id::CUE_CLUSTER_POSITION => cluster = Some(read_uint(src, pos)?),
                                _ => {}
                            }
                            Ok(())
                        })?;
                        if let Some(cluster) = cluster {
                            positions.push((track, cluster));
                        }
                    }
                    _ => {}
                }
                Ok(())
            })?;
            for (track, cluster_position) in positions {
                self.cue_index.push((
                    track,
                    Cue {
                        time,
                        cluster_position,
                    },
                ));
            }
            Ok(())
        })
    }

    fn attach_cues(&mut self) {
        let Some(track) = self.track.as_mut() else {
            return;
        };
        track.cues = self
            .cue_index
            .iter()
            .filter(|(number, _)| *number == track.number)
            .map(|(_, cue)| *cue)
            .collect();
        track.cues.sort_by_key(|cue| cue.time);
    }

    fn enter_cluster(&mut self, el: &Element) {
        self.in_cluster = true;
        self.cluster_end = el.end();
        self.cluster_timecode = 0;
    }

    /// Advance to the next block of the selected track. Returns `false` at end of stream.
    fn next_block(&mut self, src: &mut dyn ByteSource) -> Result<bool, DemuxError> {
        loop {
            let pos = src.tell()?;
            if self.segment_end.is_some_and(|end| pos >= end) {
                return Ok(false);
            }
            if self.in_cluster && self.cluster_end.is_some_and(|end| pos >= end) {
                self.in_cluster = false;
            }
            let el = match read_element(src) {
                Ok(el) => el,
                Err(DemuxError::Source(SourceError::Eof)) => return Ok(false),
                Err(e) => return Err(e),
            };
            if is_top_level(el.id) {
                self.in_cluster = false;
            }
            match el.id {
                id::CLUSTER => {
                    self.enter_cluster(&el);
                    continue;
                }
                _ if el.is_unknown_size() => {
                    return Err(DemuxError::malformed(el.id, "unknown size outside cluster"));
                }
                id::TIMECODE if self.in_cluster => self.cluster_timecode = read_uint(src, &el)?,
                id::SIMPLE_BLOCK if self.in_cluster => {
                    if self.read_block(src, &el)? {
                        finish_element(src, &el)?;
                        return Ok(true);
                    }
                }
                id::BLOCK_GROUP if self.in_cluster => {
                    let mut found = false;
                    for_each_child(src, &el, |src, child| {
                        if child.id == id::BLOCK && self.read_block(src, child)? {
                            found = true;
                        }
                        Ok(())
                    })?;
                    if found {
                        return Ok(true);
                    }
                    continue;
                }
                _ => {}
            }
            finish_element(src, &el)?;
        }
    }

    /// Read a (Simple)Block. Returns `true` when it belongs to the selected track and its frames
    /// were queued.
    fn read_block(&mut self, src: &mut dyn ByteSource, el: &Element) -> Result<bool, DemuxError> {
        if el.size > ebml::MAX_BINARY_SIZE {
            return Err(DemuxError::malformed(el.id, "block too large"));
        }
        self.block.resize(el.size as usize, 0);
        src.read_exact(&mut self.block)?;

        let (number, width) = ebml::decode_size(&self.block)
            .filter(|(n, _)| *n != ebml::UNKNOWN_SIZE)
            .ok_or(DemuxError::malformed(el.id, "bad block track number"))?;
        if self.block.len() < width + 3 {
            return Err(DemuxError::malformed(el.id, "truncated block header"));
        }
        if self.track.as_ref().is_none_or(|t| t.number != number) {
            return Ok(false);
        }
        let relative = i16::from_be_bytes([self.block[width], self.block[width + 1]]);
        let flags = self.block[width + 2];
        let payload = width + 3;
        let (sizes, lace_header) = lacing::decode(Lacing::from_flags(flags), &self.block[payload..])?;

        let timecode = (self.cluster_timecode as i64 + relative as i64).max(0) as u64;
        let position = self.timecode_to_frames(timecode);
        if let Some(target) = self.seek_target {
            if position < target {
                return Ok(false);
            }
            self.seek_target = None;
        }

        let mut offset = payload + lace_header;
        for size in sizes {
            self.frames.push_back((offset, size));
            offset += size;
        }
        self.block_position = position;
        Ok(true)
    }

    /// Skip forward to the next Cluster id after a lost element boundary.
    fn resync(&mut self, src: &mut dyn ByteSource) -> Result<bool, DemuxError> {
        let pattern = id::CLUSTER.to_be_bytes();
        let mut window = [0u8; 4];
        let mut scanned = 0u64;
        while scanned < RESYNC_LIMIT {
            window.rotate_left(1);
            match src.read_u8() {
                Ok(b) => window[3] = b,
                Err(SourceError::Eof) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
            scanned += 1;
            if window == pattern {
                let (size, _) = ebml::read_size(src, id::CLUSTER)?;
                let offset = src.tell()?;
                self.enter_cluster(&Element {
                    id: id::CLUSTER,
                    size,
                    offset,
                    header_len: 0,
                });
                self.frames.clear();
                tracing::debug!(scanned, "matroska resynchronised on cluster");
                return Ok(true);
            }
        }
        Err(DemuxError::malformed(id::CLUSTER, "no cluster found while resynchronising"))
    }

    fn emit(&mut self, ctx: &ReaderContext<'_>, mut packet: Packet, range: (usize, usize)) {
        let Some(track) = self.track.as_ref() else {
            return;
        };
        let (start, len) = range;
        packet.append(&self.block[start..start + len]);
        packet.af = track.af;
        packet.stream = ctx.stream;
        packet.stream_position = self.block_position;
        packet.stream_length = self.stream_length;
        if let Some(previous) = self.held.replace(packet) {
            ctx.post(Event::Buffer(previous));
        }
    }

    fn finish(&mut self, ctx: &ReaderContext<'_>) {
        if let Some(mut last) = self.held.take() {
            last.set_eos();
            ctx.post(Event::Buffer(last));
        }
        ctx.post(Event::End { stream: ctx.stream });
        self.finished = true;
    }
}

impl Demuxer for MatroskaReader {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Matroska
    }

    fn init(&mut self, _ctx: &mut ReaderContext<'_>) -> Result<(), DemuxError> {
        *self = MatroskaReader::new();
        Ok(())
    }

    fn process(&mut self, ctx: &mut ReaderContext<'_>, packet: Packet) -> ReadStatus {
        if !self.parsed {
            if let Err(e) = self.parse_headers(ctx) {
                return ReadStatus::Error(e);
            }
        }
        if self.finished {
            return ReadStatus::Done;
        }
        loop {
            if ctx.aborted() {
                return ReadStatus::Ok;
            }
            if let Some(range) = self.frames.pop_front() {
                self.emit(ctx, packet, range);
                return ReadStatus::Ok;
            }
            let next = if self.desynced {
                self.resync(ctx.source).map(|found| {
                    self.desynced = false;
                    found
                })
            } else {
                self.next_block(ctx.source)
            };
            match next {
                Ok(true) => continue,
                Ok(false) => {
                    self.finish(ctx);
                    return ReadStatus::Done;
                }
                Err(e) if e.is_interrupted() => {
                    self.desynced = true;
                    return ReadStatus::Ok;
                }
                Err(e) => return ReadStatus::Error(e),
            }
        }
    }

    fn can_seek(&self) -> bool {
        self.parsed && self.stream_length > 0 && self.first_cluster.is_some()
    }

    fn seek_offset(&self, pos: f64) -> Option<i64> {
        (self.stream_length > 0).then(|| (self.stream_length as f64 * pos.clamp(0.0, 1.0)) as i64)
    }

    fn seek(&mut self, ctx: &mut ReaderContext<'_>, offset: i64) -> bool {
        let Some(track) = self.track.as_ref() else {
            return false;
        };
        let target = (offset - track.preroll).max(0);
        let timecode = self.frames_to_timecode(target);
        let start = track
            .cues
            .iter()
            .rev()
            .find(|cue| cue.time <= timecode)
            .map(|cue| self.segment_offset + cue.cluster_position)
            .or(self.first_cluster);
        let Some(start) = start else {
            return false;
        };
        if let Err(e) = ctx.source.position(start as i64, Whence::Begin) {
            tracing::warn!(error = %e, "matroska seek failed");
            return false;
        }
        tracing::debug!(offset, target, start, "matroska seek");
        self.in_cluster = false;
        self.cluster_end = None;
        self.frames.clear();
        self.held = None;
        self.finished = false;
        self.desynced = false;
        self.seek_target = Some(target);
        true
    }
}

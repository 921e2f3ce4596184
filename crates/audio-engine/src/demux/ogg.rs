//! Ogg Opus / Vorbis demuxer.
//!
//! Pages are synchronised on the `OggS` capture pattern and packets are reassembled across page
//! boundaries for the first supported logical stream. Header packets become the Configure
//! setup blob, the comment header becomes a `Meta` event.
//!
//! The stream start offset is recovered by scanning forward to the first packet that completes
//! on a page with a granule position and subtracting the durations of the packets before it.
//! Seekable sources rewind to the data start after the scan; serial sources keep the scanned
//! packets in a cache and replay them, since they cannot go back.

use std::collections::VecDeque;

use crate::demux::lacing::{self, Lacing};
use crate::demux::{Demuxer, ReadStatus, ReaderContext};
use crate::error::{DemuxError, SourceError};
use crate::event::{ConfigureEvent, Event, MetaInfo};
use crate::format::{AudioFormat, Codec, ContainerFormat, ReplayGain, sample};
use crate::packet::Packet;
use crate::source::{ByteSource, ByteSourceExt, Whence};

const CAPTURE: [u8; 4] = *b"OggS";
const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;
/// Bytes scanned for a capture pattern before giving up.
const SYNC_LIMIT: u64 = 128 * 1024;
/// Distance from the end of the file searched for the last granule position.
const TAIL_SCAN: u64 = 64 * 1024;
/// Packets scanned for a granule position while computing the start offset.
const START_SCAN_LIMIT: usize = 1024;
const OPUS_RATE: u32 = 48_000;
const OPUS_PREROLL: i64 = 3840;

struct Page {
    offset: u64,
    flags: u8,
    granule: i64,
    serial: u32,
    segments: Vec<u8>,
    body: Vec<u8>,
}

struct OggPacket {
    data: Vec<u8>,
    /// Granule of the page this packet completed on, if it was the last one completed there.
    granule: i64,
    eos: bool,
}

/// Read the next page, resynchronising on the capture pattern. `None` at end of stream.
fn read_page(src: &mut dyn ByteSource) -> Result<Option<Page>, DemuxError> {
    let mut window = [0u8; 4];
    let mut filled = 0;
    let mut scanned = 0u64;
    loop {
        let b = match src.read_u8() {
            Ok(b) => b,
            Err(SourceError::Eof) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if filled < 4 {
            window[filled] = b;
            filled += 1;
        } else {
            window.rotate_left(1);
            window[3] = b;
        }
        if filled == 4 && window == CAPTURE {
            break;
        }
        scanned += 1;
        if scanned > SYNC_LIMIT {
            return Err(DemuxError::InvalidPage("capture pattern not found"));
        }
    }
    let offset = src.tell()? - 4;

    let mut header = [0u8; 23];
    src.read_exact(&mut header)?;
    if header[0] != 0 {
        return Err(DemuxError::InvalidPage("unsupported stream structure version"));
    }
    let flags = header[1];
    let granule = i64::from_le_bytes([
        header[2], header[3], header[4], header[5], header[6], header[7], header[8], header[9],
    ]);
    let serial = u32::from_le_bytes([header[10], header[11], header[12], header[13]]);
    let nsegs = header[22] as usize;
    let mut segments = vec![0u8; nsegs];
    src.read_exact(&mut segments)?;
    let body_len: usize = segments.iter().map(|s| *s as usize).sum();
    let mut body = vec![0u8; body_len];
    src.read_exact(&mut body)?;
    Ok(Some(Page {
        offset,
        flags,
        granule,
        serial,
        segments,
        body,
    }))
}

/// Samples (at 48 kHz) carried by an Opus packet, from its TOC byte.
pub(crate) fn opus_packet_duration(data: &[u8]) -> Option<i64> {
    let toc = *data.first()?;
    let config = (toc >> 3) as usize;
    let frame = match config {
        0..=11 => [480, 960, 1920, 2880][config & 3],
        12..=15 => [480, 960][config & 1],
        _ => [120, 240, 480, 960][config & 3],
    };
    let count = match toc & 3 {
        0 => 1,
        1 | 2 => 2,
        _ => (*data.get(1)? & 0x3f) as i64,
    };
    Some(frame * count)
}

fn le_u32(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn parse_gain(value: &str) -> Option<f64> {
    value.trim().trim_end_matches("dB").trim().parse().ok()
}

/// Parse a Vorbis comment block (after its magic) into tags and replay gain.
fn parse_comments(data: &[u8], opus: bool) -> (MetaInfo, ReplayGain) {
    let mut meta = MetaInfo::default();
    let mut gain = ReplayGain::default();
    let mut pos = 0usize;
    let Some(vendor_len) = le_u32(data, pos) else {
        return (meta, gain);
    };
    pos += 4 + vendor_len as usize;
    let Some(count) = le_u32(data, pos) else {
        return (meta, gain);
    };
    pos += 4;
    for _ in 0..count {
        let Some(len) = le_u32(data, pos) else {
            break;
        };
        pos += 4;
        let Some(raw) = data.get(pos..pos + len as usize) else {
            break;
        };
        pos += len as usize;
        let comment = String::from_utf8_lossy(raw);
        let Some((key, value)) = comment.split_once('=') else {
            continue;
        };
        match key.to_ascii_uppercase().as_str() {
            "TITLE" => meta.title = Some(value.to_string()),
            "ARTIST" => meta.artist = Some(value.to_string()),
            "ALBUM" => meta.album = Some(value.to_string()),
            "REPLAYGAIN_TRACK_GAIN" => gain.track_gain = parse_gain(value).unwrap_or(f64::NAN),
            "REPLAYGAIN_TRACK_PEAK" => gain.track_peak = value.trim().parse().unwrap_or(f64::NAN),
            "REPLAYGAIN_ALBUM_GAIN" => gain.album_gain = parse_gain(value).unwrap_or(f64::NAN),
            "REPLAYGAIN_ALBUM_PEAK" => gain.album_peak = value.trim().parse().unwrap_or(f64::NAN),
            // Q7.8 dB relative to -23 LUFS; replay gain references -18 LUFS.
            "R128_TRACK_GAIN" if opus => {
                if let Ok(q) = value.trim().parse::<i32>() {
                    gain.track_gain = q as f64 / 256.0 + 5.0;
                }
            }
            "R128_ALBUM_GAIN" if opus => {
                if let Ok(q) = value.trim().parse::<i32>() {
                    gain.album_gain = q as f64 / 256.0 + 5.0;
                }
            }
            _ => {}
        }
    }
    (meta, gain)
}

pub struct OggReader {
    serial: Option<u32>,
    codec: Codec,
    af: AudioFormat,
    headers: Vec<Vec<u8>>,
    parsed: bool,
    finished: bool,
    eos_seen: bool,
    preskip: u64,
    stream_start: i64,
    stream_length: i64,
    data_start: u64,
    partial: Vec<u8>,
    packets: VecDeque<OggPacket>,
    /// Packets scanned ahead on a serial source, replayed before reading further pages.
    cached: VecDeque<OggPacket>,
    /// Position in frames of the next packet, -1 when unknown.
    next_position: i64,
    held: Option<Packet>,
}

impl Default for OggReader {
    fn default() -> Self {
        Self::new()
    }
}

impl OggReader {
    pub fn new() -> Self {
        Self {
            serial: None,
            codec: Codec::Invalid,
            af: AudioFormat::default(),
            headers: Vec::new(),
            parsed: false,
            finished: false,
            eos_seen: false,
            preskip: 0,
            stream_start: 0,
            stream_length: -1,
            data_start: 0,
            partial: Vec::new(),
            packets: VecDeque::new(),
            cached: VecDeque::new(),
            next_position: 0,
            held: None,
        }
    }

    /// Start offset recovered from the first granule position.
    pub fn stream_start(&self) -> i64 {
        self.stream_start
    }

    fn headers_needed(&self) -> usize {
        match self.codec {
            Codec::Opus => 2,
            _ => 3,
        }
    }

    fn packet_duration(&self, data: &[u8]) -> Option<i64> {
        match self.codec {
            Codec::Opus => opus_packet_duration(data),
            _ => None,
        }
    }

    /// Granule position of frame 0 of the decoded output.
    fn granule_base(&self) -> i64 {
        self.stream_start + self.preskip as i64
    }

    fn push_page(&mut self, page: Page) {
        if Some(page.serial) != self.serial {
            return;
        }
        let mut lead_fragment = page.flags & FLAG_CONTINUED != 0 && self.partial.is_empty();
        if page.flags & FLAG_CONTINUED == 0 && !self.partial.is_empty() {
            tracing::debug!(bytes = self.partial.len(), "dropping unterminated ogg packet");
            self.partial.clear();
        }
        let mut completed = Vec::new();
        let mut offset = 0usize;
        for &lace in &page.segments {
            let end = offset + lace as usize;
            if !lead_fragment {
                self.partial.extend_from_slice(&page.body[offset..end]);
            }
            offset = end;
            if lace < 255 {
                if lead_fragment {
                    lead_fragment = false;
                } else {
                    completed.push(std::mem::take(&mut self.partial));
                }
            }
        }
        let last = completed.len().saturating_sub(1);
        let eos = page.flags & FLAG_EOS != 0;
        for (i, data) in completed.into_iter().enumerate() {
            self.packets.push_back(OggPacket {
                data,
                granule: if i == last { page.granule } else { -1 },
                eos: eos && i == last,
            });
        }
        if eos {
            self.eos_seen = true;
        }
    }

    fn next_packet(&mut self, src: &mut dyn ByteSource) -> Result<Option<OggPacket>, DemuxError> {
        loop {
            if let Some(p) = self.cached.pop_front() {
                return Ok(Some(p));
            }
            if let Some(p) = self.packets.pop_front() {
                return Ok(Some(p));
            }
            if self.eos_seen {
                return Ok(None);
            }
            match read_page(src)? {
                Some(page) => self.push_page(page),
                None => return Ok(None),
            }
        }
    }

    fn parse_headers(&mut self, ctx: &mut ReaderContext<'_>) -> Result<(), DemuxError> {
        let src = &mut *ctx.source;
        while self.serial.is_none() || self.headers.len() < self.headers_needed() {
            let Some(page) = read_page(src)? else {
                return Err(DemuxError::NoSupportedTrack);
            };
            if self.serial.is_none() {
                if page.flags & FLAG_BOS == 0 {
                    return Err(DemuxError::InvalidPage("stream does not start with a BOS page"));
                }
                self.codec = if page.body.starts_with(b"OpusHead") {
                    Codec::Opus
                } else if page.body.starts_with(b"\x01vorbis") {
                    Codec::Vorbis
                } else {
                    tracing::debug!(serial = page.serial, "skipping unsupported ogg stream");
                    continue;
                };
                self.serial = Some(page.serial);
            }
            self.push_page(page);
            while self.headers.len() < self.headers_needed() {
                match self.packets.pop_front() {
                    Some(p) => self.headers.push(p.data),
                    None => break,
                }
            }
        }

        let (meta, replay_gain) = self.parse_header_packets()?;

        if !src.serial() && self.packets.is_empty() && self.partial.is_empty() {
            self.data_start = src.tell()?;
            self.stream_start = self.scan_start(src, false)?;
            self.stream_length = self.scan_length(src)?;
            src.position(self.data_start as i64, Whence::Begin)?;
            self.packets.clear();
            self.partial.clear();
            self.eos_seen = false;
        } else {
            self.stream_start = self.scan_start(src, true)?;
        }
        self.next_position = 0;

        tracing::debug!(
            codec = %self.codec,
            format = %self.af,
            start = self.stream_start,
            length = self.stream_length,
            serial = src.serial(),
            "ogg headers parsed"
        );

        let mut configure = ConfigureEvent::new(self.codec, self.af);
        configure.stream_length = self.stream_length;
        configure.stream_offset_start = self.preskip;
        configure.replay_gain = replay_gain;
        configure.codec_data = Some(match self.codec {
            Codec::Opus => self.headers[0].clone(),
            _ => {
                let sizes: Vec<usize> = self.headers.iter().map(Vec::len).collect();
                let mut blob = lacing::encode(Lacing::Xiph, &sizes);
                for h in &self.headers {
                    blob.extend_from_slice(h);
                }
                blob
            }
        });
        ctx.post(Event::Configure(configure));
        if !meta.is_empty() {
            ctx.post(Event::Meta(meta));
        }
        self.parsed = true;
        Ok(())
    }

    fn parse_header_packets(&mut self) -> Result<(MetaInfo, ReplayGain), DemuxError> {
        let ident = &self.headers[0];
        match self.codec {
            Codec::Opus => {
                if ident.len() < 19 {
                    return Err(DemuxError::InvalidPage("short OpusHead"));
                }
                let channels = ident[9].max(1);
                self.preskip = u16::from_le_bytes([ident[10], ident[11]]) as u64;
                self.af = AudioFormat::new(sample::FLOAT, OPUS_RATE, channels);
                let tags = self.headers[1].strip_prefix(b"OpusTags").unwrap_or(&[]);
                Ok(parse_comments(tags, true))
            }
            _ => {
                if ident.len() < 30 {
                    return Err(DemuxError::InvalidPage("short vorbis identification header"));
                }
                let channels = ident[11].max(1);
                let rate = le_u32(ident, 12).unwrap_or(0);
                if rate == 0 {
                    return Err(DemuxError::InvalidPage("vorbis rate is zero"));
                }
                self.af = AudioFormat::new(sample::FLOAT, rate, channels);
                let tags = self.headers[1].strip_prefix(b"\x03vorbis").unwrap_or(&[]);
                Ok(parse_comments(tags, false))
            }
        }
    }

    /// Scan to the first granule position and derive the start offset.
    ///
    /// With `cache` the scanned packets are kept for replay, otherwise they are discarded and
    /// the caller rewinds.
    fn scan_start(&mut self, src: &mut dyn ByteSource, cache: bool) -> Result<i64, DemuxError> {
        let mut accumulated = 0i64;
        let mut start = 0;
        for _ in 0..START_SCAN_LIMIT {
            let Some(packet) = self.next_packet(src)? else {
                break;
            };
            let duration = self.packet_duration(&packet.data);
            let granule = packet.granule;
            if cache {
                self.cached.push_back(packet);
            }
            let Some(duration) = duration else {
                break;
            };
            accumulated += duration;
            if granule >= 0 {
                start = (granule - accumulated).max(0);
                break;
            }
        }
        Ok(start)
    }

    fn scan_length(&mut self, src: &mut dyn ByteSource) -> Result<i64, DemuxError> {
        let Some(size) = src.size() else {
            return Ok(-1);
        };
        let from = size.saturating_sub(TAIL_SCAN).max(self.data_start);
        src.position(from as i64, Whence::Begin)?;
        let mut last = -1;
        while let Some(page) = read_page(src)? {
            if Some(page.serial) == self.serial && page.granule >= 0 {
                last = page.granule;
            }
        }
        let length = last - self.granule_base();
        Ok(if last >= 0 && length > 0 { length } else { -1 })
    }

    fn emit(&mut self, ctx: &ReaderContext<'_>, mut packet: Packet, ogg: OggPacket) {
        let duration = self.packet_duration(&ogg.data);
        let position = if ogg.granule >= 0 {
            let end = ogg.granule - self.granule_base();
            self.next_position = end;
            duration.map_or(-1, |d| (end - d).max(0))
        } else {
            let position = self.next_position;
            self.next_position = match duration {
                Some(d) if position >= 0 => position + d,
                _ => -1,
            };
            position
        };
        packet.append(&ogg.data);
        packet.af = self.af;
        packet.stream = ctx.stream;
        packet.stream_position = position;
        packet.stream_length = self.stream_length;
        if let Some(previous) = self.held.replace(packet) {
            ctx.post(Event::Buffer(previous));
        }
        if ogg.eos {
            self.eos_seen = true;
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

    /// Find the start of the page following the last page whose granule is below `granule`.
    fn locate(&mut self, src: &mut dyn ByteSource, granule: i64, estimate: u64) -> Result<(u64, i64), DemuxError> {
        let mut from = estimate.max(self.data_start);
        loop {
            src.position(from as i64, Whence::Begin)?;
            let mut candidate = None;
            while let Some(page) = read_page(src)? {
                if Some(page.serial) != self.serial || page.granule < 0 {
                    continue;
                }
                if page.granule >= granule {
                    break;
                }
                candidate = Some((src.tell()?, page.granule));
            }
            if let Some(found) = candidate {
                return Ok(found);
            }
            if from == self.data_start {
                return Ok((self.data_start, self.granule_base()));
            }
            from = from.saturating_sub(2 * TAIL_SCAN).max(self.data_start);
        }
    }
}

impl Demuxer for OggReader {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Ogg
    }

    fn init(&mut self, _ctx: &mut ReaderContext<'_>) -> Result<(), DemuxError> {
        *self = OggReader::new();
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
            // Page reads resynchronise on the capture pattern, so an interrupted read only
            // loses the packet in flight.
            match self.next_packet(ctx.source) {
                Ok(Some(ogg)) if ogg.data.is_empty() => continue,
                Ok(Some(ogg)) => {
                    self.emit(ctx, packet, ogg);
                    return ReadStatus::Ok;
                }
                Ok(None) => {
                    self.finish(ctx);
                    return ReadStatus::Done;
                }
                Err(e) if e.is_interrupted() => {
                    self.partial.clear();
                    return ReadStatus::Ok;
                }
                Err(e) => return ReadStatus::Error(e),
            }
        }
    }

    fn can_seek(&self) -> bool {
        self.parsed && self.stream_length > 0
    }

    fn seek_offset(&self, pos: f64) -> Option<i64> {
        (self.stream_length > 0).then(|| (self.stream_length as f64 * pos.clamp(0.0, 1.0)) as i64)
    }

    fn seek(&mut self, ctx: &mut ReaderContext<'_>, offset: i64) -> bool {
        let Some(size) = ctx.source.size() else {
            return false;
        };
        if self.stream_length <= 0 {
            return false;
        }
        let preroll = if self.codec == Codec::Opus { OPUS_PREROLL } else { 0 };
        let target = (offset - preroll).max(0);
        let span = size.saturating_sub(self.data_start);
        let estimate = self.data_start
            + (span as f64 * target as f64 / self.stream_length as f64) as u64;
        let estimate = estimate.saturating_sub(TAIL_SCAN);

        let located = self.locate(ctx.source, target + self.granule_base(), estimate);
        let (start, granule) = match located {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "ogg seek failed");
                return false;
            }
        };
        if let Err(e) = ctx.source.position(start as i64, Whence::Begin) {
            tracing::warn!(error = %e, "ogg seek failed");
            return false;
        }
        tracing::debug!(offset, target, start, "ogg seek");
        self.packets.clear();
        self.cached.clear();
        self.partial.clear();
        self.held = None;
        self.eos_seen = false;
        self.finished = false;
        self.next_position = (granule - self.granule_base()).max(0);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opus_toc_durations() {
        // SILK 20 ms, one frame
        assert_eq!(opus_packet_duration(&[1 << 3]), Some(960));
        // CELT 20 ms, two frames
        assert_eq!(opus_packet_duration(&[(31 << 3) | 1]), Some(1920));
        // CELT 2.5 ms, code 3 with 4 frames
        assert_eq!(opus_packet_duration(&[(16 << 3) | 3, 4]), Some(480));
        assert_eq!(opus_packet_duration(&[]), None);
    }

    #[test]
    fn comments_yield_tags_and_gain() {
        let mut data = Vec::new();
        data.extend(3u32.to_le_bytes());
        data.extend(b"lib");
        let comments = ["TITLE=Song", "artist=Band", "REPLAYGAIN_TRACK_GAIN=-6.50 dB", "R128_ALBUM_GAIN=-512"];
        data.extend((comments.len() as u32).to_le_bytes());
        for c in comments {
            data.extend((c.len() as u32).to_le_bytes());
            data.extend(c.as_bytes());
        }
        let (meta, gain) = parse_comments(&data, true);
        assert_eq!(meta.title.as_deref(), Some("Song"));
        assert_eq!(meta.artist.as_deref(), Some("Band"));
        assert_eq!(gain.track_gain, -6.5);
        assert_eq!(gain.album_gain, 3.0);
    }
}

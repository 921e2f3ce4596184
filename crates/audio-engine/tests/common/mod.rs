#![allow(dead_code)]

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use audio_engine::config::{DeviceKind, OutputConfig};
use audio_engine::demux::ebml;
use audio_engine::demux::{Demuxer, ReadStatus, ReaderContext};
use audio_engine::error::{DeviceError, SourceError};
use audio_engine::event::Event;
use audio_engine::format::AudioFormat;
use audio_engine::output::{DeviceFactory, OutputDevice};
use audio_engine::packet::PacketPool;
use audio_engine::queue::EventQueue;
use audio_engine::signal::Signal;
use audio_engine::source::{ByteSource, SourceRegistry, StreamSource};

pub mod mkv {
    pub const EBML: u32 = 0x1a45dfa3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const SEGMENT: u32 = 0x18538067;
    pub const INFO: u32 = 0x1549a966;
    pub const TIMECODE_SCALE: u32 = 0x2ad7b1;
    pub const DURATION: u32 = 0x4489;
    pub const TRACKS: u32 = 0x1654ae6b;
    pub const TRACK_ENTRY: u32 = 0xae;
    pub const TRACK_NUMBER: u32 = 0xd7;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63a2;
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
}

pub fn element(id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = ebml::encode_id(id);
    out.extend(ebml::encode_size(body.len() as u64, None));
    out.extend_from_slice(body);
    out
}

pub fn uint(id: u32, value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    element(id, &bytes[skip..])
}

/// Unsigned element that always takes 8 bytes, so offsets can be computed before the value.
pub fn uint_wide(id: u32, value: u64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

pub fn float(id: u32, value: f64) -> Vec<u8> {
    element(id, &value.to_be_bytes())
}

pub fn string(id: u32, value: &str) -> Vec<u8> {
    element(id, value.as_bytes())
}

pub fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

pub struct MkvTrack {
    pub number: u64,
    pub kind: u64,
    pub codec_id: &'static str,
    pub private: Option<Vec<u8>>,
    pub rate: f64,
    pub channels: u64,
    pub bit_depth: u64,
}

impl MkvTrack {
    pub fn pcm(number: u64, rate: f64, channels: u64) -> Self {
        Self {
            number,
            kind: 2,
            codec_id: "A_PCM/INT/LIT",
            private: None,
            rate,
            channels,
            bit_depth: 16,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut body = concat(&[
            uint(mkv::TRACK_NUMBER, self.number),
            uint(mkv::TRACK_TYPE, self.kind),
            string(mkv::CODEC_ID, self.codec_id),
        ]);
        if let Some(private) = &self.private {
            body.extend(element(mkv::CODEC_PRIVATE, private));
        }
        if self.kind == 2 {
            let mut audio = concat(&[
                float(mkv::SAMPLING_FREQUENCY, self.rate),
                uint(mkv::CHANNELS, self.channels),
            ]);
            if self.bit_depth > 0 {
                audio.extend(uint(mkv::BIT_DEPTH, self.bit_depth));
            }
            body.extend(element(mkv::AUDIO, &audio));
        }
        element(mkv::TRACK_ENTRY, &body)
    }
}

/// One SimpleBlock: track, timecode relative to the cluster, flags byte and raw payload
/// (lace header included when laced).
pub struct MkvBlock {
    pub track: u64,
    pub relative: i16,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl MkvBlock {
    pub fn simple(track: u64, payload: Vec<u8>) -> Self {
        Self {
            track,
            relative: 0,
            flags: 0x80,
            payload,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut body = ebml::encode_size(self.track, None);
        body.extend(self.relative.to_be_bytes());
        body.push(self.flags);
        body.extend_from_slice(&self.payload);
        element(mkv::SIMPLE_BLOCK, &body)
    }
}

pub struct MkvCluster {
    pub timecode: u64,
    pub blocks: Vec<MkvBlock>,
}

impl MkvCluster {
    fn encode(&self) -> Vec<u8> {
        let mut body = uint(mkv::TIMECODE, self.timecode);
        for block in &self.blocks {
            body.extend(block.encode());
        }
        element(mkv::CLUSTER, &body)
    }
}

/// Build a Matroska file with millisecond timecodes. With `cue_track` every cluster gets a
/// cue point for that track.
pub fn matroska(tracks: &[MkvTrack], clusters: &[MkvCluster], duration_ms: Option<f64>, cue_track: Option<u64>) -> Vec<u8> {
    let header = element(mkv::EBML, &string(mkv::DOC_TYPE, "matroska"));

    let mut info = uint(mkv::TIMECODE_SCALE, 1_000_000);
    if let Some(d) = duration_ms {
        info.extend(float(mkv::DURATION, d));
    }
    let info = element(mkv::INFO, &info);
    let tracks = element(
        mkv::TRACKS,
        &tracks.iter().flat_map(MkvTrack::encode).collect::<Vec<u8>>(),
    );
    let encoded: Vec<Vec<u8>> = clusters.iter().map(MkvCluster::encode).collect();

    let cue_points = |positions: &[u64]| -> Vec<u8> {
        let Some(track) = cue_track else {
            return Vec::new();
        };
        let points: Vec<u8> = clusters
            .iter()
            .zip(positions)
            .flat_map(|(cluster, pos)| {
                let track_positions = element(
                    mkv::CUE_TRACK_POSITIONS,
                    &concat(&[uint_wide(mkv::CUE_TRACK, track), uint_wide(mkv::CUE_CLUSTER_POSITION, *pos)]),
                );
                element(
                    mkv::CUE_POINT,
                    &concat(&[uint_wide(mkv::CUE_TIME, cluster.timecode), track_positions]),
                )
            })
            .collect();
        element(mkv::CUES, &points)
    };

    // Cue values are fixed width, so a dry run gives the final size.
    let cues_len = cue_points(&vec![0; clusters.len()]).len();
    let mut offset = (info.len() + tracks.len() + cues_len) as u64;
    let mut positions = Vec::with_capacity(encoded.len());
    for cluster in &encoded {
        positions.push(offset);
        offset += cluster.len() as u64;
    }
    let cues = cue_points(&positions);

    let mut segment = concat(&[info, tracks, cues]);
    for cluster in encoded {
        segment.extend(cluster);
    }
    concat(&[header, element(mkv::SEGMENT, &segment)])
}

pub fn opus_head(channels: u8, preskip: u16) -> Vec<u8> {
    let mut head = b"OpusHead".to_vec();
    head.push(1);
    head.push(channels);
    head.extend(preskip.to_le_bytes());
    head.extend(48_000u32.to_le_bytes());
    head.extend(0i16.to_le_bytes());
    head.push(0);
    head
}

pub fn opus_tags(comments: &[&str]) -> Vec<u8> {
    let mut tags = b"OpusTags".to_vec();
    tags.extend(4u32.to_le_bytes());
    tags.extend(b"test");
    tags.extend((comments.len() as u32).to_le_bytes());
    for c in comments {
        tags.extend((c.len() as u32).to_le_bytes());
        tags.extend(c.as_bytes());
    }
    tags
}

/// A 20 ms CELT Opus packet (960 samples at 48 kHz); the body is not decodable audio.
pub fn opus_packet(marker: u8) -> Vec<u8> {
    vec![31 << 3, marker, marker, marker]
}

fn ogg_crc(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &b in data {
        crc ^= (b as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04c1_1db7 } else { crc << 1 };
        }
    }
    crc
}

pub struct OggWriter {
    serial: u32,
    sequence: u32,
    pub data: Vec<u8>,
}

impl OggWriter {
    pub fn new(serial: u32) -> Self {
        Self {
            serial,
            sequence: 0,
            data: Vec::new(),
        }
    }

    /// Write one page holding whole `packets`.
    pub fn page(&mut self, flags: u8, granule: i64, packets: &[Vec<u8>]) {
        let mut segments = Vec::new();
        for p in packets {
            segments.extend(std::iter::repeat_n(255u8, p.len() / 255));
            segments.push((p.len() % 255) as u8);
        }
        let mut page = b"OggS".to_vec();
        page.push(0);
        page.push(flags);
        page.extend(granule.to_le_bytes());
        page.extend(self.serial.to_le_bytes());
        page.extend(self.sequence.to_le_bytes());
        page.extend(0u32.to_le_bytes());
        page.push(segments.len() as u8);
        page.extend(segments);
        for p in packets {
            page.extend_from_slice(p);
        }
        let crc = ogg_crc(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        self.sequence += 1;
        self.data.extend(page);
    }
}

/// Ogg Opus stream with `pages` data pages of four packets each. The first data page ends at
/// granule `first_granule`.
pub fn ogg_opus(preskip: u16, pages: usize, first_granule: i64, comments: &[&str]) -> Vec<u8> {
    let mut w = OggWriter::new(0x5eed);
    w.page(0x02, 0, &[opus_head(2, preskip)]);
    w.page(0, 0, &[opus_tags(comments)]);
    for i in 0..pages {
        let packets: Vec<Vec<u8>> = (0..4).map(|j| opus_packet((i * 4 + j) as u8)).collect();
        let flags = if i + 1 == pages { 0x04 } else { 0 };
        w.page(flags, first_granule + i as i64 * 3840, &packets);
    }
    w.data
}

pub fn seekable(data: Vec<u8>) -> StreamSource<Cursor<Vec<u8>>> {
    StreamSource::new(Cursor::new(data))
}

/// Drive `reader` until it reports the end of the stream, returning everything it posted.
pub fn read_all(reader: &mut dyn Demuxer, source: &mut dyn ByteSource) -> Result<Vec<Event>, String> {
    let output = EventQueue::new();
    let control = EventQueue::new();
    let pool = PacketPool::new(4096, 512);
    let mut ctx = ReaderContext {
        source,
        output: &output,
        control: &control,
        stream: 1,
    };
    reader.init(&mut ctx).map_err(|e| e.to_string())?;
    let mut events = Vec::new();
    for _ in 0..10_000 {
        let Some(packet) = pool.try_acquire() else {
            return Err("packet pool exhausted".into());
        };
        let status = reader.process(&mut ctx, packet);
        events.extend(std::iter::from_fn(|| output.pop()));
        match status {
            ReadStatus::Ok => {}
            ReadStatus::Done => return Ok(events),
            ReadStatus::Error(e) => return Err(e.to_string()),
        }
    }
    Err("reader did not finish".into())
}

#[derive(Debug, Default)]
pub struct DeviceLog {
    pub opens: usize,
    pub closes: usize,
    pub configures: Vec<AudioFormat>,
    pub bytes: Vec<u8>,
}

/// Device that accepts everything instantly and records what it was asked to do.
pub struct RecordingDevice {
    log: Arc<Mutex<DeviceLog>>,
    af: AudioFormat,
}

impl OutputDevice for RecordingDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Null
    }

    fn format(&self) -> AudioFormat {
        self.af
    }

    fn configure(&mut self, af: &AudioFormat) -> Result<(), DeviceError> {
        self.log.lock().unwrap().configures.push(*af);
        self.af = *af;
        Ok(())
    }

    fn write(&mut self, data: &[u8], frames: usize) -> Result<usize, DeviceError> {
        self.log.lock().unwrap().bytes.extend_from_slice(data);
        Ok(frames)
    }

    fn delay(&mut self) -> usize {
        0
    }

    fn discard(&mut self) {}

    fn drain(&mut self) {}

    fn pause(&mut self, _paused: bool) {}

    fn volume(&mut self, _volume: f32) -> bool {
        false
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
        self.af.reset();
    }
}

/// Device factory whose `Null` kind opens a [`RecordingDevice`] writing into `log`.
pub fn recording_devices(log: Arc<Mutex<DeviceLog>>) -> DeviceFactory {
    let mut devices = DeviceFactory::new();
    devices.register(
        DeviceKind::Null,
        Arc::new(move |_: &OutputConfig| -> Result<Box<dyn OutputDevice>, DeviceError> {
            log.lock().unwrap().opens += 1;
            Ok(Box::new(RecordingDevice {
                log: log.clone(),
                af: AudioFormat::default(),
            }))
        }),
    );
    devices
}

/// Source registry serving `files` under `mem://<name>`.
pub fn memory_sources(files: Vec<(&'static str, Vec<u8>)>) -> SourceRegistry {
    let files = Arc::new(files);
    let mut sources = SourceRegistry::new();
    sources.register(
        "mem",
        Arc::new(move |url: &str, _abort: &Signal| -> Result<Box<dyn ByteSource>, SourceError> {
            let name = url.trim_start_matches("mem://");
            match files.iter().find(|(n, _)| *n == name) {
                Some((_, data)) => Ok(Box::new(seekable(data.clone()))),
                None => Err(SourceError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    name.to_string(),
                ))),
            }
        }),
    );
    sources
}

//! System audio output through CPAL.
//!
//! The device owns a [`SampleRing`] of `f32` samples at the hardware rate:
//! - `write` converts stream PCM to `f32`, resamples when the hardware rate differs, and pushes
//!   what fits into the ring
//! - the CPAL callback drains the ring, maps channels, applies volume and converts to the
//!   hardware sample format
//!
//! Each ring pop posts [`DeviceEvent::Writable`]; stream errors post [`DeviceEvent::Error`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::config::{DeviceKind, OutputConfig};
use crate::error::DeviceError;
use crate::format::{AudioFormat, sample};
use crate::output::convert;
use crate::output::resample::StreamResampler;
use crate::output::ring::{SampleRing, ring_capacity};
use crate::output::{DeviceEvent, OutputDevice};

/// Frames the callback pulls from the ring per refill.
const REFILL_FRAMES: usize = 1024;

pub struct CpalDevice {
    device: cpal::Device,
    cfg: OutputConfig,
    af: AudioFormat,
    device_rate: u32,
    stream: Option<cpal::Stream>,
    ring: Option<Arc<SampleRing>>,
    resampler: Option<StreamResampler>,
    /// Converted samples the ring had no room for.
    backlog: Vec<f32>,
    paused: Arc<AtomicBool>,
    volume: Arc<AtomicU32>,
    events_tx: Sender<DeviceEvent>,
    events_rx: Receiver<DeviceEvent>,
}

impl CpalDevice {
    pub fn open(cfg: &OutputConfig) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = pick_device(&host, cfg.name.as_deref())
            .map_err(|e| DeviceError::Unavailable(format!("{e:#}")))?;
        if let Ok(desc) = device.description() {
            tracing::info!(device = %desc.name(), "output device selected");
        }
        let (events_tx, events_rx) = bounded(4);
        Ok(Self {
            device,
            cfg: cfg.clone(),
            af: AudioFormat::default(),
            device_rate: 0,
            stream: None,
            ring: None,
            resampler: None,
            backlog: Vec::new(),
            paused: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            events_tx,
            events_rx,
        })
    }

    fn ratio(&self) -> f64 {
        if self.af.rate == 0 {
            1.0
        } else {
            self.device_rate as f64 / self.af.rate as f64
        }
    }

    /// Move backlog into the ring. Returns `true` once the backlog is empty.
    fn push_backlog(&mut self, ring: &SampleRing) -> bool {
        if !self.backlog.is_empty() {
            let taken = ring.push_available(&self.backlog);
            self.backlog.drain(..taken);
        }
        self.backlog.is_empty()
    }

    fn start(&mut self, af: &AudioFormat) -> Result<(), DeviceError> {
        let supported = pick_output_config(&self.device, af.rate, af.format)
            .map_err(|e| DeviceError::Backend(format!("{e:#}")))?;
        self.device_rate = supported.sample_rate();
        let mut stream_cfg: cpal::StreamConfig = supported.config();
        if let Some(bs) = pick_buffer_size(&supported) {
            stream_cfg.buffer_size = bs;
        }

        let channels = af.channels as usize;
        let max_samples = ring_capacity(self.device_rate, channels, self.cfg.buffer_seconds);
        let ring = Arc::new(SampleRing::new(channels, max_samples, Some(self.events_tx.clone())));

        self.resampler = if self.device_rate != af.rate {
            Some(StreamResampler::new(af.rate, self.device_rate, channels, self.cfg.chunk_frames)?)
        } else {
            None
        };

        let callback = CallbackConfig {
            paused: self.paused.clone(),
            volume: self.volume.clone(),
            events: self.events_tx.clone(),
        };
        let stream = build_output_stream(&self.device, &stream_cfg, supported.sample_format(), &ring, callback)
            .map_err(|e| DeviceError::Backend(format!("{e:#}")))?;
        stream
            .play()
            .map_err(|e| DeviceError::Backend(format!("start stream: {e}")))?;

        tracing::info!(
            stream_format = %af,
            device_rate = self.device_rate,
            device_channels = stream_cfg.channels,
            device_sample_format = ?supported.sample_format(),
            resampling = self.resampler.is_some(),
            "output stream started"
        );
        self.stream = Some(stream);
        self.ring = Some(ring);
        Ok(())
    }
}

impl OutputDevice for CpalDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpal
    }

    fn format(&self) -> AudioFormat {
        self.af
    }

    fn configure(&mut self, af: &AudioFormat) -> Result<(), DeviceError> {
        if !af.is_native_order() || !matches!(af.format, sample::FLOAT | sample::S32 | sample::S16) {
            return Err(DeviceError::UnsupportedFormat(af.to_string()));
        }
        if *af == self.af && self.stream.is_some() {
            return Ok(());
        }
        self.close();
        self.start(af)?;
        self.af = *af;
        Ok(())
    }

    fn write(&mut self, data: &[u8], frames: usize) -> Result<usize, DeviceError> {
        let Some(ring) = self.ring.clone() else {
            return Err(DeviceError::Write("device is not configured".into()));
        };
        if !self.push_backlog(&ring) {
            return Ok(0);
        }
        let frame = self.af.frame_size();
        let room = (ring.space_frames() as f64 / self.ratio()) as usize;
        let accept = frames.min(room).min(data.len() / frame.max(1));
        if accept == 0 {
            return Ok(0);
        }

        let samples = convert::to_f32(&self.af, &data[..accept * frame]);
        match self.resampler.as_mut() {
            Some(rs) => rs.process(&samples, &mut self.backlog)?,
            None => self.backlog = samples,
        }
        self.push_backlog(&ring);
        Ok(accept)
    }

    fn delay(&mut self) -> usize {
        let channels = self.af.channels.max(1) as usize;
        let device_frames = self.ring.as_ref().map_or(0, |r| r.len_frames()) + self.backlog.len() / channels;
        let pending = self.resampler.as_ref().map_or(0, |r| r.pending_frames());
        (device_frames as f64 / self.ratio()) as usize + pending
    }

    fn discard(&mut self) {
        if let Some(ring) = &self.ring {
            ring.clear();
        }
        self.backlog.clear();
        if let Some(rs) = self.resampler.as_mut() {
            rs.reset();
        }
    }

    fn drain(&mut self) {
        let Some(ring) = self.ring.clone() else {
            return;
        };
        if let Some(rs) = self.resampler.as_mut() {
            if let Err(e) = rs.finish(&mut self.backlog) {
                tracing::warn!(error = %e, "resampler flush failed");
            }
        }
        let budget = Duration::from_secs_f32(self.cfg.buffer_seconds.max(0.1) * 2.0 + 1.0);
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline && !self.paused.load(Ordering::Relaxed) {
            if self.push_backlog(&ring) && ring.len_frames() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        tracing::debug!(left = ring.len_frames(), "drain gave up");
    }

    fn pause(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    fn volume(&mut self, volume: f32) -> bool {
        self.volume.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        true
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("output stream closed");
        }
        self.ring = None;
        self.resampler = None;
        self.backlog.clear();
        self.af.reset();
        while self.events_rx.try_recv().is_ok() {}
    }

    fn events(&self) -> Option<Receiver<DeviceEvent>> {
        Some(self.events_rx.clone())
    }
}

/// Names of the output devices of the default host.
pub fn output_device_names() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.output_devices().context("No output devices")?;
    let mut out = Vec::new();
    for d in devices {
        out.push(d.description()?.name().to_string());
    }
    Ok(out)
}

/// Pick the first output device whose name contains `needle` (case-insensitive), or the host
/// default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|desc| matches_device_name(&desc.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Pick the output config closest to a stream at `rate` in `format`.
///
/// Prefers the stream rate itself, then the highest rate below it, then the lowest above it.
/// Among equal rates the hardware format matching the stream encoding wins, then float, then
/// wider integers.
pub fn pick_output_config(
    device: &cpal::Device,
    rate: u32,
    format: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in device.supported_output_configs()? {
        let chosen = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), rate);
        let candidate = Candidate {
            rate: chosen,
            below: chosen <= rate,
            rank: sample_format_rank(range.sample_format(), format),
        };
        if best.as_ref().is_none_or(|(b, _)| candidate.beats(b, rate)) {
            best = Some((candidate, range.with_sample_rate(chosen)));
        }
    }
    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Prefer a large fixed buffer to reduce underruns, capped at 16k frames.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    rate: u32,
    below: bool,
    rank: u8,
}

impl Candidate {
    fn beats(&self, other: &Candidate, target: u32) -> bool {
        let exact = (self.rate == target, other.rate == target);
        if exact.0 != exact.1 {
            return exact.0;
        }
        if self.below != other.below {
            return self.below;
        }
        if self.rate != other.rate {
            return if self.below {
                self.rate > other.rate
            } else {
                self.rate < other.rate
            };
        }
        self.rank < other.rank
    }
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(device: cpal::SampleFormat, stream: u16) -> u8 {
    let matching = match stream {
        sample::FLOAT => cpal::SampleFormat::F32,
        sample::S32 => cpal::SampleFormat::I32,
        _ => cpal::SampleFormat::I16,
    };
    if device == matching {
        return 0;
    }
    match device {
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::I16 => 3,
        cpal::SampleFormat::U16 => 4,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

/// Shared state between the device and its realtime callback.
struct CallbackConfig {
    /// While set the callback plays silence and leaves the ring untouched.
    paused: Arc<AtomicBool>,
    /// Linear gain as `f32` bits.
    volume: Arc<AtomicU32>,
    events: Sender<DeviceEvent>,
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    ring: &Arc<SampleRing>,
    cfg: CallbackConfig,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, ring, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, ring, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, ring, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, ring, cfg),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: &Arc<SampleRing>,
    cfg: CallbackConfig,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let state = Mutex::new(CallbackState {
        pos: 0,
        src_channels: ring.channels(),
        src: Vec::new(),
    });
    let ring_cb = ring.clone();
    let CallbackConfig { paused, volume, events } = cfg;
    let err_events = events.clone();

    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        let _ = err_events.try_send(DeviceEvent::Error(err.to_string()));
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }
            let gain = f32::from_bits(volume.load(Ordering::Relaxed));
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);

            let frames = data.len() / channels_out.max(1);
            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    match ring_cb.pop(REFILL_FRAMES) {
                        Some(v) => st.src = v,
                        None => {
                            st.src.clear();
                            data[frame * channels_out..].fill(silence);
                            break;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let s = next_sample_mapped(&mut st, channels_out, ch) * gain;
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(s);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Samples popped from the ring and not yet copied to the hardware buffer.
struct CallbackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Output sample for `dst_ch` of the current frame.
///
/// Mono is duplicated, stereo folds down to mono by averaging, other layouts clamp to the last
/// available channel. `pos` advances after the last destination channel.
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }
    let base = st.pos;
    let get = |ch: usize| st.src.get(base + ch).copied().filter(|_| ch < st.src_channels).unwrap_or(0.0);

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get(0) + get(1)),
        (1, _) => get(0),
        _ => get(dst_ch.min(st.src_channels.saturating_sub(1))),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

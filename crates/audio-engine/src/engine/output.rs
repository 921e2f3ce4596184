//! Output stage: paces PCM into the output device and keeps the clock.
//!
//! The loop reacts to two sources at once: its own event queue and the device's readiness
//! channel. While converted data is waiting for room in the device only control events are
//! taken from the queue, so data stays in order and back-pressure reaches the decoder.
//!
//! States:
//! - `Normal`: writing whatever arrives
//! - `Draining`: the stream ended; the device delay is polled until it runs dry
//! - `Pausing`: the device is paused; draining resumes on unpause

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::config::{EngineConfig, OutputConfig};
use crate::engine::thread::Notifier;
use crate::error::DeviceError;
use crate::event::{ConfigureEvent, EngineState, Event, EventKind, Notification};
use crate::format::{AudioFormat, ReplayGain, ReplayGainMode};
use crate::output::crossfade::Crossfade;
use crate::output::timer::{FrameTimers, TimerAction};
use crate::output::{DeviceEvent, DeviceFactory, OutputDevice, convert};
use crate::packet::Packet;
use crate::queue::{EventQueue, Post};

/// Events that must wait behind data already taken from the queue.
const DATA_KINDS: [EventKind; 5] = [
    EventKind::Buffer,
    EventKind::Configure,
    EventKind::Meta,
    EventKind::End,
    EventKind::Eos,
];

const DRAIN_POLL: Duration = Duration::from_millis(200);
const WRITE_RETRY: Duration = Duration::from_millis(20);
const CLOCK_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputState {
    Normal,
    Draining,
    Pausing,
}

/// Device-format bytes not yet accepted by the device.
struct PendingWrite {
    data: Vec<u8>,
    cursor: usize,
}

pub(crate) struct OutputStage {
    fifo: Arc<EventQueue>,
    input: Arc<EventQueue>,
    devices: DeviceFactory,
    cfg: OutputConfig,
    notify: Notifier,
    device: Option<Box<dyn OutputDevice>>,
    device_events: Option<Receiver<DeviceEvent>>,
    /// Format the device was configured with.
    device_af: AudioFormat,
    /// Format of the stream being played.
    stream_af: AudioFormat,
    state: OutputState,
    playing: bool,
    /// Stream whose `End` is being drained.
    draining: Option<u32>,
    next_drain_poll: Instant,
    pending: Option<PendingWrite>,
    /// Frames handed to the device since it was opened.
    written: u64,
    stream: u32,
    /// Stream frame position at the end of the written data, -1 when unknown.
    position: i64,
    length: i64,
    last_time: Option<(u32, u32)>,
    timers: FrameTimers,
    gain_mode: ReplayGainMode,
    replay_gain: ReplayGain,
    gain: f32,
    crossfade: Crossfade,
    /// The head of the current stream is being mixed with the previous tail.
    fading_in: bool,
    volume: Option<f32>,
}

impl OutputStage {
    pub(crate) fn new(
        fifo: Arc<EventQueue>,
        input: Arc<EventQueue>,
        devices: DeviceFactory,
        config: &EngineConfig,
        notify: Notifier,
    ) -> Self {
        Self {
            fifo,
            input,
            devices,
            cfg: config.output.clone(),
            notify,
            device: None,
            device_events: None,
            device_af: AudioFormat::default(),
            stream_af: AudioFormat::default(),
            state: OutputState::Normal,
            playing: false,
            draining: None,
            next_drain_poll: Instant::now(),
            pending: None,
            written: 0,
            stream: 0,
            position: -1,
            length: -1,
            last_time: None,
            timers: FrameTimers::new(),
            gain_mode: config.replay_gain,
            replay_gain: ReplayGain::default(),
            gain: 1.0,
            crossfade: Crossfade::new(config.crossfade_ms),
            fading_in: false,
            volume: None,
        }
    }

    pub(crate) fn run(mut self) {
        loop {
            let event = if self.pending.is_some() {
                self.fifo.pop_if_not(&DATA_KINDS)
            } else {
                self.fifo.pop()
            };
            match event {
                Some(event) => {
                    if !self.handle(event) {
                        break;
                    }
                }
                None => {
                    self.service();
                    self.wait();
                }
            }
        }
        self.close_device();
        tracing::debug!("output stage exiting");
    }

    fn set_state(&mut self, state: OutputState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "output state");
            self.state = state;
        }
    }

    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Configure(cfg) => self.on_configure(cfg),
            Event::Buffer(packet) => self.on_buffer(packet),
            Event::Meta(meta) => self.timers.add(self.written, TimerAction::Meta(meta)),
            Event::End { stream } => self.on_end(stream),
            Event::Flush { offset, close } => self.on_flush(offset, close),
            Event::Pause => self.on_pause(),
            Event::Volume(volume) => {
                let volume = volume.clamp(0.0, 1.0);
                self.volume = Some(volume);
                let supported = self.device.as_mut().is_none_or(|d| d.volume(volume));
                self.notify.send(Notification::Volume(supported.then_some(volume)));
            }
            Event::SetReplayGain(mode) => {
                self.gain_mode = mode;
                self.update_gain();
            }
            Event::SetCrossFade(ms) => {
                self.crossfade.set_duration(ms);
                if ms == 0 {
                    self.fading_in = false;
                    if let Some((af, tail)) = self.crossfade.take_tail() {
                        self.queue_pcm(&af, tail);
                    }
                }
            }
            Event::SetOutputConfig(cfg) => self.on_output_config(cfg),
            Event::Quit => return false,
            other => tracing::debug!(kind = ?other.kind(), "output stage ignores event"),
        }
        true
    }

    fn on_configure(&mut self, cfg: ConfigureEvent) {
        let af = cfg.af;
        if self.draining.take().is_some() && self.state == OutputState::Draining {
            self.set_state(OutputState::Normal);
        }

        self.fading_in = self.crossfade.can_mix(&af);
        if !self.fading_in {
            if let Some((tail_af, tail)) = self.crossfade.take_tail() {
                if self.device.is_some() {
                    // Play the tail out in the old format, then handle this event again.
                    self.queue_pcm(&tail_af, tail);
                    self.fifo.post(Event::Configure(cfg), Post::Front);
                    return;
                }
            }
        }

        self.replay_gain = cfg.replay_gain;
        self.update_gain();
        self.length = cfg.stream_length;
        self.position = -1;
        self.last_time = None;

        if !self.configure_device(&af) {
            return;
        }
        self.timers.add(self.written, TimerAction::Bos);
        if !self.playing {
            self.playing = true;
            if self.state != OutputState::Pausing {
                self.notify.send(Notification::State(EngineState::Playing));
            }
        }
    }

    /// Open the device if needed and make it accept `af`. Returns `false` after reporting a
    /// failure.
    fn configure_device(&mut self, af: &AudioFormat) -> bool {
        if self.device.is_none() {
            match self.devices.open(&self.cfg) {
                Ok(mut device) => {
                    tracing::info!(kind = ?device.kind(), "output device opened");
                    if let Some(volume) = self.volume {
                        device.volume(volume);
                    }
                    device.pause(self.state == OutputState::Pausing);
                    self.device_events = device.events();
                    self.device = Some(device);
                    self.written = 0;
                }
                Err(e) => {
                    self.fail_output(format!("Unable to open output device: {e}"));
                    return false;
                }
            }
        }
        let Some(device) = self.device.as_mut() else {
            return false;
        };

        if self.stream_af == *af && !device.format().is_undefined() {
            tracing::debug!(format = %af, "format unchanged, device kept");
            return true;
        }

        if !self.stream_af.is_undefined() && device.delay() > 0 {
            // Let the previous stream finish on the old configuration.
            device.drain();
        }

        let negotiated = negotiate(device.as_mut(), af);
        match negotiated {
            Ok(device_af) if convert::supported(af, &device_af) => {
                tracing::info!(stream = %af, device = %device_af, "output configured");
                self.device_af = device_af;
                self.stream_af = *af;
                true
            }
            Ok(device_af) => {
                self.fail_output(format!("Output device cannot play {af} (offered {device_af})."));
                false
            }
            Err(e) => {
                self.fail_output(format!("Unable to configure output device for {af}: {e}"));
                false
            }
        }
    }

    fn on_buffer(&mut self, packet: Packet) {
        if self.device.is_none() || self.stream_af.is_undefined() {
            return;
        }
        let af = packet.af;
        if af != self.stream_af {
            tracing::warn!(packet = %af, stream = %self.stream_af, "buffer does not match stream format");
            return;
        }
        if self.state == OutputState::Draining {
            self.draining = None;
            self.set_state(OutputState::Normal);
        }

        let frame = af.frame_size().max(1);
        let mut data = packet.data()[..packet.size() / frame * frame].to_vec();
        let (position, length) = (packet.stream_position, packet.stream_length);
        self.stream = packet.stream;
        drop(packet);

        convert::apply_gain(&af, &mut data, self.gain);

        if self.fading_in {
            self.crossfade.mix(&af, &mut data);
            if !self.crossfade.is_recording() {
                self.fading_in = false;
            }
        }

        let mut frames = data.len() / frame;
        let window = self.crossfade.window_frames(&af) as i64;
        if window > 0 && !self.fading_in && length > 0 && position >= 0 {
            let fade_start = (length - window).max(0);
            if position + frames as i64 > fade_start {
                let keep = (fade_start - position).clamp(0, frames as i64) as usize;
                self.crossfade.record(&af, &data[keep * frame..]);
                data.truncate(keep * frame);
                frames = keep;
            }
        }

        if position >= 0 {
            self.position = position + frames as i64;
        } else if self.position >= 0 {
            self.position += frames as i64;
        }
        self.length = length;
        self.queue_pcm(&af, data);
    }

    /// Convert stream PCM into the device format and queue it for writing.
    fn queue_pcm(&mut self, af: &AudioFormat, data: Vec<u8>) {
        if data.is_empty() || self.device_af.is_undefined() {
            return;
        }
        let converted = if convert::is_identity(af, &self.device_af) {
            data
        } else {
            let mut out = Vec::with_capacity(data.len());
            convert::convert(af, &self.device_af, &data, &mut out);
            out
        };
        match self.pending.as_mut() {
            Some(pending) => {
                pending.data.drain(..pending.cursor);
                pending.cursor = 0;
                pending.data.extend_from_slice(&converted);
            }
            None => {
                self.pending = Some(PendingWrite {
                    data: converted,
                    cursor: 0,
                })
            }
        }
    }

    fn on_end(&mut self, stream: u32) {
        if self.device.is_none() || self.stream_af.is_undefined() {
            self.input.post(Event::End { stream }, Post::Back);
            return;
        }
        let rate = self.device_af.rate as u64;
        self.timers.add(self.written.saturating_sub(rate), TimerAction::Eos { stream });
        self.draining = Some(stream);
        self.next_drain_poll = Instant::now();
        if self.state != OutputState::Pausing {
            self.set_state(OutputState::Draining);
        }
    }

    fn on_flush(&mut self, offset: i64, close: bool) {
        if let Some(device) = self.device.as_mut() {
            device.discard();
        }
        self.pending = None;
        self.crossfade.reset();
        self.fading_in = false;
        self.timers.clear();
        self.last_time = None;
        self.draining = None;

        if close {
            self.close_device();
            self.stream_af.reset();
            self.position = -1;
            let was_active = self.playing || self.state == OutputState::Pausing;
            self.playing = false;
            self.set_state(OutputState::Normal);
            if was_active {
                self.notify.send(Notification::State(EngineState::Ready));
            }
        } else {
            self.position = offset;
            if self.state == OutputState::Draining {
                self.set_state(OutputState::Normal);
            }
        }
    }

    fn on_pause(&mut self) {
        if self.state == OutputState::Pausing {
            let resumed = if self.draining.is_some() {
                OutputState::Draining
            } else {
                OutputState::Normal
            };
            self.set_state(resumed);
            if let Some(device) = self.device.as_mut() {
                device.pause(false);
            }
            let state = if self.playing {
                EngineState::Playing
            } else {
                EngineState::Ready
            };
            self.notify.send(Notification::State(state));
        } else {
            self.set_state(OutputState::Pausing);
            if let Some(device) = self.device.as_mut() {
                device.pause(true);
            }
            self.notify.send(Notification::State(EngineState::Pausing));
        }
    }

    fn on_output_config(&mut self, cfg: OutputConfig) {
        tracing::info!(device = ?cfg.device, name = ?cfg.name, "output configuration changed");
        self.cfg = cfg;
        if self.device.is_none() {
            return;
        }
        if let Some(device) = self.device.as_mut() {
            device.drain();
        }
        let old_device_af = self.device_af;
        let af = self.stream_af;
        self.close_device();
        self.stream_af.reset();
        if af.is_undefined() || !self.configure_device(&af) {
            self.pending = None;
            return;
        }
        if self.device_af != old_device_af {
            self.pending = None;
        }
    }

    fn update_gain(&mut self) {
        self.gain = self.replay_gain.scale(self.gain_mode).map_or(1.0, |s| s as f32);
    }

    fn service(&mut self) {
        if !self.poll_device_events() {
            return;
        }
        self.write_pending();
        self.update_clock();
        if self.state == OutputState::Draining {
            self.poll_drain();
        }
    }

    /// Returns `false` when the device failed.
    fn poll_device_events(&mut self) -> bool {
        let Some(events) = self.device_events.as_ref() else {
            return true;
        };
        let failure = events.try_iter().find_map(|event| match event {
            DeviceEvent::Error(message) => Some(message),
            DeviceEvent::Writable => None,
        });
        match failure {
            Some(message) => {
                self.fail_output(format!("Output device error: {message}"));
                false
            }
            None => true,
        }
    }

    fn write_pending(&mut self) {
        let (Some(pending), Some(device)) = (self.pending.as_mut(), self.device.as_mut()) else {
            return;
        };
        let frame = self.device_af.frame_size().max(1);
        let max_chunk = (self.device_af.rate as usize / 2).max(1);
        let mut failure = None;
        loop {
            let left = (pending.data.len() - pending.cursor) / frame;
            if left == 0 {
                break;
            }
            let n = left.min(max_chunk);
            let chunk = &pending.data[pending.cursor..pending.cursor + n * frame];
            match device.write(chunk, n) {
                Ok(0) => return,
                Ok(taken) => {
                    let taken = taken.min(n);
                    pending.cursor += taken * frame;
                    self.written += taken as u64;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.pending = None;
        if let Some(e) = failure {
            self.fail_output(format!("Output device error: {e}"));
        }
    }

    /// Frames converted for the device but not yet accepted by it.
    fn pending_frames(&self) -> i64 {
        let frame = self.device_af.frame_size().max(1);
        self.pending
            .as_ref()
            .map_or(0, |p| ((p.data.len() - p.cursor) / frame) as i64)
    }

    fn update_clock(&mut self) {
        let unwritten = self.pending_frames();
        let Some(device) = self.device.as_mut() else {
            return;
        };
        if self.stream_af.is_undefined() {
            return;
        }
        let delay = device.delay() as u64;
        let played = self.written.saturating_sub(delay);
        for action in self.timers.expire(played) {
            self.fire(action);
        }

        let rate = self.device_af.rate.max(1) as i64;
        if self.position < 0 {
            return;
        }
        let position = ((self.position - delay as i64 - unwritten).max(0) / rate) as u32;
        let length = if self.length > 0 { (self.length / rate) as u32 } else { 0 };
        if self.last_time != Some((position, length)) {
            self.last_time = Some((position, length));
            self.notify.send(Notification::Time { position, length });
        }
    }

    fn fire(&mut self, action: TimerAction) {
        match action {
            TimerAction::Bos => self.notify.send(Notification::Bos),
            TimerAction::Meta(meta) => self.notify.send(Notification::Meta(meta)),
            TimerAction::Eos { .. } => self.input.post(Event::Eos, Post::Back),
        }
    }

    fn poll_drain(&mut self) {
        let now = Instant::now();
        if now < self.next_drain_poll || self.pending.is_some() {
            return;
        }
        self.next_drain_poll = now + DRAIN_POLL;
        let quarter = (self.device_af.rate / 4) as usize;
        if let Some(device) = self.device.as_mut() {
            let delay = device.delay();
            if delay >= quarter {
                tracing::trace!(delay, "draining");
                return;
            }
        }
        if let Some((af, tail)) = self.crossfade.take_tail() {
            // Nothing followed the stream; its withheld tail plays unmixed.
            self.queue_pcm(&af, tail);
            return;
        }
        self.finish_drain();
    }

    fn finish_drain(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.drain();
        }
        for action in self.timers.fire_all() {
            self.fire(action);
        }
        self.close_device();
        self.stream_af.reset();
        self.position = -1;
        self.last_time = None;
        self.playing = false;
        self.set_state(OutputState::Normal);
        if let Some(stream) = self.draining.take() {
            tracing::debug!(stream, "stream drained");
            self.input.post(Event::End { stream }, Post::Back);
        }
        self.notify.send(Notification::State(EngineState::Ready));
    }

    /// Close the device, stop the stream and tell the input stage to close.
    fn fail_output(&mut self, message: String) {
        self.close_device();
        self.stream_af.reset();
        self.pending = None;
        self.crossfade.reset();
        self.fading_in = false;
        self.timers.clear();
        self.draining = None;
        if self.state == OutputState::Draining {
            self.set_state(OutputState::Normal);
        }
        self.input.post(Event::Close, Post::Front);
        self.notify.error(message);
    }

    fn close_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
            tracing::debug!(written = self.written, "output device closed");
        }
        self.device_events = None;
        self.device_af.reset();
    }

    fn wait(&self) {
        let timeout = if self.pending.is_some() {
            Some(WRITE_RETRY)
        } else if self.state == OutputState::Draining {
            Some(
                self.next_drain_poll
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_millis(1)),
            )
        } else if self.device.is_some() && self.state != OutputState::Pausing {
            Some(CLOCK_TICK)
        } else {
            None
        };
        // Queued data must not wake a writer that is waiting for device room.
        let signal = if self.pending.is_some() {
            self.fifo.control_signal()
        } else {
            self.fifo.signal()
        };
        match (&self.device_events, timeout) {
            (Some(events), timeout) => {
                signal.wait_io(events, timeout);
            }
            (None, Some(timeout)) => {
                signal.wait_timeout(timeout);
            }
            (None, None) => signal.wait(),
        }
    }
}

/// Configure `device` for `af`, stepping the encoding down while the device refuses it and
/// finally trying stereo for mono streams.
fn negotiate(device: &mut dyn OutputDevice, af: &AudioFormat) -> Result<AudioFormat, DeviceError> {
    let mut want = *af;
    let mut tried_stereo = false;
    loop {
        match device.configure(&want) {
            Ok(()) => return Ok(want),
            Err(DeviceError::UnsupportedFormat(reason)) => {
                let from = want;
                if !want.compatible() {
                    if af.channels != 1 || tried_stereo {
                        return Err(DeviceError::UnsupportedFormat(reason));
                    }
                    tried_stereo = true;
                    want = AudioFormat::new(af.format, af.rate, 2);
                }
                tracing::debug!(from = %from, to = %want, "device refused format");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceKind;
    use crate::format::sample;
    use crate::packet::PacketPool;
    use std::sync::Mutex;
    use std::thread;

    #[derive(Default)]
    struct Record {
        opens: usize,
        configures: Vec<AudioFormat>,
        bytes: Vec<u8>,
    }

    struct Recorder {
        record: Arc<Mutex<Record>>,
        accepts: Vec<u16>,
        af: AudioFormat,
    }

    impl OutputDevice for Recorder {
        fn kind(&self) -> DeviceKind {
            DeviceKind::Null
        }
        fn format(&self) -> AudioFormat {
            self.af
        }
        fn configure(&mut self, af: &AudioFormat) -> Result<(), DeviceError> {
            self.record.lock().unwrap().configures.push(*af);
            if !self.accepts.contains(&af.format) {
                return Err(DeviceError::UnsupportedFormat(af.to_string()));
            }
            self.af = *af;
            Ok(())
        }
        fn write(&mut self, data: &[u8], frames: usize) -> Result<usize, DeviceError> {
            self.record.lock().unwrap().bytes.extend_from_slice(data);
            Ok(frames)
        }
        fn delay(&mut self) -> usize {
            0
        }
        fn discard(&mut self) {}
        fn drain(&mut self) {}
        fn pause(&mut self, _paused: bool) {}
        fn volume(&mut self, _volume: f32) -> bool {
            true
        }
        fn close(&mut self) {
            self.af.reset();
        }
    }

    fn stage(accepts: Vec<u16>) -> (Arc<EventQueue>, Arc<EventQueue>, Receiver<Notification>, Arc<Mutex<Record>>, OutputStage) {
        let record = Arc::new(Mutex::new(Record::default()));
        let mut devices = DeviceFactory::new();
        let opened = record.clone();
        devices.register(
            DeviceKind::Null,
            Arc::new(move |_: &OutputConfig| -> Result<Box<dyn OutputDevice>, DeviceError> {
                opened.lock().unwrap().opens += 1;
                Ok(Box::new(Recorder {
                    record: opened.clone(),
                    accepts: accepts.clone(),
                    af: AudioFormat::default(),
                }))
            }),
        );
        let mut config = EngineConfig::default();
        config.output.device = DeviceKind::Null;
        let (fifo, input) = (Arc::new(EventQueue::new()), Arc::new(EventQueue::new()));
        let (tx, rx) = crossbeam_channel::unbounded();
        let stage = OutputStage::new(fifo.clone(), input.clone(), devices, &config, Notifier::new(tx));
        (fifo, input, rx, record, stage)
    }

    /// Moves a freshly built stage onto a test thread; production builds stages on their own thread.
    struct SendStage(OutputStage);

    // SAFETY: the stage has not opened a device yet, and the test devices are `Send`.
    unsafe impl Send for SendStage {}

    impl SendStage {
        fn run(self) {
            self.0.run()
        }
    }

    fn configure(af: AudioFormat) -> Event {
        Event::Configure(ConfigureEvent::new(crate::format::Codec::Pcm, af))
    }

    #[test]
    fn identical_format_keeps_device() {
        let af = AudioFormat::new(sample::S16, 44_100, 2);
        let (fifo, _input, _rx, record, stage) = stage(vec![sample::S16]);
        fifo.post(configure(af), Post::Back);
        fifo.post(configure(af), Post::Back);
        fifo.post(Event::Quit, Post::Back);
        stage.run();

        let record = record.lock().unwrap();
        assert_eq!(record.opens, 1);
        assert_eq!(record.configures, vec![af]);
    }

    #[test]
    fn float_steps_down_to_s16() {
        let af = AudioFormat::new(sample::FLOAT, 8_000, 1);
        let (fifo, _input, rx, record, stage) = stage(vec![sample::S16]);
        let pool = PacketPool::new(64, 1);
        let mut packet = pool.try_acquire().unwrap();
        packet.append(&0.5f32.to_ne_bytes());
        packet.af = af;
        packet.stream_position = 0;

        fifo.post(configure(af), Post::Back);
        fifo.post(Event::Buffer(packet), Post::Back);
        let stage = SendStage(stage);
        let handle = thread::spawn(move || stage.run());
        // Quit overtakes unwritten data, so wait for the write first.
        let deadline = Instant::now() + Duration::from_secs(2);
        while record.lock().unwrap().bytes.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        fifo.post(Event::Quit, Post::Front);
        handle.join().unwrap();

        let record = record.lock().unwrap();
        let formats: Vec<u16> = record.configures.iter().map(|f| f.format).collect();
        assert_eq!(formats, vec![sample::FLOAT, sample::S32, sample::S16]);
        assert_eq!(record.bytes, 16384i16.to_ne_bytes().to_vec());
        assert!(rx.try_iter().all(|n| !matches!(n, Notification::Error(_))));
    }

    #[test]
    fn unbridgeable_format_closes_input() {
        let af = AudioFormat::new(sample::S24_3, 44_100, 2);
        let (fifo, input, rx, _record, stage) = stage(vec![]);
        fifo.post(configure(af), Post::Back);
        fifo.post(Event::Quit, Post::Back);
        stage.run();

        assert!(matches!(input.pop(), Some(Event::Close)));
        assert!(input.is_empty());
        let errors: Vec<_> = rx.try_iter().filter(|n| matches!(n, Notification::Error(_))).collect();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn end_of_stream_drains_and_reports() {
        let af = AudioFormat::new(sample::S16, 8_000, 1);
        let (fifo, input, rx, _record, stage) = stage(vec![sample::S16]);
        let pool = PacketPool::new(64, 1);
        let mut packet = pool.try_acquire().unwrap();
        packet.append(&[0u8; 32]);
        packet.af = af;
        packet.stream = 4;
        packet.stream_position = 0;

        fifo.post(configure(af), Post::Back);
        fifo.post(Event::Buffer(packet), Post::Back);
        fifo.post(Event::End { stream: 4 }, Post::Back);
        let stage = SendStage(stage);
        let handle = thread::spawn(move || stage.run());

        let mut seen = Vec::new();
        while let Ok(n) = rx.recv_timeout(Duration::from_secs(2)) {
            let done = n == Notification::State(EngineState::Ready);
            seen.push(n);
            if done {
                break;
            }
        }
        fifo.post(Event::Quit, Post::Front);
        handle.join().unwrap();

        assert_eq!(seen.first(), Some(&Notification::State(EngineState::Playing)));
        assert!(seen.contains(&Notification::Bos));
        assert_eq!(seen.last(), Some(&Notification::State(EngineState::Ready)));
        let upstream: Vec<EventKind> = std::iter::from_fn(|| input.pop()).map(|e| e.kind()).collect();
        assert_eq!(upstream, vec![EventKind::Eos, EventKind::End]);
        assert_eq!(pool.available(), 1);
    }

    fn float_packet(pool: &PacketPool, af: AudioFormat, samples: &[f32], length: i64) -> Packet {
        let mut packet = pool.try_acquire().unwrap();
        for s in samples {
            packet.append(&s.to_ne_bytes());
        }
        packet.af = af;
        packet.stream_position = 0;
        packet.stream_length = length;
        packet
    }

    #[test]
    fn gain_is_clipped_and_tail_is_mixed_into_next_stream() {
        // 1 kHz mono, 4 ms crossfade: the last 4 frames of the first stream become the tail.
        let af = AudioFormat::new(sample::FLOAT, 1_000, 1);
        let (fifo, _input, rx, record, stage) = stage(vec![sample::FLOAT]);
        let pool = PacketPool::new(64, 2);

        let mut first = ConfigureEvent::new(crate::format::Codec::Pcm, af);
        first.stream_length = 8;
        // +20 dB would scale by 10; a 0.5 peak clips that to 2.
        first.replay_gain.track_gain = 20.0;
        first.replay_gain.track_peak = 0.5;
        let mut second = ConfigureEvent::new(crate::format::Codec::Pcm, af);
        second.stream_length = 100;

        fifo.post(Event::SetCrossFade(4), Post::Back);
        fifo.post(Event::SetReplayGain(ReplayGainMode::Track), Post::Back);
        fifo.post(Event::Configure(first), Post::Back);
        fifo.post(Event::Buffer(float_packet(&pool, af, &[0.25; 8], 8)), Post::Back);
        fifo.post(Event::Configure(second), Post::Back);
        fifo.post(Event::Buffer(float_packet(&pool, af, &[1.0; 4], 100)), Post::Back);
        let stage = SendStage(stage);
        let handle = thread::spawn(move || stage.run());
        let deadline = Instant::now() + Duration::from_secs(2);
        while record.lock().unwrap().bytes.len() < 32 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        fifo.post(Event::Quit, Post::Front);
        handle.join().unwrap();

        let record = record.lock().unwrap();
        let played: Vec<f32> = record
            .bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        // Head of the second stream weighted p^3 against the 0.5 tail, p = 0, 1/4, 1/2, 3/4.
        assert_eq!(
            played,
            vec![0.5, 0.5, 0.5, 0.5, 0.5, 0.5078125, 0.5625, 0.7109375]
        );
        assert_eq!(record.opens, 1);
        assert!(rx.try_iter().all(|n| !matches!(n, Notification::Error(_))));
    }

    #[test]
    fn reported_time_excludes_unwritten_frames() {
        let af = AudioFormat::new(sample::S16, 8_000, 1);
        let (_fifo, _input, rx, record, mut stage) = stage(vec![sample::S16]);
        stage.device = Some(Box::new(Recorder {
            record,
            accepts: vec![sample::S16],
            af,
        }));
        stage.device_af = af;
        stage.stream_af = af;
        // Three seconds handed over, two of them still waiting for device room.
        stage.position = 3 * 8_000;
        stage.pending = Some(PendingWrite {
            data: vec![0; 2 * 8_000 * 2],
            cursor: 0,
        });
        stage.update_clock();
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![Notification::Time { position: 1, length: 0 }]
        );
    }

    #[test]
    fn pause_and_volume_are_reported() {
        let (fifo, _input, rx, _record, stage) = stage(vec![sample::S16]);
        fifo.post(Event::Pause, Post::Back);
        fifo.post(Event::Volume(1.5), Post::Back);
        fifo.post(Event::Pause, Post::Back);
        fifo.post(Event::Quit, Post::Back);
        stage.run();
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![
                Notification::State(EngineState::Pausing),
                Notification::Volume(Some(1.0)),
                Notification::State(EngineState::Ready),
            ]
        );
    }
}

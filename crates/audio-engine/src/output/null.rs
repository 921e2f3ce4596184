//! Output device that plays into the void at real-time speed.
//!
//! Keeps a virtual buffer of `buffer_seconds` and lets it drain with the wall clock, so the
//! output stage sees the same back-pressure and position reporting as with real hardware.

use std::time::{Duration, Instant};

use crate::config::{DeviceKind, OutputConfig};
use crate::error::DeviceError;
use crate::format::AudioFormat;
use crate::output::OutputDevice;

pub struct NullDevice {
    af: AudioFormat,
    buffer_seconds: f32,
    capacity: u64,
    queued: f64,
    anchor: Instant,
    paused: bool,
}

impl NullDevice {
    pub fn new(cfg: &OutputConfig) -> Self {
        Self {
            af: AudioFormat::default(),
            buffer_seconds: cfg.buffer_seconds,
            capacity: 0,
            queued: 0.0,
            anchor: Instant::now(),
            paused: false,
        }
    }

    /// Account for the frames played since the last update.
    fn update(&mut self) {
        let now = Instant::now();
        if !self.paused {
            let played = now.duration_since(self.anchor).as_secs_f64() * self.af.rate as f64;
            self.queued = (self.queued - played).max(0.0);
        }
        self.anchor = now;
    }
}

impl OutputDevice for NullDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Null
    }

    fn format(&self) -> AudioFormat {
        self.af
    }

    fn configure(&mut self, af: &AudioFormat) -> Result<(), DeviceError> {
        if af.is_undefined() {
            return Err(DeviceError::UnsupportedFormat(af.to_string()));
        }
        self.update();
        self.af = *af;
        let secs = if self.buffer_seconds > 0.0 { self.buffer_seconds } else { 0.5 };
        self.capacity = (af.rate as f64 * secs as f64).ceil() as u64;
        self.queued = 0.0;
        tracing::debug!(format = %af, capacity = self.capacity, "null device configured");
        Ok(())
    }

    fn write(&mut self, _data: &[u8], frames: usize) -> Result<usize, DeviceError> {
        self.update();
        let space = (self.capacity as f64 - self.queued).max(0.0) as usize;
        let n = frames.min(space);
        self.queued += n as f64;
        Ok(n)
    }

    fn delay(&mut self) -> usize {
        self.update();
        self.queued.ceil() as usize
    }

    fn discard(&mut self) {
        self.queued = 0.0;
        self.anchor = Instant::now();
    }

    fn drain(&mut self) {
        if self.paused || self.af.rate == 0 {
            return;
        }
        let frames = self.delay();
        std::thread::sleep(Duration::from_secs_f64(frames as f64 / self.af.rate as f64));
        self.queued = 0.0;
    }

    fn pause(&mut self, paused: bool) {
        self.update();
        self.paused = paused;
    }

    fn volume(&mut self, _volume: f32) -> bool {
        false
    }

    fn close(&mut self) {
        self.af.reset();
        self.queued = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::sample;

    fn device() -> NullDevice {
        let mut dev = NullDevice::new(&OutputConfig {
            buffer_seconds: 0.1,
            ..OutputConfig::default()
        });
        dev.configure(&AudioFormat::new(sample::S16, 10_000, 2)).unwrap();
        dev
    }

    #[test]
    fn writes_stop_at_capacity() {
        let mut dev = device();
        assert_eq!(dev.write(&[], 600).unwrap(), 600);
        assert!(dev.write(&[], 600).unwrap() <= 400);
        assert!(dev.delay() <= 1000);
    }

    #[test]
    fn paused_device_holds_its_delay() {
        let mut dev = device();
        dev.write(&[], 500).unwrap();
        dev.pause(true);
        let before = dev.delay();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(dev.delay(), before);
        dev.pause(false);
        std::thread::sleep(Duration::from_millis(20));
        assert!(dev.delay() < before);
    }

    #[test]
    fn drain_empties_the_buffer() {
        let mut dev = device();
        dev.write(&[], 200).unwrap();
        dev.drain();
        assert_eq!(dev.delay(), 0);
        assert!(!dev.volume(0.5));
    }
}

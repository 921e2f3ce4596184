//! Output devices and the helpers the output stage runs before a device write.
//!
//! An [`OutputDevice`] accepts interleaved PCM in the format it was configured for and reports
//! how much of it is still queued ahead of the speaker. Writes never block: a device takes what
//! fits and the output stage waits for [`DeviceEvent::Writable`] (or polls) before retrying.
//!
//! Built in:
//! - [`CpalDevice`]: the system output through CPAL, resampling when the hardware rate differs
//! - [`NullDevice`]: discards samples at wall-clock pace

pub mod convert;
pub mod crossfade;
mod null;
pub mod resample;
pub mod ring;
mod system;
pub mod timer;

pub use null::NullDevice;
pub use system::{CpalDevice, output_device_names};

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::config::{DeviceKind, OutputConfig};
use crate::error::DeviceError;
use crate::format::AudioFormat;

/// Asynchronous notifications from a device backend.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Buffer space was freed.
    Writable,
    /// The backend failed; the device must be closed.
    Error(String),
}

pub trait OutputDevice {
    fn kind(&self) -> DeviceKind;

    /// Format the device is currently configured for. Undefined before the first `configure`.
    fn format(&self) -> AudioFormat;

    /// Prepare for `af`. Fails with [`DeviceError::UnsupportedFormat`] when the sample encoding
    /// is not accepted, so the caller can step down and retry.
    fn configure(&mut self, af: &AudioFormat) -> Result<(), DeviceError>;

    /// Queue up to `frames` whole frames from `data`. Returns the number of frames taken.
    fn write(&mut self, data: &[u8], frames: usize) -> Result<usize, DeviceError>;

    /// Frames written but not yet played.
    fn delay(&mut self) -> usize;

    /// Drop everything queued.
    fn discard(&mut self);

    /// Block until everything queued has been played.
    fn drain(&mut self);

    fn pause(&mut self, paused: bool);

    /// Set the playback volume in `0.0..=1.0`. Returns `false` when the device has no volume
    /// control.
    fn volume(&mut self, volume: f32) -> bool;

    fn close(&mut self);

    /// Readiness and error notifications, when the backend produces them.
    fn events(&self) -> Option<Receiver<DeviceEvent>> {
        None
    }
}

pub type DeviceOpener =
    Arc<dyn Fn(&OutputConfig) -> Result<Box<dyn OutputDevice>, DeviceError> + Send + Sync>;

/// Device openers keyed by [`DeviceKind`].
#[derive(Clone, Default)]
pub struct DeviceFactory {
    openers: HashMap<DeviceKind, DeviceOpener>,
}

impl DeviceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register(
            DeviceKind::Null,
            Arc::new(|cfg: &OutputConfig| -> Result<Box<dyn OutputDevice>, DeviceError> {
                Ok(Box::new(NullDevice::new(cfg)))
            }),
        );
        factory.register(
            DeviceKind::Cpal,
            Arc::new(|cfg: &OutputConfig| -> Result<Box<dyn OutputDevice>, DeviceError> {
                Ok(Box::new(CpalDevice::open(cfg)?))
            }),
        );
        factory
    }

    /// Register `opener` for `kind`, replacing any earlier one.
    pub fn register(&mut self, kind: DeviceKind, opener: DeviceOpener) {
        self.openers.insert(kind, opener);
    }

    pub fn open(&self, cfg: &OutputConfig) -> Result<Box<dyn OutputDevice>, DeviceError> {
        match self.openers.get(&cfg.device) {
            Some(opener) => opener(cfg),
            None => Err(DeviceError::Unavailable(format!("{:?}", cfg.device).to_lowercase())),
        }
    }
}

//! Engine configuration.
//!
//! Loaded from TOML; every key is optional and falls back to the defaults below.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::format::ReplayGainMode;

/// Which output backend the output stage opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// No device; Configure events fail with an error.
    None,
    /// Discards samples, paced by the wall clock.
    Null,
    #[default]
    Cpal,
}

/// Output device tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub device: DeviceKind,
    /// Device name substring to match; default device when unset.
    pub name: Option<String>,
    /// Target buffer duration for the device ring.
    pub buffer_seconds: f32,
    /// Resampler chunk size in frames.
    pub chunk_frames: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Cpal,
            name: None,
            buffer_seconds: 0.5,
            chunk_frames: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub packets: usize,
    /// Initial bytes per packet.
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output: OutputConfig,
    pub input_pool: PoolConfig,
    pub decoder_pool: PoolConfig,
    pub replay_gain: ReplayGainMode,
    /// Crossfade duration between same-format tracks. 0 disables it.
    pub crossfade_ms: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            input_pool: PoolConfig {
                packets: 20,
                capacity: 8192,
            },
            decoder_pool: PoolConfig {
                packets: 40,
                capacity: 8192,
            },
            replay_gain: ReplayGainMode::Off,
            crossfade_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<EngineConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        cfg.validate().with_context(|| format!("invalid config {:?}", path))?;
        Ok(cfg)
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// A demuxer keeps one packet back to flag the end of stream on it, so a pool needs at
    /// least two packets for the stage to make progress.
    pub fn validate(&self) -> Result<()> {
        for (name, pool) in [("input_pool", &self.input_pool), ("decoder_pool", &self.decoder_pool)] {
            if pool.packets < 2 {
                anyhow::bail!("{name}.packets must be at least 2, got {}", pool.packets);
            }
            if pool.capacity == 0 {
                anyhow::bail!("{name}.capacity must be greater than 0");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_keys_take_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "crossfade_ms = 3000\n\n[output]\ndevice = \"null\"").unwrap();
        let cfg = EngineConfig::load(file.path()).unwrap();
        assert_eq!(cfg.crossfade_ms, 3000);
        assert_eq!(cfg.output.device, DeviceKind::Null);
        assert_eq!(cfg.output.chunk_frames, 1024);
        assert_eq!(cfg.input_pool.packets, 20);
        assert_eq!(cfg.decoder_pool.packets, 40);
        assert_eq!(cfg.replay_gain, ReplayGainMode::Off);
    }

    #[test]
    fn replay_gain_mode_parses_lowercase() {
        let cfg: EngineConfig = toml::from_str("replay_gain = \"album\"").unwrap();
        assert_eq!(cfg.replay_gain, ReplayGainMode::Album);
    }

    #[test]
    fn undersized_pools_are_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.input_pool.packets = 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("input_pool.packets"), "{err}");

        let mut cfg = EngineConfig::default();
        cfg.decoder_pool.capacity = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("decoder_pool.capacity"), "{err}");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[input_pool]\npackets = 0\ncapacity = 4096").unwrap();
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("input_pool.packets"), "{err:#}");
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "crossfade_ms = \"long\"").unwrap();
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parse config"));
    }
}

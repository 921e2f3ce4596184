use std::path::PathBuf;

use audio_engine::{DeviceKind, ReplayGainMode};
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "play", version, about = "Play audio files through the streaming engine")]
pub struct Args {
    /// Files or URLs to play in order
    #[arg(required_unless_present = "list_devices")]
    pub inputs: Vec<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Engine configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output backend
    #[arg(long, value_enum)]
    pub output: Option<OutputArg>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Output buffer target in seconds
    #[arg(long)]
    pub buffer_seconds: Option<f32>,

    /// Replay gain mode
    #[arg(long, value_enum)]
    pub replay_gain: Option<GainArg>,

    /// Crossfade between tracks of the same format, in milliseconds
    #[arg(long)]
    pub crossfade_ms: Option<u32>,

    /// Initial volume, 0.0 to 1.0
    #[arg(long)]
    pub volume: Option<f32>,

    /// Start position of the first track, 0.0 to 1.0
    #[arg(long)]
    pub seek: Option<f64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OutputArg {
    Cpal,
    Null,
}

impl From<OutputArg> for DeviceKind {
    fn from(arg: OutputArg) -> Self {
        match arg {
            OutputArg::Cpal => DeviceKind::Cpal,
            OutputArg::Null => DeviceKind::Null,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum GainArg {
    Off,
    Track,
    Album,
}

impl From<GainArg> for ReplayGainMode {
    fn from(arg: GainArg) -> Self {
        match arg {
            GainArg::Off => ReplayGainMode::Off,
            GainArg::Track => ReplayGainMode::Track,
            GainArg::Album => ReplayGainMode::Album,
        }
    }
}

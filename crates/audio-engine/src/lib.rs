pub mod config;
pub mod decode;
pub mod demux;
pub mod engine;
pub mod error;
pub mod event;
pub mod format;
pub mod output;
pub mod packet;
pub mod queue;
pub mod signal;
pub mod source;

pub use config::{DeviceKind, EngineConfig, OutputConfig};
pub use engine::{AudioEngine, Plugins};
pub use event::{EngineState, Event, Notification};
pub use format::{AudioFormat, Codec, ContainerFormat, ReplayGainMode};

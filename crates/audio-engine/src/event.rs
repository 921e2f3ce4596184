//! Messages exchanged between the front end and the pipeline stages.
//!
//! Every [`Event`] owns its payload. Posting moves it into a queue, popping moves it out, and
//! dropping it is the release. A `Buffer` event drops its [`Packet`] back into the pool it was
//! taken from.

use crate::config::OutputConfig;
use crate::format::{AudioFormat, Codec, ReplayGain, ReplayGainMode};
use crate::packet::Packet;

/// Stream setup handed from the demuxer to the decoder and from the decoder to the output.
#[derive(Debug, Clone, Default)]
pub struct ConfigureEvent {
    pub af: AudioFormat,
    pub codec: Codec,
    /// Stream length in frames, -1 when unknown.
    pub stream_length: i64,
    /// Frames to discard at the start of the stream (encoder delay / pre-skip).
    pub stream_offset_start: u64,
    /// Frames to discard at the end of the stream.
    pub stream_offset_end: u64,
    pub replay_gain: ReplayGain,
    /// Opaque codec setup bytes (Vorbis headers, OpusHead, FLAC STREAMINFO...).
    pub codec_data: Option<Vec<u8>>,
}

impl ConfigureEvent {
    pub fn new(codec: Codec, af: AudioFormat) -> Self {
        Self {
            af,
            codec,
            stream_length: -1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl MetaInfo {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artist.is_none() && self.album.is_none()
    }
}

#[derive(Debug)]
pub enum Event {
    Open(String),
    /// Discard everything queued downstream, then open.
    OpenFlush(String),
    Close,
    Quit,
    /// Normalised position in `0.0..=1.0`.
    Seek(f64),
    /// Toggle pause.
    Pause,
    Volume(f32),
    SetReplayGain(ReplayGainMode),
    SetCrossFade(u32),
    SetOutputConfig(OutputConfig),
    Configure(ConfigureEvent),
    Meta(MetaInfo),
    Buffer(Packet),
    Flush { offset: i64, close: bool },
    End { stream: u32 },
    /// The device finished playing the stream.
    Eos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Open,
    OpenFlush,
    Close,
    Quit,
    Seek,
    Pause,
    Volume,
    SetReplayGain,
    SetCrossFade,
    SetOutputConfig,
    Configure,
    Meta,
    Buffer,
    Flush,
    End,
    Eos,
}

impl EventKind {
    /// Commands that must preempt long running work in the receiving stage.
    ///
    /// `Flush` counts as one: it always replaces whatever a stage has queued.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            EventKind::Flush
                | EventKind::Open
                | EventKind::OpenFlush
                | EventKind::Close
                | EventKind::Quit
                | EventKind::Seek
                | EventKind::Pause
                | EventKind::Volume
                | EventKind::SetReplayGain
                | EventKind::SetCrossFade
                | EventKind::SetOutputConfig
        )
    }

    /// Controls that are handled by the output stage rather than the input stage.
    pub fn targets_output(self) -> bool {
        matches!(
            self,
            EventKind::Pause
                | EventKind::Volume
                | EventKind::SetReplayGain
                | EventKind::SetCrossFade
                | EventKind::SetOutputConfig
        )
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Open(_) => EventKind::Open,
            Event::OpenFlush(_) => EventKind::OpenFlush,
            Event::Close => EventKind::Close,
            Event::Quit => EventKind::Quit,
            Event::Seek(_) => EventKind::Seek,
            Event::Pause => EventKind::Pause,
            Event::Volume(_) => EventKind::Volume,
            Event::SetReplayGain(_) => EventKind::SetReplayGain,
            Event::SetCrossFade(_) => EventKind::SetCrossFade,
            Event::SetOutputConfig(_) => EventKind::SetOutputConfig,
            Event::Configure(_) => EventKind::Configure,
            Event::Meta(_) => EventKind::Meta,
            Event::Buffer(_) => EventKind::Buffer,
            Event::Flush { .. } => EventKind::Flush,
            Event::End { .. } => EventKind::End,
            Event::Eos => EventKind::Eos,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing is playing.
    Ready,
    Playing,
    Pausing,
}

/// Messages from the engine to its front end.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    State(EngineState),
    /// A new stream became audible.
    Bos,
    /// Playback position and stream length in whole seconds. Length is 0 when unknown.
    Time { position: u32, length: u32 },
    Meta(MetaInfo),
    /// `None` when the device has no volume control.
    Volume(Option<f32>),
    /// The stream finished playing.
    Eos,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_kinds_are_classified() {
        assert!(Event::Seek(0.5).kind().is_control());
        assert!(Event::Pause.kind().targets_output());
        assert!(!Event::Close.kind().targets_output());
        assert!(!Event::End { stream: 1 }.kind().is_control());
        assert!(!Event::Eos.kind().is_control());
        assert!(Event::Flush { offset: 0, close: false }.kind().is_control());
    }

    #[test]
    fn configure_defaults_to_unknown_length() {
        let cfg = ConfigureEvent::new(Codec::Opus, AudioFormat::default());
        assert_eq!(cfg.stream_length, -1);
        assert!(cfg.af.is_undefined());
        assert!(cfg.replay_gain.track_gain.is_nan());
    }
}

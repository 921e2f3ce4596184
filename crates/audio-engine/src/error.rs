//! Error types for the byte source, demuxer, decoder and output device layers.
//!
//! Stage threads never propagate these across thread boundaries; they are converted into
//! exactly one [`crate::event::Notification::Error`] at the point where a stage gives up.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read interrupted by control event")]
    Interrupted,

    #[error("unexpected end of stream")]
    Eof,

    #[error("no byte source registered for scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("source is not seekable")]
    NotSeekable,
}

impl SourceError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SourceError::Interrupted)
    }
}

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("malformed element {id:#x}: {reason}")]
    Malformed { id: u32, reason: &'static str },

    #[error("child element {id:#x} overruns its parent")]
    Overrun { id: u32 },

    #[error("lace sizes ({laced} bytes) do not match block payload ({available} bytes)")]
    LaceMismatch { laced: usize, available: usize },

    #[error("unsupported document type {0:?}")]
    UnsupportedDocType(String),

    #[error("invalid ogg page: {0}")]
    InvalidPage(&'static str),

    #[error("no supported audio track")]
    NoSupportedTrack,
}

impl DemuxError {
    pub fn malformed(id: u32, reason: &'static str) -> Self {
        DemuxError::Malformed { id, reason }
    }

    /// True when the error was caused by a pending control event rather than bad data.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, DemuxError::Source(e) if e.is_interrupted())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported codec setup: {0}")]
    Unsupported(String),

    #[error("corrupt stream: {0}")]
    Corrupt(String),

    #[error("codec backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no output device available: {0}")]
    Unavailable(String),

    #[error("unsupported sample format {0}")]
    UnsupportedFormat(String),

    #[error("output write failed: {0}")]
    Write(String),

    #[error("audio backend error: {0}")]
    Backend(String),
}

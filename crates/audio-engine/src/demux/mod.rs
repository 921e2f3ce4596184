//! Container demuxers.
//!
//! A [`Demuxer`] turns a [`ByteSource`] into `Configure`/`Meta` events and `Buffer` packets for
//! the decoder stage. The input stage hands it one empty [`Packet`] per [`Demuxer::process`]
//! call; the demuxer fills it with one codec frame and posts it downstream.

pub mod ebml;
pub mod lacing;
mod matroska;
mod ogg;

pub use matroska::{Cue, MatroskaReader, Track, codec_from_id};
pub use ogg::OggReader;

use crate::error::DemuxError;
use crate::event::Event;
use crate::format::ContainerFormat;
use crate::packet::Packet;
use crate::queue::{EventQueue, Post};
use crate::source::ByteSource;

/// What a demuxer needs from the input stage while it runs.
pub struct ReaderContext<'a> {
    pub source: &'a mut dyn ByteSource,
    /// Decoder stage queue.
    pub output: &'a EventQueue,
    /// Input stage queue, polled for pending control events.
    pub control: &'a EventQueue,
    /// Id of the stream being read.
    pub stream: u32,
}

impl ReaderContext<'_> {
    pub fn post(&self, event: Event) {
        self.output.post(event, Post::Back);
    }

    /// True when a control event is waiting and the demuxer should return early.
    pub fn aborted(&self) -> bool {
        self.control.check_abort()
    }
}

#[derive(Debug)]
pub enum ReadStatus {
    /// More data may follow.
    Ok,
    /// End of stream reached; `End` has been posted.
    Done,
    Error(DemuxError),
}

pub trait Demuxer: Send {
    fn format(&self) -> ContainerFormat;

    /// Prepare for reading. Headers are parsed lazily by the first `process` call.
    fn init(&mut self, ctx: &mut ReaderContext<'_>) -> Result<(), DemuxError>;

    /// Fill `packet` with the next frame and post it, or report the end of the stream.
    ///
    /// Dropping `packet` without posting it returns it to the input pool.
    fn process(&mut self, ctx: &mut ReaderContext<'_>, packet: Packet) -> ReadStatus;

    fn can_seek(&self) -> bool;

    /// Translate a normalised position into a frame offset.
    fn seek_offset(&self, pos: f64) -> Option<i64>;

    /// Reposition so the next frame posted is at or before `offset` frames.
    fn seek(&mut self, ctx: &mut ReaderContext<'_>, offset: i64) -> bool;
}

/// Demuxer for `format`, if one is built in.
pub fn open_demuxer(format: ContainerFormat) -> Option<Box<dyn Demuxer>> {
    match format {
        ContainerFormat::Matroska => Some(Box::new(MatroskaReader::new())),
        ContainerFormat::Ogg => Some(Box::new(OggReader::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_demuxers() {
        assert_eq!(open_demuxer(ContainerFormat::Matroska).unwrap().format(), ContainerFormat::Matroska);
        assert_eq!(open_demuxer(ContainerFormat::Ogg).unwrap().format(), ContainerFormat::Ogg);
        assert!(open_demuxer(ContainerFormat::Mp3).is_none());
    }
}

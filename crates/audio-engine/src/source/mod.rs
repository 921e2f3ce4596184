//! Byte sources feeding the demuxers.
//!
//! A [`ByteSource`] is a readable (and possibly seekable) byte stream. Containers are big
//! endian, so [`ByteSourceExt`] layers typed big-endian readers on top of any source.
//!
//! Sources are resolved from URLs through a [`SourceRegistry`]; `file://` URLs and plain paths
//! are built in, other schemes (e.g. `http`) are registered by the host.

mod channel;
mod file;
mod stream;

pub use channel::ChannelSource;
pub use file::FileSource;
pub use stream::{SerialSource, StreamSource};

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SourceError;
use crate::format::ContainerFormat;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Begin,
    Current,
    End,
}

pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError>;

    /// Move the read position and return the new absolute offset.
    ///
    /// Serial sources only support `Whence::Current` with a non-negative offset.
    fn position(&mut self, offset: i64, whence: Whence) -> Result<u64, SourceError>;

    /// Total size in bytes, if known.
    fn size(&self) -> Option<u64>;

    fn eof(&self) -> bool;

    /// True when the source cannot seek (live streams, pipes).
    fn serial(&self) -> bool;

    /// Container guess from the URL or content type, if the source knows one.
    fn format_hint(&self) -> ContainerFormat {
        ContainerFormat::Unknown
    }
}

/// Typed readers shared by all byte sources.
pub trait ByteSourceExt: ByteSource {
    fn tell(&mut self) -> Result<u64, SourceError> {
        self.position(0, Whence::Current)
    }

    /// Fill `buf` completely or fail with [`SourceError::Eof`].
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SourceError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(SourceError::Eof),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes, stopping early only at end of stream.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    /// Advance by `n` bytes, reading and discarding on serial sources.
    fn skip(&mut self, n: u64) -> Result<(), SourceError> {
        if n == 0 {
            return Ok(());
        }
        if !self.serial() {
            let offset = i64::try_from(n).map_err(|_| SourceError::NotSeekable)?;
            self.position(offset, Whence::Current)?;
            return Ok(());
        }
        let mut scratch = [0u8; 4096];
        let mut left = n;
        while left > 0 {
            let want = left.min(scratch.len() as u64) as usize;
            self.read_exact(&mut scratch[..want])?;
            left -= want as u64;
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, SourceError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u16_be(&mut self) -> Result<u16, SourceError> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn read_u24_be(&mut self) -> Result<u32, SourceError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b[1..])?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u32_be(&mut self) -> Result<u32, SourceError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u32_le(&mut self) -> Result<u32, SourceError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64_be(&mut self) -> Result<u64, SourceError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn read_i16_be(&mut self) -> Result<i16, SourceError> {
        Ok(self.read_u16_be()? as i16)
    }

    fn read_i32_be(&mut self) -> Result<i32, SourceError> {
        Ok(self.read_u32_be()? as i32)
    }

    fn read_i64_be(&mut self) -> Result<i64, SourceError> {
        Ok(self.read_u64_be()? as i64)
    }

    fn read_f32_be(&mut self) -> Result<f32, SourceError> {
        Ok(f32::from_bits(self.read_u32_be()?))
    }

    fn read_f64_be(&mut self) -> Result<f64, SourceError> {
        Ok(f64::from_bits(self.read_u64_be()?))
    }
}

impl<T: ByteSource + ?Sized> ByteSourceExt for T {}

/// Opens a byte source for a URL. The signal lets blocking sources abort on control events.
pub type SourceOpener =
    Arc<dyn Fn(&str, &Signal) -> Result<Box<dyn ByteSource>, SourceError> + Send + Sync>;

/// Maps URL schemes to byte source openers.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    openers: HashMap<String, SourceOpener>,
}

impl SourceRegistry {
    /// Registry with only the built-in file source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `opener` for `scheme` (case-insensitive), replacing any earlier one.
    pub fn register(&mut self, scheme: &str, opener: SourceOpener) {
        self.openers.insert(scheme.to_ascii_lowercase(), opener);
    }

    pub fn open(&self, url: &str, abort: &Signal) -> Result<Box<dyn ByteSource>, SourceError> {
        match split_scheme(url) {
            None => Ok(Box::new(FileSource::open(url)?)),
            Some((scheme, _)) => match self.openers.get(&scheme) {
                Some(opener) => opener(url, abort),
                None if scheme == "file" => Ok(Box::new(FileSource::open(url)?)),
                None => Err(SourceError::UnsupportedScheme(scheme)),
            },
        }
    }
}

fn split_scheme(url: &str) -> Option<(String, &str)> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) {
        return None;
    }
    Some((scheme.to_ascii_lowercase(), rest))
}

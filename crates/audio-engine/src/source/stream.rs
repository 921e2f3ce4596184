use std::io::{Read, Seek, SeekFrom};

use crate::error::SourceError;
use crate::format::ContainerFormat;
use crate::source::{ByteSource, Whence};

fn read_retrying<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, SourceError> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Seekable source over any `Read + Seek`, e.g. an in-memory cursor.
pub struct StreamSource<R> {
    inner: R,
    size: Option<u64>,
    eof: bool,
    hint: ContainerFormat,
}

impl<R: Read + Seek + Send> StreamSource<R> {
    pub fn new(mut inner: R) -> Self {
        let size = inner
            .seek(SeekFrom::End(0))
            .and_then(|end| inner.seek(SeekFrom::Start(0)).map(|_| end))
            .ok();
        Self {
            inner,
            size,
            eof: false,
            hint: ContainerFormat::Unknown,
        }
    }

    pub fn with_hint(mut self, hint: ContainerFormat) -> Self {
        self.hint = hint;
        self
    }
}

impl<R: Read + Seek + Send> ByteSource for StreamSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        let n = read_retrying(&mut self.inner, buf)?;
        if n == 0 && !buf.is_empty() {
            self.eof = true;
        }
        Ok(n)
    }

    fn position(&mut self, offset: i64, whence: Whence) -> Result<u64, SourceError> {
        let from = match whence {
            Whence::Begin => SeekFrom::Start(offset.max(0) as u64),
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        let pos = self.inner.seek(from)?;
        self.eof = self.size.is_some_and(|size| pos >= size);
        Ok(pos)
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn serial(&self) -> bool {
        false
    }

    fn format_hint(&self) -> ContainerFormat {
        self.hint
    }
}

/// Forward-only source over any `Read` (pipes, live streams).
pub struct SerialSource<R> {
    inner: R,
    offset: u64,
    eof: bool,
    hint: ContainerFormat,
}

impl<R: Read + Send> SerialSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            eof: false,
            hint: ContainerFormat::Unknown,
        }
    }

    pub fn with_hint(mut self, hint: ContainerFormat) -> Self {
        self.hint = hint;
        self
    }
}

impl<R: Read + Send> ByteSource for SerialSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        let n = read_retrying(&mut self.inner, buf)?;
        if n == 0 && !buf.is_empty() {
            self.eof = true;
        }
        self.offset += n as u64;
        Ok(n)
    }

    fn position(&mut self, offset: i64, whence: Whence) -> Result<u64, SourceError> {
        match whence {
            Whence::Current if offset == 0 => Ok(self.offset),
            Whence::Current if offset > 0 => {
                let mut left = offset as u64;
                let mut scratch = [0u8; 4096];
                while left > 0 {
                    let want = left.min(scratch.len() as u64) as usize;
                    match self.read(&mut scratch[..want])? {
                        0 => return Err(SourceError::Eof),
                        n => left -= n as u64,
                    }
                }
                Ok(self.offset)
            }
            _ => Err(SourceError::NotSeekable),
        }
    }

    fn size(&self) -> Option<u64> {
        None
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn serial(&self) -> bool {
        true
    }

    fn format_hint(&self) -> ContainerFormat {
        self.hint
    }
}

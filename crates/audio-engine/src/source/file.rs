use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;

use crate::error::SourceError;
use crate::format::ContainerFormat;
use crate::source::{ByteSource, Whence};

/// Local file opened from a path or `file://` URL.
pub struct FileSource {
    file: BufReader<File>,
    path: PathBuf,
    size: u64,
    eof: bool,
}

impl FileSource {
    pub fn open(url: &str) -> Result<Self, SourceError> {
        let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        tracing::debug!(path = ?path, size, "opened file source");
        Ok(Self {
            file: BufReader::new(file),
            path,
            size,
            eof: false,
        })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        loop {
            match self.file.read(buf) {
                Ok(0) if !buf.is_empty() => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn position(&mut self, offset: i64, whence: Whence) -> Result<u64, SourceError> {
        let pos = match whence {
            // Relative moves keep the read buffer when they land inside it.
            Whence::Current => {
                self.file.seek_relative(offset)?;
                self.file.stream_position()?
            }
            Whence::Begin => self.file.seek(SeekFrom::Start(offset.max(0) as u64))?,
            Whence::End => self.file.seek(SeekFrom::End(offset))?,
        };
        self.eof = pos >= self.size;
        Ok(pos)
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn serial(&self) -> bool {
        false
    }

    fn format_hint(&self) -> ContainerFormat {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(ContainerFormat::from_extension)
            .unwrap_or_default()
    }
}

use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::error::SourceError;
use crate::format::ContainerFormat;
use crate::signal::{Readiness, Signal, wait_readable};
use crate::source::{ByteSource, Whence};

/// Forward-only source fed by byte chunks over a channel.
///
/// Models network streams and pipes: a producer (HTTP client, decoder of a transport) sends
/// chunks, and reads block until a chunk arrives, the producer hangs up (end of stream), the
/// read deadline passes, or the abort signal is raised by a pending control event.
pub struct ChannelSource {
    chunks: Receiver<Vec<u8>>,
    abort: Signal,
    pending: Vec<u8>,
    cursor: usize,
    offset: u64,
    timeout: Option<Duration>,
    eof: bool,
    hint: ContainerFormat,
}

impl ChannelSource {
    pub fn new(chunks: Receiver<Vec<u8>>, abort: Signal) -> Self {
        Self {
            chunks,
            abort,
            pending: Vec::new(),
            cursor: 0,
            offset: 0,
            timeout: None,
            eof: false,
            hint: ContainerFormat::Unknown,
        }
    }

    /// Give up reads that see no data for `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_hint(mut self, hint: ContainerFormat) -> Self {
        self.hint = hint;
        self
    }

    /// Make sure `pending` holds unread bytes. Returns `false` at end of stream.
    fn fill(&mut self) -> Result<bool, SourceError> {
        if self.cursor < self.pending.len() {
            return Ok(true);
        }
        if self.eof {
            return Ok(false);
        }
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            match wait_readable(&self.abort, &self.chunks, deadline)? {
                Readiness::Closed => {
                    self.eof = true;
                    return Ok(false);
                }
                Readiness::Ready => match self.chunks.try_recv() {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => {
                        self.pending = chunk;
                        self.cursor = 0;
                        return Ok(true);
                    }
                    // Readiness raced with another reader or a hang-up; classify again.
                    Err(_) => continue,
                },
            }
        }
    }
}

impl ByteSource for ChannelSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        if buf.is_empty() || !self.fill()? {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len() - self.cursor);
        buf[..n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
        self.cursor += n;
        self.offset += n as u64;
        Ok(n)
    }

    fn position(&mut self, offset: i64, whence: Whence) -> Result<u64, SourceError> {
        match whence {
            Whence::Current if offset == 0 => Ok(self.offset),
            Whence::Current if offset > 0 => {
                let mut left = offset as u64;
                while left > 0 {
                    if !self.fill()? {
                        return Err(SourceError::Eof);
                    }
                    let n = left.min((self.pending.len() - self.cursor) as u64);
                    self.cursor += n as usize;
                    self.offset += n;
                    left -= n;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ByteSourceExt;
    use std::thread;

    #[test]
    fn reads_across_chunks_until_hangup() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut src = ChannelSource::new(rx, Signal::new());
        tx.send(vec![1, 2]).unwrap();
        tx.send(Vec::new()).unwrap();
        tx.send(vec![3, 4, 5]).unwrap();
        drop(tx);

        let mut buf = [0u8; 4];
        src.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(src.tell().unwrap(), 4);
        assert_eq!(src.read_u8().unwrap(), 5);
        assert_eq!(src.read(&mut buf).unwrap(), 0);
        assert!(src.eof());
    }

    #[test]
    fn blocked_read_is_interrupted_by_abort() {
        let (_tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let abort = Signal::new();
        let mut src = ChannelSource::new(rx, abort.clone());
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            abort.set();
        });
        assert!(matches!(src.read(&mut [0u8; 8]), Err(SourceError::Interrupted)));
        handle.join().unwrap();
    }

    #[test]
    fn read_times_out() {
        let (_tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let mut src = ChannelSource::new(rx, Signal::new()).with_timeout(Duration::from_millis(20));
        assert!(matches!(src.read(&mut [0u8; 8]), Err(SourceError::Io(_))));
    }
}

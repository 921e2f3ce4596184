//! Pooled byte buffers carrying compressed or decoded audio between stages.
//!
//! A [`PacketPool`] owns a fixed number of preallocated buffers plus a [`Semaphore`] whose
//! permit count equals the number of buffers currently available. A [`Packet`] borrows one of
//! those buffers; dropping the packet is its release: the buffer goes back to the pool it came
//! from and one permit is returned. Packets are not `Clone`, so a buffer is never owned twice.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::format::AudioFormat;
use crate::signal::{Semaphore, Signal};

pub const FLAG_EOS: u8 = 0x1;

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    sem: Semaphore,
    count: usize,
    capacity: usize,
}

impl PoolShared {
    fn recycle(&self, mut buffer: Vec<u8>) {
        if buffer.len() < self.capacity {
            buffer.resize(self.capacity, 0);
        }
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buffer);
        self.sem.release();
    }

    fn take(self: &Arc<Self>) -> Option<Packet> {
        let buffer = self.free.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match buffer {
            Some(buffer) => Some(Packet::new(buffer, self.clone())),
            None => {
                tracing::error!("packet pool permit granted with empty free list");
                self.sem.release();
                None
            }
        }
    }
}

/// Fixed-size set of reusable packets.
///
/// Cloning a pool yields another handle to the same set of buffers.
#[derive(Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl PacketPool {
    /// Preallocate `count` packets of `capacity` bytes each.
    pub fn new(capacity: usize, count: usize) -> Self {
        let free = (0..count).map(|_| vec![0u8; capacity]).collect();
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                sem: Semaphore::new(count),
                count,
                capacity,
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.shared.count
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Packets currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.shared.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Packets currently owned by some stage.
    pub fn in_flight(&self) -> usize {
        self.shared.count - self.available()
    }

    /// Block until a packet is available or `abort` is set.
    ///
    /// Returns `None` without taking a packet when aborted.
    pub fn acquire(&self, abort: &Signal) -> Option<Packet> {
        if !self.shared.sem.acquire(abort) {
            return None;
        }
        self.shared.take()
    }

    pub fn try_acquire(&self) -> Option<Packet> {
        if !self.shared.sem.try_acquire() {
            return None;
        }
        self.shared.take()
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Packet> {
        if !self.shared.sem.acquire_timeout(timeout) {
            return None;
        }
        self.shared.take()
    }
}

/// A byte window `[begin, end)` over a pooled buffer plus stream metadata.
pub struct Packet {
    buffer: Vec<u8>,
    begin: usize,
    end: usize,
    pub af: AudioFormat,
    pub stream: u32,
    /// Position of the first frame in the stream, in frames. -1 when unknown.
    pub stream_position: i64,
    /// Total stream length in frames. -1 when unknown.
    pub stream_length: i64,
    pub flags: u8,
    home: Arc<PoolShared>,
}

impl Packet {
    fn new(buffer: Vec<u8>, home: Arc<PoolShared>) -> Self {
        Self {
            buffer,
            begin: 0,
            end: 0,
            af: AudioFormat::default(),
            stream: 0,
            stream_position: -1,
            stream_length: -1,
            flags: 0,
            home,
        }
    }

    /// Unread bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.begin..self.end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.begin..self.end]
    }

    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Writable bytes after the window.
    pub fn space(&self) -> usize {
        self.buffer.len() - self.end
    }

    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.end..]
    }

    /// Commit `n` bytes written into [`Packet::space_mut`].
    pub fn wrote(&mut self, n: usize) {
        self.end = (self.end + n).min(self.buffer.len());
    }

    /// Consume `n` bytes from the front of the window.
    pub fn read(&mut self, n: usize) {
        self.begin = (self.begin + n).min(self.end);
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
        }
    }

    pub fn trim_end(&mut self, n: usize) {
        self.end = self.end.saturating_sub(n).max(self.begin);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.buffer[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    /// Make room for `n` more bytes, moving unread bytes to the front before growing.
    pub fn reserve(&mut self, n: usize) {
        if self.space() >= n {
            return;
        }
        if self.begin > 0 {
            self.buffer.copy_within(self.begin..self.end, 0);
            self.end -= self.begin;
            self.begin = 0;
            if self.space() >= n {
                return;
            }
        }
        self.buffer.resize(self.end + n, 0);
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
        self.flags = 0;
        self.stream_position = -1;
        self.stream_length = -1;
    }

    pub fn frames(&self) -> usize {
        match self.af.frame_size() {
            0 => 0,
            n => self.size() / n,
        }
    }

    pub fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }

    pub fn set_eos(&mut self) {
        self.flags |= FLAG_EOS;
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.size())
            .field("stream", &self.stream)
            .field("stream_position", &self.stream_position)
            .field("eos", &self.is_eos())
            .finish()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.home.recycle(buffer);
    }
}

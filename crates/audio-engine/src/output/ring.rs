//! Bounded sample ring between the output stage and a realtime device callback.
//!
//! The output stage pushes interleaved `f32` samples without blocking (it waits on device
//! readiness instead), and the callback pops whatever is available:
//! - output stage → ring (non-blocking push, partial when full)
//! - device callback drains the ring (non-blocking pop)
//!
//! Every pop notifies the writer through a coalescing channel so it can refill.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crossbeam_channel::Sender;

use crate::output::DeviceEvent;

/// Seconds of audio the ring holds when the configured value is unusable.
const FALLBACK_SECONDS: f32 = 0.5;

/// Ring capacity in samples for `seconds` of audio; a bad `seconds` falls back to half a second.
pub fn ring_capacity(rate: u32, channels: usize, seconds: f32) -> usize {
    let seconds = match seconds {
        s if s.is_finite() && s > 0.0 => s,
        _ => FALLBACK_SECONDS,
    };
    ((rate as f32 * seconds).ceil() as usize).saturating_mul(channels)
}

/// Interleaved `f32` samples shared with the device callback. Only whole frames go in or out.
pub struct SampleRing {
    channels: usize,
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
    space: Option<Sender<DeviceEvent>>,
    /// Start-relative millisecond stamp of the last underrun warning.
    last_underrun_ms: AtomicU64,
    started: Instant,
}

impl SampleRing {
    /// `space` receives a notification after every pop that frees room.
    pub fn new(channels: usize, capacity: usize, space: Option<Sender<DeviceEvent>>) -> Self {
        Self {
            channels: channels.max(1),
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            space,
            last_underrun_ms: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn max_frames(&self) -> usize {
        self.capacity / self.channels
    }

    /// Buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.lock().len() / self.channels
    }

    /// Free room in frames (best-effort snapshot).
    pub fn space_frames(&self) -> usize {
        self.max_frames().saturating_sub(self.len_frames())
    }

    /// Push as many whole frames of `samples` as fit. Returns the number of samples taken.
    pub fn push_available(&self, samples: &[f32]) -> usize {
        let mut g = self.lock();
        let room = self.capacity.saturating_sub(g.len());
        let take = room.min(samples.len()) / self.channels * self.channels;
        g.extend(&samples[..take]);
        take
    }

    /// Pop up to `max_frames` frames, `None` when empty.
    pub fn pop(&self, max_frames: usize) -> Option<Vec<f32>> {
        let (out, left) = {
            let mut g = self.lock();
            let n = (g.len() / self.channels).min(max_frames) * self.channels;
            if n == 0 {
                return None;
            }
            let out: Vec<f32> = g.drain(..n).collect();
            (out, g.len())
        };
        if let Some(tx) = &self.space {
            if tx.is_empty() {
                let _ = tx.try_send(DeviceEvent::Writable);
            }
        }
        self.warn_if_starving(left);
        Some(out)
    }

    /// Drop everything buffered.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Rate-limited to one message per second.
    fn warn_if_starving(&self, left: usize) {
        let threshold = (self.capacity / 8).max(self.channels * 16);
        if left == 0 || left >= threshold {
            return;
        }
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_underrun_ms.load(Ordering::Relaxed);
        if last == 0 || now.saturating_sub(last) > 1000 {
            self.last_underrun_ms.store(now.max(1), Ordering::Relaxed);
            tracing::debug!(left, threshold, "sample ring running low");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn capacity_falls_back_on_bad_seconds() {
        assert_eq!(ring_capacity(44_100, 2, 1.0), 88_200);
        assert_eq!(ring_capacity(44_100, 1, 0.0), 22_050);
        assert_eq!(ring_capacity(8_000, 2, f32::NAN), 8_000);
        assert_eq!(ring_capacity(8_000, 2, f32::NEG_INFINITY), 8_000);
    }

    #[test]
    fn pop_empty_returns_none() {
        let ring = SampleRing::new(2, 16, None);
        assert!(ring.pop(4).is_none());
    }

    #[test]
    fn push_is_partial_when_full() {
        let ring = SampleRing::new(2, 6, None);
        assert_eq!(ring.push_available(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]), 6);
        assert_eq!(ring.space_frames(), 0);
        assert_eq!(ring.push_available(&[9.0, 10.0]), 0);
        assert_eq!(ring.pop(2).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ring.len_frames(), 1);
        ring.clear();
        assert_eq!(ring.len_frames(), 0);
    }

    #[test]
    fn pop_notifies_writer() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let ring = Arc::new(SampleRing::new(1, 64, Some(tx)));
        ring.push_available(&[0.5; 32]);
        let reader = ring.clone();
        thread::spawn(move || while reader.pop(8).is_some() {}).join().unwrap();
        assert!(matches!(rx.recv_timeout(Duration::from_millis(100)), Ok(DeviceEvent::Writable)));
        assert_eq!(ring.len_frames(), 0);
    }
}

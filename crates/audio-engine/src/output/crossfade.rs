//! Crossfade between the tail of one stream and the head of the next.
//!
//! The output stage withholds the last `duration` of a stream whose length is known and hands
//! those bytes to [`Crossfade::record`]. When the next stream starts in the same format its
//! first frames are mixed with the recorded tail through [`Crossfade::mix`]; otherwise the tail
//! is played out unmixed with [`Crossfade::take_tail`].

use crate::format::{AudioFormat, sample};
use crate::output::convert;

#[derive(Debug, Default)]
pub struct Crossfade {
    duration_ms: u32,
    af: AudioFormat,
    tail: Vec<f32>,
    /// Samples of the tail already mixed into the next stream.
    mixed: usize,
}

impl Crossfade {
    pub fn new(duration_ms: u32) -> Self {
        Self {
            duration_ms,
            ..Self::default()
        }
    }

    pub fn set_duration(&mut self, duration_ms: u32) {
        self.duration_ms = duration_ms;
    }

    pub fn is_enabled(&self) -> bool {
        self.duration_ms > 0
    }

    /// Frames to withhold at the end of a stream in `af`, or 0 when fading is off for it.
    pub fn window_frames(&self, af: &AudioFormat) -> u64 {
        if !self.is_enabled() || !Self::can_fade(af) {
            return 0;
        }
        af.rate as u64 * self.duration_ms as u64 / 1000
    }

    fn can_fade(af: &AudioFormat) -> bool {
        let mut f = *af;
        if !f.is_native_order() {
            f.swap();
        }
        matches!(f.format, sample::FLOAT | sample::S16)
    }

    /// Append withheld tail bytes of the stream in `af`.
    pub fn record(&mut self, af: &AudioFormat, data: &[u8]) {
        if self.af != *af {
            self.tail.clear();
            self.mixed = 0;
            self.af = *af;
        }
        self.tail.extend(convert::to_f32(af, data));
    }

    pub fn is_recording(&self) -> bool {
        self.mixed < self.tail.len()
    }

    /// Frames of recorded tail not yet played.
    pub fn pending_frames(&self) -> usize {
        (self.tail.len() - self.mixed) / self.af.channels.max(1) as usize
    }

    /// True when the head of a stream in `af` can be mixed with the recorded tail.
    pub fn can_mix(&self, af: &AudioFormat) -> bool {
        self.is_recording() && self.af == *af
    }

    /// Mix the head of the next stream in place.
    ///
    /// Uses a cubic curve: the incoming stream is weighted `p^3` and the outgoing tail `1 - p^3`,
    /// where `p` runs from 0 to 1 across the recorded tail.
    pub fn mix(&mut self, af: &AudioFormat, data: &mut Vec<u8>) {
        if !self.can_mix(af) {
            return;
        }
        let mut head = convert::to_f32(af, data);
        let total = self.tail.len().max(1) as f32;
        let n = head.len().min(self.tail.len() - self.mixed);
        for (i, s) in head.iter_mut().take(n).enumerate() {
            let p = (self.mixed + i) as f32 / total;
            let fade_in = p * p * p;
            *s = *s * fade_in + self.tail[self.mixed + i] * (1.0 - fade_in);
        }
        self.mixed += n;
        data.clear();
        convert::from_f32(af, &head, data);
        if !self.is_recording() {
            self.reset();
        }
    }

    /// Remaining tail, unmixed, for playing out when the next stream cannot be faded into.
    pub fn take_tail(&mut self) -> Option<(AudioFormat, Vec<u8>)> {
        if !self.is_recording() {
            return None;
        }
        let mut out = Vec::new();
        convert::from_f32(&self.af, &self.tail[self.mixed..], &mut out);
        let af = self.af;
        self.reset();
        Some((af, out))
    }

    pub fn reset(&mut self) {
        self.tail.clear();
        self.mixed = 0;
    }
}

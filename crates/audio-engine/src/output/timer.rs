//! Actions deferred until the device has played up to a given frame.
//!
//! The output stage counts every frame it hands to the device. A timer stores the count at
//! which its action becomes due; it fires once `written - delay` (the frames actually played)
//! reaches it.

use crate::event::MetaInfo;

#[derive(Debug, Clone, PartialEq)]
pub enum TimerAction {
    /// The first frame of a new stream became audible.
    Bos,
    /// Tags for the stream that is now playing.
    Meta(MetaInfo),
    /// Less than a second of the ending stream remains.
    Eos { stream: u32 },
}

#[derive(Debug)]
struct FrameTimer {
    at: u64,
    action: TimerAction,
}

#[derive(Debug, Default)]
pub struct FrameTimers {
    timers: Vec<FrameTimer>,
}

impl FrameTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, at: u64, action: TimerAction) {
        tracing::trace!(at, ?action, "timer armed");
        self.timers.push(FrameTimer { at, action });
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Remove and return every action due at `played`, in arming order.
    pub fn expire(&mut self, played: u64) -> Vec<TimerAction> {
        let mut due = Vec::new();
        self.timers.retain(|t| {
            if t.at <= played {
                due.push(t.action.clone());
                false
            } else {
                true
            }
        });
        due
    }

    /// Remove and return everything regardless of position.
    pub fn fire_all(&mut self) -> Vec<TimerAction> {
        self.timers.drain(..).map(|t| t.action).collect()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

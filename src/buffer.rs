//! Fixed-capacity buffers
//!
//! [`FrameBuffer`] keeps the most recent per-second piezo frames of one side
//! and assembles waveform windows on demand. [`BoundedHistory`] is the
//! oldest-evicted value history used for heart, breath and HRV tracking.
//! Both are bounded by construction.

use std::collections::VecDeque;

use crate::error::{SignalError, SignalResult};
use crate::types::SideSamples;

/// Piezo channel of one side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiezoChannel {
    /// Channel 1, present on every pad
    Primary,
    /// Channel 2, present on dual-sensor pads only
    Secondary,
}

impl PiezoChannel {
    pub fn number(&self) -> u8 {
        match self {
            PiezoChannel::Primary => 1,
            PiezoChannel::Secondary => 2,
        }
    }
}

/// Concatenated samples of consecutive frames
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformWindow {
    /// Timestamp of the first frame in the window
    pub start_ts: i64,
    /// Timestamp of the last frame in the window
    pub end_ts: i64,
    pub samples: Vec<i32>,
}

/// Ring buffer of per-second frames for one side
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    frames: VecDeque<SideSamples>,
    capacity: usize,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` seconds of frames
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame, evicting the oldest once full
    pub fn push(&mut self, frame: SideSamples) {
        self.frames.push_back(frame);
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Whether every buffered frame carries the secondary channel
    pub fn has_secondary(&self) -> bool {
        !self.frames.is_empty() && self.frames.iter().all(|f| f.secondary.is_some())
    }

    /// The most recent `seconds` frames of `channel`, concatenated
    pub fn window(&self, channel: PiezoChannel, seconds: usize) -> SignalResult<WaveformWindow> {
        if seconds == 0 || self.frames.len() < seconds {
            return Err(SignalError::InsufficientData(format!(
                "{} of {} seconds buffered",
                self.frames.len(),
                seconds
            )));
        }

        let frames = self.frames.range(self.frames.len() - seconds..);
        let mut samples = Vec::new();
        let mut start_ts = None;
        let mut end_ts = 0;
        for frame in frames {
            let chunk = match channel {
                PiezoChannel::Primary => Some(&frame.primary),
                PiezoChannel::Secondary => frame.secondary.as_ref(),
            };
            let chunk = chunk.ok_or_else(|| {
                SignalError::InsufficientData(format!("frame {} has no channel 2", frame.ts))
            })?;
            samples.extend_from_slice(chunk);
            start_ts.get_or_insert(frame.ts);
            end_ts = frame.ts;
        }

        Ok(WaveformWindow {
            start_ts: start_ts.unwrap_or(end_ts),
            end_ts,
            samples,
        })
    }
}

/// Value history that evicts its oldest entry beyond `capacity`
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl BoundedHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// Snapshot of the values, oldest first
    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    /// Mean of the whole history; `None` when empty
    pub fn mean(&self) -> Option<f64> {
        self.recent_mean(self.values.len())
    }

    /// Mean of the most recent `count` values; `None` when empty
    pub fn recent_mean(&self, count: usize) -> Option<f64> {
        let take = count.min(self.values.len());
        if take == 0 {
            return None;
        }
        let sum: f64 = self.values.iter().rev().take(take).sum();
        Some(sum / take as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_frame(ts: i64, value: i32, dual: bool) -> SideSamples {
        SideSamples {
            ts,
            primary: vec![value; 3],
            secondary: dual.then(|| vec![-value; 3]),
        }
    }

    #[test]
    fn test_frame_buffer_evicts_oldest() {
        let mut buffer = FrameBuffer::new(3);
        for ts in 0..5 {
            buffer.push(make_frame(ts, ts as i32, true));
        }
        assert_eq!(buffer.len(), 3);

        let window = buffer.window(PiezoChannel::Primary, 2).unwrap();
        assert_eq!(window.start_ts, 3);
        assert_eq!(window.end_ts, 4);
        assert_eq!(window.samples, vec![3, 3, 3, 4, 4, 4]);

        let window = buffer.window(PiezoChannel::Secondary, 1).unwrap();
        assert_eq!(window.samples, vec![-4, -4, -4]);
    }

    #[test]
    fn test_window_requires_enough_frames() {
        let mut buffer = FrameBuffer::new(10);
        buffer.push(make_frame(0, 1, false));
        assert!(matches!(
            buffer.window(PiezoChannel::Primary, 2),
            Err(SignalError::InsufficientData(_))
        ));
        assert!(buffer.window(PiezoChannel::Secondary, 1).is_err());
        assert!(!buffer.has_secondary());
    }

    #[test]
    fn test_bounded_history() {
        let mut history = BoundedHistory::new(4);
        for v in 1..=10 {
            history.push(v as f64);
            assert!(history.len() <= history.capacity());
        }
        assert!(history.is_full());
        assert_eq!(history.to_vec(), vec![7.0, 8.0, 9.0, 10.0]);
        assert_eq!(history.mean(), Some(8.5));
        assert_eq!(history.recent_mean(2), Some(9.5));
        assert_eq!(history.recent_mean(25), Some(8.5));

        history.clear();
        assert_eq!(history.mean(), None);
    }
}

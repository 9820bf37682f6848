//! Accumulation gate for unknown faces.
//!
//! An unknown detection is only persisted after it has been seen at the
//! same place for `threshold` frames. The tracking key is the bounding box
//! itself, so a face that moves even one pixel starts a new count; this is
//! a known limitation. Keys live for the life of the process, so memory
//! grows with every distinct box seen; jittery detections add a key on most
//! frames. [`CaptureDebouncer::tracked`] reports the current count.

use crate::types::FaceRegion;
use std::collections::HashMap;

/// Frame-local position of a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackingKey {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl From<&FaceRegion> for TrackingKey {
    fn from(r: &FaceRegion) -> Self {
        Self {
            top: r.top,
            right: r.right,
            bottom: r.bottom,
            left: r.left,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Accumulating(u32),
    Captured,
}

/// What the caller should do with this sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Seen this many times so far, below the threshold.
    Accumulating(u32),
    /// Threshold reached on this sighting: persist it now.
    Capture,
    /// Already persisted earlier; ignore.
    AlreadyCaptured,
}

#[derive(Debug)]
pub struct CaptureDebouncer {
    threshold: u32,
    keys: HashMap<TrackingKey, KeyState>,
}

impl CaptureDebouncer {
    /// A threshold of 0 behaves like 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            keys: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record one sighting of `key`.
    ///
    /// Returns [`Observation::Capture`] exactly once per key. The key is
    /// terminal afterwards, whether or not the caller's save succeeds.
    pub fn observe(&mut self, key: TrackingKey) -> Observation {
        let tracked = self.keys.len();
        let state = self.keys.entry(key).or_insert_with(|| {
            tracing::debug!(tracked = tracked + 1, "tracking new unknown face position");
            KeyState::Accumulating(0)
        });
        match *state {
            KeyState::Captured => Observation::AlreadyCaptured,
            KeyState::Accumulating(n) => {
                let seen = n + 1;
                if seen >= self.threshold {
                    *state = KeyState::Captured;
                    Observation::Capture
                } else {
                    *state = KeyState::Accumulating(seen);
                    Observation::Accumulating(seen)
                }
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(left: u32) -> TrackingKey {
        TrackingKey {
            top: 10,
            right: left + 50,
            bottom: 60,
            left,
        }
    }

    #[test]
    fn test_below_threshold_accumulates() {
        let mut debouncer = CaptureDebouncer::new(10);
        for i in 1..10 {
            assert_eq!(debouncer.observe(key(0)), Observation::Accumulating(i));
        }
    }

    #[test]
    fn test_capture_exactly_once() {
        let mut debouncer = CaptureDebouncer::new(10);
        let outcomes: Vec<_> = (0..11).map(|_| debouncer.observe(key(0))).collect();
        assert_eq!(outcomes[8], Observation::Accumulating(9));
        assert_eq!(outcomes[9], Observation::Capture);
        assert_eq!(outcomes[10], Observation::AlreadyCaptured);
        let captures = outcomes.iter().filter(|o| **o == Observation::Capture).count();
        assert_eq!(captures, 1);
    }

    #[test]
    fn test_moved_box_is_a_new_key() {
        let mut debouncer = CaptureDebouncer::new(2);
        assert_eq!(debouncer.observe(key(0)), Observation::Accumulating(1));
        assert_eq!(debouncer.observe(key(1)), Observation::Accumulating(1));
        assert_eq!(debouncer.observe(key(0)), Observation::Capture);
        assert_eq!(debouncer.tracked(), 2);
    }

    #[test]
    fn test_every_jittered_box_is_retained() {
        let mut d = CaptureDebouncer::new(5);
        for left in 0..20 {
            d.observe(key(left));
        }
        d.observe(key(0));
        assert_eq!(d.tracked(), 20);
    }

    #[test]
    fn test_threshold_one_captures_immediately() {
        let mut debouncer = CaptureDebouncer::new(0);
        assert_eq!(debouncer.threshold(), 1);
        assert_eq!(debouncer.observe(key(0)), Observation::Capture);
        assert_eq!(debouncer.observe(key(0)), Observation::AlreadyCaptured);
    }

    #[test]
    fn test_key_from_region_ignores_confidence() {
        let a = FaceRegion { top: 1, right: 5, bottom: 6, left: 2, confidence: 0.6 };
        let b = FaceRegion { confidence: 0.9, ..a };
        assert_eq!(TrackingKey::from(&a), TrackingKey::from(&b));
    }
}

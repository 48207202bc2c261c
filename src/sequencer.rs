//! Frame-index continuity tracking.
//!
//! Every notification (and every serial data frame) carries a 16-bit frame index that
//! increments by one per packet and wraps at 65535. The sequencer turns the raw index
//! into a *gap*: the number of packet slots that elapsed since the previous frame.
//! A gap of 1 is the normal case; a gap of `n > 1` means `n - 1` packets were lost and
//! the caller must fill that many slots before storing the real payload.

use log::{debug, warn};

/// Deltas at or above this value are read as a backwards jump, not as a loss.
const BACKWARDS_THRESHOLD: u16 = 0x8000;

/// Tracks the last observed frame index of one connection.
#[derive(Debug, Default, Clone)]
pub struct FrameSequencer {
    previous: Option<u16>,
    lost_slots: u64,
    anomalies: u64,
}

impl FrameSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a raw frame index and return the number of slots to process.
    ///
    /// Slots `0..gap - 1` are lost and must be interpolated; the final slot carries the
    /// payload that arrived with `raw_index`. A return value of 0 means the frame is a
    /// duplicate and must be skipped.
    pub fn observe(&mut self, raw_index: u16) -> u32 {
        let previous = *self
            .previous
            .get_or_insert_with(|| raw_index.wrapping_sub(1));
        let delta = raw_index.wrapping_sub(previous);

        if delta == 0 {
            warn!("duplicate frame index, skipping frame: index={}", raw_index);
            self.anomalies += 1;
            return 0;
        }

        self.previous = Some(raw_index);

        if delta >= BACKWARDS_THRESHOLD {
            warn!(
                "frame index moved backwards, resynchronising: previous={}, index={}",
                previous, raw_index
            );
            self.anomalies += 1;
            return 1;
        }

        if delta > 1 {
            debug!(
                "frame loss detected: previous={}, index={}, lost={}",
                previous,
                raw_index,
                delta - 1
            );
            self.lost_slots += u64::from(delta - 1);
        }
        u32::from(delta)
    }

    /// Last index observed, if any.
    pub fn previous(&self) -> Option<u16> {
        self.previous
    }

    /// Total slots reported as lost since the last reset.
    pub fn lost_slots(&self) -> u64 {
        self.lost_slots
    }

    /// Duplicate or backwards indices seen since the last reset.
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

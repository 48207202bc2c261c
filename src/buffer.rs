//! Fixed-capacity accumulation buffer.
//!
//! Packet payloads are appended slot by slot. When a slot would straddle the capacity
//! boundary it is split: the head completes the pending buffer (which is flushed as an
//! owned snapshot) and the tail is parked in the overflow buffer, then copied to the
//! front of the next pending buffer.
//!
//! Lost slots are written as a run of [`LOST_PACKET_FILLER`] bytes, which the decoder
//! maps to NaN.

use log::trace;

use crate::errors::{DriverError, Result};

/// Byte written for every position of a lost packet slot.
pub const LOST_PACKET_FILLER: u8 = 0xFF;

/// Owned snapshot of a full buffer, ready to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushEvent {
    /// Zero-based flush counter since the last reset.
    pub sequence: u64,
    /// Exactly `capacity` bytes of raw sample words.
    pub bytes: Vec<u8>,
    /// Slots in this snapshot that were lost-packet filler (whole or partial).
    pub interpolated_slots: usize,
}

/// Pending/overflow accumulation state for one session.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pending: Vec<u8>,
    overflow: Vec<u8>,
    position: usize,
    capacity: usize,
    packet_size: usize,
    overflow_len: usize,
    has_overflow: bool,
    overflow_is_filler: bool,
    interpolated: usize,
    sequence: u64,
}

impl SampleBuffer {
    /// Create a buffer flushing every `capacity` bytes, fed `packet_size` bytes per slot.
    pub fn new(capacity: usize, packet_size: usize) -> Result<Self> {
        if capacity == 0 || packet_size == 0 {
            return Err(DriverError::InvalidInput(
                "buffer capacity and packet size must be non-zero".into(),
            ));
        }
        if packet_size > capacity {
            return Err(DriverError::InvalidInput(format!(
                "packet size {packet_size} exceeds buffer capacity {capacity}"
            )));
        }
        Ok(Self {
            pending: vec![0u8; capacity],
            overflow: vec![0u8; packet_size],
            position: 0,
            capacity,
            packet_size,
            overflow_len: 0,
            has_overflow: false,
            overflow_is_filler: false,
            interpolated: 0,
            sequence: 0,
        })
    }

    /// Append one packet slot.
    ///
    /// `slot` must be exactly `packet_size` bytes when `is_real`; it is ignored for lost
    /// slots. Returns the flushed snapshot when this slot completed the buffer.
    pub fn accept(&mut self, slot: &[u8], is_real: bool) -> Result<Option<FlushEvent>> {
        if is_real && slot.len() != self.packet_size {
            return Err(DriverError::InvalidInput(format!(
                "slot of {} bytes, expected {}",
                slot.len(),
                self.packet_size
            )));
        }
        let src = is_real.then_some(slot);
        if !is_real {
            self.interpolated += 1;
        }
        self.has_overflow = false;

        let head = (self.capacity - self.position).min(self.packet_size);
        copy_or_fill(
            &mut self.pending[self.position..self.position + head],
            src.map(|s| &s[..head]),
        );
        self.position += head;

        if head < self.packet_size {
            let tail = self.packet_size - head;
            copy_or_fill(&mut self.overflow[..tail], src.map(|s| &s[head..]));
            self.overflow_len = tail;
            self.has_overflow = true;
            self.overflow_is_filler = !is_real;
            trace!("slot straddles capacity: head={}, tail={}", head, tail);
        }

        if self.position < self.capacity {
            return Ok(None);
        }
        Ok(Some(self.flush()))
    }

    fn flush(&mut self) -> FlushEvent {
        let event = FlushEvent {
            sequence: self.sequence,
            bytes: self.pending.clone(),
            interpolated_slots: self.interpolated,
        };
        self.sequence += 1;

        let carried = self.overflow_len;
        self.pending[..carried].copy_from_slice(&self.overflow[..carried]);
        self.position = carried;
        self.overflow_len = 0;
        self.interpolated = usize::from(carried > 0 && self.overflow_is_filler);
        self.overflow_is_filler = false;

        event
    }

    /// Bytes accumulated towards the next flush.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Whether the most recent slot straddled the capacity boundary.
    pub fn has_overflow(&self) -> bool {
        self.has_overflow
    }

    /// Number of flushes emitted since the last reset.
    pub fn flushes(&self) -> u64 {
        self.sequence
    }

    /// Drop all accumulated bytes and restart the flush counter.
    pub fn reset(&mut self) {
        self.pending.fill(0);
        self.overflow.fill(0);
        self.position = 0;
        self.overflow_len = 0;
        self.has_overflow = false;
        self.overflow_is_filler = false;
        self.interpolated = 0;
        self.sequence = 0;
    }
}

fn copy_or_fill(dst: &mut [u8], src: Option<&[u8]>) {
    match src {
        Some(src) => dst.copy_from_slice(src),
        None => dst.fill(LOST_PACKET_FILLER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(SampleBuffer::new(0, 4).is_err());
        assert!(SampleBuffer::new(8, 0).is_err());
        assert!(SampleBuffer::new(8, 16).is_err());
    }

    #[test]
    fn test_rejects_wrong_slot_length() {
        let mut buf = SampleBuffer::new(16, 4).unwrap();
        assert!(matches!(
            buf.accept(&[1, 2, 3], true),
            Err(DriverError::InvalidInput(_))
        ));
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_exact_fill_flushes_once() {
        let mut buf = SampleBuffer::new(8, 4).unwrap();
        assert!(buf.accept(&[1, 2, 3, 4], true).unwrap().is_none());
        assert_eq!(buf.position(), 4);

        let flush = buf.accept(&[5, 6, 7, 8], true).unwrap().unwrap();
        assert_eq!(flush.bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(flush.sequence, 0);
        assert_eq!(flush.interpolated_slots, 0);
        assert_eq!(buf.position(), 0);
        assert!(!buf.has_overflow());
    }

    #[test]
    fn test_straddling_slot_splits_into_overflow() {
        let mut buf = SampleBuffer::new(6, 4).unwrap();
        assert!(buf.accept(&[1, 2, 3, 4], true).unwrap().is_none());

        let flush = buf.accept(&[5, 6, 7, 8], true).unwrap().unwrap();
        assert_eq!(flush.bytes, vec![1, 2, 3, 4, 5, 6]);
        assert!(buf.has_overflow());
        assert_eq!(buf.position(), 2);

        let flush = buf.accept(&[9, 10, 11, 12], true).unwrap().unwrap();
        assert_eq!(flush.bytes, vec![7, 8, 9, 10, 11, 12]);
        assert_eq!(flush.sequence, 1);
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_one_flush_per_capacity_bytes() {
        let mut buf = SampleBuffer::new(10, 4).unwrap();
        let mut flushes = 0;
        for i in 0..25u8 {
            if buf.accept(&[i; 4], true).unwrap().is_some() {
                flushes += 1;
            }
        }
        // 100 bytes accepted -> exactly 10 flushes, nothing left over.
        assert_eq!(flushes, 10);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.flushes(), 10);
    }

    #[test]
    fn test_lost_slot_writes_filler() {
        let mut buf = SampleBuffer::new(8, 4).unwrap();
        buf.accept(&[], false).unwrap();
        let flush = buf.accept(&[1, 2, 3, 4], true).unwrap().unwrap();
        assert_eq!(flush.bytes, vec![0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3, 4]);
        assert_eq!(flush.interpolated_slots, 1);
    }

    #[test]
    fn test_straddling_filler_counts_in_both_flushes() {
        let mut buf = SampleBuffer::new(6, 4).unwrap();
        buf.accept(&[1, 2, 3, 4], true).unwrap();
        let first = buf.accept(&[], false).unwrap().unwrap();
        assert_eq!(first.bytes, vec![1, 2, 3, 4, 0xFF, 0xFF]);
        assert_eq!(first.interpolated_slots, 1);

        let second = buf.accept(&[5, 6, 7, 8], true).unwrap().unwrap();
        assert_eq!(second.bytes, vec![0xFF, 0xFF, 5, 6, 7, 8]);
        assert_eq!(second.interpolated_slots, 1);
    }

    #[test]
    fn test_snapshot_is_independent_of_buffer() {
        let mut buf = SampleBuffer::new(4, 4).unwrap();
        let flush = buf.accept(&[1, 1, 1, 1], true).unwrap().unwrap();
        buf.accept(&[2, 2, 2, 2], true).unwrap();
        assert_eq!(flush.bytes, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_reset_discards_partial_data() {
        let mut buf = SampleBuffer::new(6, 4).unwrap();
        buf.accept(&[1, 2, 3, 4], true).unwrap();
        buf.accept(&[5, 6, 7, 8], true).unwrap();
        buf.reset();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.flushes(), 0);
        assert!(buf.accept(&[1, 2, 3, 4], true).unwrap().is_none());
    }
}

//! In-band framing for the SPP serial transport.
//!
//! The serial link is an unstructured byte stream; the device delimits packets as:
//!
//! ```text
//! 0x3C | len (u16 BE) | command (3 = data, 4 = battery) | compression (0/1) | frame (u16 BE) | payload
//! ```
//!
//! [`ByteStreamFramer`] is a byte-at-a-time state machine that recovers those packets.
//! Malformed headers are dropped and the machine waits for the next sync byte; they are
//! never reported as errors because the stream resynchronises on its own.

use log::{debug, trace};

/// Frame header sync byte.
pub const SYNC_BYTE: u8 = 0x3C;

/// Command byte of a sample data frame.
pub const CMD_DATA: u8 = 3;

/// Command byte of a battery report.
pub const CMD_BATTERY: u8 = 4;

/// Largest payload the device ever announces; anything above is line noise.
pub const MAX_SERIAL_PAYLOAD: usize = 4096;

/// Command byte plus the two frame-number bytes kept in front of the payload.
const FRAME_PREFIX: usize = 3;

/// Percentages indexed by the device's battery code.
const BATTERY_PERCENT: [u8; 7] = [0, 15, 30, 50, 65, 85, 100];

// ============================================================================
// Events
// ============================================================================

/// Battery charge as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryLevel {
    Percent(u8),
    Unknown,
}

impl BatteryLevel {
    /// Map a raw battery code (`0..=6`, `0xFF` = unknown) to a charge level.
    pub fn from_code(code: u8) -> Self {
        match BATTERY_PERCENT.get(usize::from(code)) {
            Some(&percent) => BatteryLevel::Percent(percent),
            None => {
                if code != 0xFF {
                    debug!("unrecognised battery code: {:#04X}", code);
                }
                BatteryLevel::Unknown
            }
        }
    }

    pub fn percent(self) -> Option<u8> {
        match self {
            BatteryLevel::Percent(p) => Some(p),
            BatteryLevel::Unknown => None,
        }
    }
}

/// A complete sample data frame recovered from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub frame_number: u16,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerEvent {
    Data(DataFrame),
    Battery(BatteryLevel),
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramerState {
    #[default]
    Idle,
    ReadingLength,
    ReadingCommand,
    ReadingCompressionFlag,
    ReadingFrameNumber,
    ReadingPayload,
}

/// Recovers [`FramerEvent`]s from serial bytes.
#[derive(Debug, Default)]
pub struct ByteStreamFramer {
    state: FramerState,
    length_buf: [u8; 2],
    payload_size: usize,
    command: u8,
    compressed: bool,
    counter: usize,
    frame: Vec<u8>,
    desyncs: u64,
    noise_bytes: u64,
}

impl ByteStreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FramerState {
        self.state
    }

    /// Malformed frames dropped since the last reset.
    pub fn desyncs(&self) -> u64 {
        self.desyncs
    }

    /// Non-zero bytes discarded while waiting for a sync byte.
    pub fn noise_bytes(&self) -> u64 {
        self.noise_bytes
    }

    /// Feed a chunk of bytes, collecting every event it completes.
    pub fn push(&mut self, data: &[u8]) -> Vec<FramerEvent> {
        data.iter().filter_map(|&b| self.feed(b)).collect()
    }

    /// Advance the state machine by one byte.
    pub fn feed(&mut self, byte: u8) -> Option<FramerEvent> {
        match self.state {
            FramerState::Idle => {
                self.on_idle(byte);
                None
            }
            FramerState::ReadingLength => {
                self.length_buf[self.counter] = byte;
                self.counter += 1;
                if self.counter == self.length_buf.len() {
                    self.payload_size = usize::from(u16::from_be_bytes(self.length_buf));
                    if self.payload_size > MAX_SERIAL_PAYLOAD {
                        self.desync(byte, "payload length out of range");
                        return None;
                    }
                    self.frame = Vec::with_capacity(self.payload_size + FRAME_PREFIX);
                    self.counter = 0;
                    self.state = FramerState::ReadingCommand;
                }
                None
            }
            FramerState::ReadingCommand => {
                if byte != CMD_DATA && byte != CMD_BATTERY {
                    self.desync(byte, "unknown command");
                    return None;
                }
                self.command = byte;
                self.frame.push(byte);
                self.counter = 1;
                self.state = FramerState::ReadingCompressionFlag;
                None
            }
            FramerState::ReadingCompressionFlag => {
                if byte > 1 {
                    self.desync(byte, "invalid compression flag");
                    return None;
                }
                self.compressed = byte == 1;
                self.state = FramerState::ReadingFrameNumber;
                None
            }
            FramerState::ReadingFrameNumber => {
                self.frame.push(byte);
                self.counter += 1;
                if self.counter == FRAME_PREFIX {
                    self.state = FramerState::ReadingPayload;
                    if self.command == CMD_DATA && self.payload_size == 0 {
                        return Some(self.finish_data());
                    }
                }
                None
            }
            FramerState::ReadingPayload => {
                if self.command == CMD_BATTERY {
                    self.state = FramerState::Idle;
                    return Some(FramerEvent::Battery(BatteryLevel::from_code(byte)));
                }
                self.frame.push(byte);
                self.counter += 1;
                if self.counter == self.payload_size + FRAME_PREFIX {
                    return Some(self.finish_data());
                }
                None
            }
        }
    }

    /// Return to `Idle`, discarding any partial frame.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn on_idle(&mut self, byte: u8) {
        if byte == SYNC_BYTE {
            self.counter = 0;
            self.state = FramerState::ReadingLength;
        } else if byte != 0 {
            self.noise_bytes += 1;
            trace!("discarding noise byte while idle: {:#04X}", byte);
        }
    }

    fn desync(&mut self, byte: u8, reason: &str) {
        self.desyncs += 1;
        debug!(
            "serial frame dropped, resynchronising: reason={}, byte={:#04X}, state={:?}",
            reason, byte, self.state
        );
        self.state = FramerState::Idle;
        self.frame.clear();
        self.counter = 0;
        // The offending byte may itself open the next frame.
        self.on_idle(byte);
    }

    fn finish_data(&mut self) -> FramerEvent {
        let mut frame = std::mem::take(&mut self.frame);
        let payload = frame.split_off(FRAME_PREFIX);
        self.state = FramerState::Idle;
        self.counter = 0;
        FramerEvent::Data(DataFrame {
            frame_number: u16::from_be_bytes([frame[1], frame[2]]),
            compressed: self.compressed,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(frame_number: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![SYNC_BYTE];
        bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        bytes.push(CMD_DATA);
        bytes.push(0);
        bytes.extend_from_slice(&frame_number.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_byte_at_a_time_emits_single_frame() {
        let mut framer = ByteStreamFramer::new();
        let bytes = data_frame(42, &[1, 2, 3, 4, 5]);

        let mut events = Vec::new();
        for &b in &bytes {
            if let Some(ev) = framer.feed(b) {
                events.push(ev);
            }
        }

        assert_eq!(events.len(), 1);
        match &events[0] {
            FramerEvent::Data(frame) => {
                assert_eq!(frame.frame_number, 42);
                assert!(!frame.compressed);
                assert_eq!(frame.payload, vec![1, 2, 3, 4, 5]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(framer.state(), FramerState::Idle);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut framer = ByteStreamFramer::new();
        let mut bytes = data_frame(1, &[9; 27]);
        bytes.extend(data_frame(2, &[8; 27]));
        bytes.extend(data_frame(3, &[7; 27]));

        let events = framer.push(&bytes);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], FramerEvent::Data(f) if f.frame_number == 3));
    }

    #[test]
    fn test_invalid_command_resynchronises_silently() {
        let mut framer = ByteStreamFramer::new();
        let bad = [SYNC_BYTE, 0x00, 0x04, 0x07];
        assert!(framer.push(&bad).is_empty());
        assert_eq!(framer.state(), FramerState::Idle);
        assert_eq!(framer.desyncs(), 1);

        let events = framer.push(&data_frame(5, &[1, 2]));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_invalid_command_mid_stream_drops_only_that_frame() {
        let mut framer = ByteStreamFramer::new();
        let mut bytes = data_frame(1, &[1, 2, 3]);
        let mut broken = data_frame(2, &[4, 5, 6]);
        broken[3] = 0x09;
        bytes.extend(broken);
        bytes.extend(data_frame(3, &[7, 8, 9]));

        let events = framer.push(&bytes);
        let numbers: Vec<u16> = events
            .iter()
            .filter_map(|e| match e {
                FramerEvent::Data(f) => Some(f.frame_number),
                FramerEvent::Battery(_) => None,
            })
            .collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(framer.desyncs(), 1);
    }

    #[test]
    fn test_invalid_compression_flag_resynchronises() {
        let mut framer = ByteStreamFramer::new();
        assert!(framer.push(&[SYNC_BYTE, 0, 1, CMD_DATA, 2]).is_empty());
        assert_eq!(framer.state(), FramerState::Idle);
        assert_eq!(framer.desyncs(), 1);
    }

    #[test]
    fn test_rejected_byte_can_start_next_frame() {
        let mut framer = ByteStreamFramer::new();
        let mut bytes = vec![SYNC_BYTE, 0, 2];
        bytes.extend(data_frame(11, &[1, 2]));
        let events = framer.push(&bytes);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FramerEvent::Data(f) if f.frame_number == 11));
    }

    #[test]
    fn test_oversized_length_resynchronises() {
        let mut framer = ByteStreamFramer::new();
        assert!(framer.push(&[SYNC_BYTE, 0xFF, 0xFF]).is_empty());
        assert_eq!(framer.state(), FramerState::Idle);
        assert_eq!(framer.desyncs(), 1);
    }

    #[test]
    fn test_compressed_flag_is_reported() {
        let mut framer = ByteStreamFramer::new();
        let mut bytes = data_frame(3, &[1]);
        bytes[4] = 1;
        let events = framer.push(&bytes);
        assert!(matches!(&events[0], FramerEvent::Data(f) if f.compressed));
    }

    #[test]
    fn test_empty_data_frame() {
        let mut framer = ByteStreamFramer::new();
        let events = framer.push(&data_frame(9, &[]));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FramerEvent::Data(f) if f.payload.is_empty()));
    }

    #[test]
    fn test_noise_before_sync_is_ignored() {
        let mut framer = ByteStreamFramer::new();
        let mut bytes = vec![0x00, 0x12, 0x00, 0x99];
        bytes.extend(data_frame(4, &[1, 2, 3]));
        assert_eq!(framer.push(&bytes).len(), 1);
        assert_eq!(framer.noise_bytes(), 2);
    }

    #[test]
    fn test_battery_frames() {
        let mut framer = ByteStreamFramer::new();
        let battery = |code: u8| vec![SYNC_BYTE, 0, 1, CMD_BATTERY, 0, 0, 0, code];

        let events = framer.push(&battery(0x02));
        assert_eq!(events, vec![FramerEvent::Battery(BatteryLevel::Percent(30))]);
        let events = framer.push(&battery(0x06));
        assert_eq!(events, vec![FramerEvent::Battery(BatteryLevel::Percent(100))]);
        let events = framer.push(&battery(0xFF));
        assert_eq!(events, vec![FramerEvent::Battery(BatteryLevel::Unknown)]);
    }

    #[test]
    fn test_battery_code_mapping() {
        let expected = [0, 15, 30, 50, 65, 85, 100];
        for (code, pct) in expected.iter().enumerate() {
            assert_eq!(BatteryLevel::from_code(code as u8).percent(), Some(*pct));
        }
        assert_eq!(BatteryLevel::from_code(0xFF), BatteryLevel::Unknown);
        assert_eq!(BatteryLevel::from_code(0x42), BatteryLevel::Unknown);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let mut framer = ByteStreamFramer::new();
        framer.push(&[SYNC_BYTE, 0, 4, CMD_DATA]);
        assert_eq!(framer.state(), FramerState::ReadingCompressionFlag);
        framer.reset();
        assert_eq!(framer.state(), FramerState::Idle);
    }
}

//! Per-connection acquisition state.
//!
//! An [`AcquisitionSession`] owns every piece of mutable ingestion state for one
//! connection: the frame sequencer, the serial framer and the sample buffer. It is fed
//! by exactly one reader and does no I/O or decoding; full buffers come back as
//! [`FlushEvent`]s for the caller to hand to the decode queue.
//!
//! # Lifecycle
//!
//! `start()` (re)initialises all state. `stop()` is a cancellation point: partial data
//! is discarded and notification ingestion is rejected with `NotReady` until the next
//! `start()`. Flushes already handed out are unaffected.

use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::buffer::{FlushEvent, SampleBuffer};
use crate::decoder::SampleDecoder;
use crate::errors::{DriverError, Result};
use crate::framer::{BatteryLevel, ByteStreamFramer, DataFrame, FramerEvent};
use crate::profile::{SessionConfig, NOTIFICATION_INDEX_BYTES};
use crate::sequencer::FrameSequencer;

/// One notification split into its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub index: u16,
    pub status_bytes: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> RawFrame<'a> {
    /// Split a notification according to `config`'s profile.
    pub fn parse(data: &'a [u8], config: &SessionConfig) -> Result<Self> {
        if data.len() != config.notification_bytes() {
            return Err(DriverError::InvalidInput(format!(
                "notification of {} bytes, expected {}",
                data.len(),
                config.notification_bytes()
            )));
        }
        let (index, rest) = data.split_at(NOTIFICATION_INDEX_BYTES);
        let (status_bytes, payload) = rest.split_at(config.profile.notification_status_bytes());
        Ok(Self {
            index: u16::from_be_bytes([index[0], index[1]]),
            status_bytes,
            payload,
        })
    }
}

/// Output of serial ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Flush(FlushEvent),
    Battery(BatteryLevel),
}

/// Counters since the last `start()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub lost_slots: u64,
    pub anomalies: u64,
    pub desyncs: u64,
    /// Frames discarded because they could not be buffered (wrong length, compressed).
    pub rejected_frames: u64,
    pub flushes: u64,
}

/// Explicit per-connection ingestion state.
#[derive(Debug)]
pub struct AcquisitionSession {
    config: SessionConfig,
    sequencer: FrameSequencer,
    framer: ByteStreamFramer,
    buffer: SampleBuffer,
    streaming: bool,
    frames: u64,
    rejected_frames: u64,
    battery: Option<BatteryLevel>,
    last_status: Vec<u8>,
    /// Counters of the run ended by the last `stop()`.
    stopped_stats: SessionStats,
}

impl AcquisitionSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let buffer = SampleBuffer::new(config.capacity_bytes(), config.packet_bytes())?;
        Ok(Self {
            config,
            sequencer: FrameSequencer::new(),
            framer: ByteStreamFramer::new(),
            buffer,
            streaming: false,
            frames: 0,
            rejected_frames: 0,
            battery: None,
            last_status: Vec::new(),
            stopped_stats: SessionStats::default(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// A decoder matching this session's profile and gain.
    pub fn decoder(&self) -> SampleDecoder {
        SampleDecoder::new(&self.config)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Reinitialise all state and accept frames.
    pub fn start(&mut self) {
        self.reset_state();
        self.streaming = true;
        info!(
            "acquisition session started: profile={:?}, packet_bytes={}, capacity_bytes={}",
            self.config.profile,
            self.config.packet_bytes(),
            self.config.capacity_bytes()
        );
    }

    /// Stop accepting frames and discard partial data.
    pub fn stop(&mut self) {
        if self.streaming {
            self.stopped_stats = self.live_stats();
            info!(
                "acquisition session stopped: frames={}, flushes={}, lost_slots={}",
                self.stopped_stats.frames,
                self.stopped_stats.flushes,
                self.stopped_stats.lost_slots
            );
        }
        self.streaming = false;
        self.reset_state();
    }

    /// Apply a new configuration; the session is left stopped.
    pub fn reconfigure(&mut self, config: SessionConfig) -> Result<()> {
        config.validate()?;
        self.buffer = SampleBuffer::new(config.capacity_bytes(), config.packet_bytes())?;
        self.config = config;
        self.stop();
        self.stopped_stats = SessionStats::default();
        Ok(())
    }

    fn reset_state(&mut self) {
        self.sequencer.reset();
        self.framer.reset();
        self.buffer.reset();
        self.frames = 0;
        self.rejected_frames = 0;
        self.last_status.clear();
    }

    /// Counters of the current run, or of the last run once stopped.
    pub fn stats(&self) -> SessionStats {
        if self.streaming {
            self.live_stats()
        } else {
            self.stopped_stats.clone()
        }
    }

    fn live_stats(&self) -> SessionStats {
        SessionStats {
            frames: self.frames,
            lost_slots: self.sequencer.lost_slots(),
            anomalies: self.sequencer.anomalies(),
            desyncs: self.framer.desyncs(),
            rejected_frames: self.rejected_frames,
            flushes: self.buffer.flushes(),
        }
    }

    /// Last battery level reported over the serial link.
    pub fn battery(&self) -> Option<BatteryLevel> {
        self.battery
    }

    /// Status bytes of the most recent notification (9-slot profile only).
    pub fn last_status(&self) -> &[u8] {
        &self.last_status
    }

    /// Seconds since session start for a sample ordinal.
    pub fn seconds_at(&self, ordinal: u64) -> f64 {
        ordinal as f64 / f64::from(self.config.sample_rate_hz)
    }

    /// Ingest one notification from the notification transport.
    pub fn ingest_notification(&mut self, data: &[u8]) -> Result<Vec<FlushEvent>> {
        if !self.streaming {
            return Err(DriverError::NotReady("session is stopped".into()));
        }
        let frame = RawFrame::parse(data, &self.config)?;
        if !frame.status_bytes.is_empty() {
            self.last_status.clear();
            self.last_status.extend_from_slice(frame.status_bytes);
        }
        let mut flushes = Vec::new();
        self.ingest_frame(frame.index, frame.payload, &mut flushes)?;
        Ok(flushes)
    }

    /// Ingest raw bytes from the serial transport.
    ///
    /// Battery reports are always delivered; data frames are dropped while stopped.
    pub fn ingest_serial(&mut self, data: &[u8]) -> Result<Vec<SessionEvent>> {
        let mut events = Vec::new();
        for event in self.framer.push(data) {
            match event {
                FramerEvent::Battery(level) => {
                    debug!("battery report: level={:?}", level);
                    self.battery = Some(level);
                    events.push(SessionEvent::Battery(level));
                }
                FramerEvent::Data(frame) => {
                    if !self.streaming {
                        trace!("data frame while stopped: frame={}", frame.frame_number);
                        continue;
                    }
                    let mut flushes = Vec::new();
                    self.ingest_data_frame(&frame, &mut flushes)?;
                    events.extend(flushes.into_iter().map(SessionEvent::Flush));
                }
            }
        }
        Ok(events)
    }

    fn ingest_data_frame(&mut self, frame: &DataFrame, out: &mut Vec<FlushEvent>) -> Result<()> {
        if frame.compressed {
            self.rejected_frames += 1;
            warn!(
                "dropping compressed data frame (unsupported): frame={}",
                frame.frame_number
            );
            return Ok(());
        }
        if frame.payload.len() != self.config.packet_bytes() {
            self.rejected_frames += 1;
            warn!(
                "dropping data frame with unexpected payload: frame={}, len={}, expected={}",
                frame.frame_number,
                frame.payload.len(),
                self.config.packet_bytes()
            );
            return Ok(());
        }
        self.ingest_frame(frame.frame_number, &frame.payload, out)
    }

    fn ingest_frame(&mut self, index: u16, payload: &[u8], out: &mut Vec<FlushEvent>) -> Result<()> {
        if payload.len() != self.config.packet_bytes() {
            return Err(DriverError::InvalidInput(format!(
                "payload of {} bytes, expected {}",
                payload.len(),
                self.config.packet_bytes()
            )));
        }
        let gap = self.sequencer.observe(index);
        if gap == 0 {
            return Ok(());
        }
        self.frames += 1;
        for slot in 0..gap {
            let is_real = slot == gap - 1;
            if let Some(flush) = self.buffer.accept(payload, is_real)? {
                trace!(
                    "buffer flushed: sequence={}, interpolated_slots={}",
                    flush.sequence,
                    flush.interpolated_slots
                );
                out.push(flush);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::{CMD_BATTERY, CMD_DATA, SYNC_BYTE};
    use crate::profile::DeviceProfile;

    fn notification(index: u16, word: [u8; 2]) -> Vec<u8> {
        let mut data = index.to_be_bytes().to_vec();
        data.extend_from_slice(&word);
        data.extend_from_slice(&word);
        data
    }

    fn single_sample_session(samples_per_flush: usize) -> AcquisitionSession {
        let cfg = SessionConfig::default()
            .with_samples_per_packet(1)
            .with_samples_per_flush(samples_per_flush);
        let mut session = AcquisitionSession::new(cfg).unwrap();
        session.start();
        session
    }

    #[test]
    fn test_rejects_ingest_while_stopped() {
        let mut session = AcquisitionSession::new(SessionConfig::default()).unwrap();
        assert!(matches!(
            session.ingest_notification(&[0u8; 18]),
            Err(DriverError::NotReady(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_notification_length() {
        let mut session = single_sample_session(4);
        assert!(matches!(
            session.ingest_notification(&[0u8; 5]),
            Err(DriverError::InvalidInput(_))
        ));
        assert_eq!(session.stats().frames, 0);
    }

    #[test]
    fn test_consecutive_notifications_fill_buffer() {
        let mut session = single_sample_session(4);
        let mut flushes = Vec::new();
        for i in 0..8u16 {
            flushes.extend(session.ingest_notification(&notification(i, [0x01, 0x12])).unwrap());
        }
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].bytes.len(), 16);
        assert_eq!(session.stats().lost_slots, 0);
    }

    #[test]
    fn test_gap_interpolates_lost_slots() {
        let mut session = single_sample_session(3);
        assert!(session
            .ingest_notification(&notification(100, [0x01, 0x12]))
            .unwrap()
            .is_empty());
        let flushes = session
            .ingest_notification(&notification(103, [0x01, 0x12]))
            .unwrap();
        // 1 real + 2 lost + 1 real = 4 slots -> one flush of 3 with one slot pending.
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].interpolated_slots, 2);
        assert_eq!(&flushes[0].bytes[4..12], &[0xFF; 8]);
        assert_eq!(session.stats().lost_slots, 2);
    }

    #[test]
    fn test_duplicate_notification_is_skipped() {
        let mut session = single_sample_session(4);
        session.ingest_notification(&notification(7, [0, 1])).unwrap();
        session.ingest_notification(&notification(7, [0, 1])).unwrap();
        let stats = session.stats();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.anomalies, 1);
    }

    #[test]
    fn test_status_bytes_are_kept_for_nine_slot_notifications() {
        let cfg = SessionConfig::for_profile(DeviceProfile::Spp9Channel).with_samples_per_packet(1);
        let mut session = AcquisitionSession::new(cfg).unwrap();
        session.start();
        let mut data = vec![0x00, 0x01, 0xA0, 0xB0, 0xC0];
        data.extend(vec![0u8; 27]);
        session.ingest_notification(&data).unwrap();
        assert_eq!(session.last_status(), &[0xA0, 0xB0, 0xC0]);
    }

    fn serial_frame(command: u8, frame_number: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![SYNC_BYTE];
        bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        bytes.push(command);
        bytes.push(0);
        bytes.extend_from_slice(&frame_number.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_serial_frames_flow_into_buffer() {
        let cfg = SessionConfig::for_profile(DeviceProfile::Spp9Channel)
            .with_samples_per_packet(1)
            .with_samples_per_flush(2);
        let mut session = AcquisitionSession::new(cfg).unwrap();
        session.start();

        let mut bytes = serial_frame(CMD_DATA, 1, &[0u8; 27]);
        bytes.extend(serial_frame(CMD_DATA, 2, &[0u8; 27]));
        bytes.extend(serial_frame(CMD_BATTERY, 0, &[0x03]));

        let events = session.ingest_serial(&bytes).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SessionEvent::Flush(f) if f.bytes.len() == 54));
        assert_eq!(events[1], SessionEvent::Battery(BatteryLevel::Percent(50)));
        assert_eq!(session.battery(), Some(BatteryLevel::Percent(50)));
    }

    #[test]
    fn test_serial_wrong_payload_is_dropped_not_failed() {
        let cfg = SessionConfig::for_profile(DeviceProfile::Spp9Channel).with_samples_per_packet(1);
        let mut session = AcquisitionSession::new(cfg).unwrap();
        session.start();
        let events = session.ingest_serial(&serial_frame(CMD_DATA, 1, &[0u8; 5])).unwrap();
        assert!(events.is_empty());
        assert_eq!(session.stats().rejected_frames, 1);
    }

    #[test]
    fn test_battery_delivered_while_stopped() {
        let mut session = AcquisitionSession::new(SessionConfig::default()).unwrap();
        let mut bytes = serial_frame(CMD_DATA, 1, &[0u8; 16]);
        bytes.extend(serial_frame(CMD_BATTERY, 0, &[0x06]));
        let events = session.ingest_serial(&bytes).unwrap();
        assert_eq!(events, vec![SessionEvent::Battery(BatteryLevel::Percent(100))]);
    }

    #[test]
    fn test_stop_discards_partial_data() {
        let mut session = single_sample_session(4);
        session.ingest_notification(&notification(1, [0, 1])).unwrap();
        session.stop();
        assert_eq!(session.stats().frames, 1);
        assert!(session.ingest_notification(&notification(2, [0, 1])).is_err());
        session.start();
        assert_eq!(session.stats(), SessionStats::default());
        // Sequencer reseeds: a far-away index is not a loss.
        session.ingest_notification(&notification(900, [0, 1])).unwrap();
        assert_eq!(session.stats().lost_slots, 0);
    }

    #[test]
    fn test_reconfigure_resizes_buffer() {
        let mut session = single_sample_session(4);
        session
            .reconfigure(SessionConfig::default().with_samples_per_flush(10))
            .unwrap();
        assert!(!session.is_streaming());
        assert_eq!(session.config().capacity_bytes(), 40);
    }

    #[test]
    fn test_seconds_at() {
        let session = AcquisitionSession::new(SessionConfig::default()).unwrap();
        assert!((session.seconds_at(500) - 2.0).abs() < 1e-9);
    }
}

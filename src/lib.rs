//! Acquisition core for a two-profile EEG headband, with optional Python bindings.
//!
//! The headband streams either BLE notifications (2 channels, 16-bit words) or framed
//! serial packets (8 channels plus a status slot, 24-bit words). This crate turns those
//! bytes into voltage matrices:
//!
//! 1. [`ByteStreamFramer`] recovers packets from the serial byte stream.
//! 2. [`FrameSequencer`] detects lost packets from the frame index.
//! 3. [`SampleBuffer`] accumulates payloads, filling lost packets with a sentinel, and
//!    emits a [`FlushEvent`] every `samples_per_flush` samples.
//! 4. [`SampleDecoder`] converts a flush into volts (NaN for lost samples).
//!
//! [`AcquisitionSession`] ties steps 1-3 together for one connection; the
//! [`pipeline`] module runs step 4 (and an optional [`AnalysisService`]) on a tokio
//! task fed by a bounded queue. [`firmware`] prepares images for over-the-air update.
//!
//! # Timing
//!
//! The device sends no timestamps. Sample time is reconstructed from the ordinal:
//! `seconds = ordinal / sample_rate_hz`, with lost samples keeping their place as NaN.

pub mod analysis;
#[cfg(feature = "bluez")]
pub mod ble;
pub mod buffer;
pub mod decoder;
mod errors;
pub mod firmware;
pub mod framer;
pub mod logging;
pub mod pipeline;
pub mod profile;
#[cfg(feature = "python")]
mod python;
pub mod sequencer;
pub mod session;
pub mod transport;

pub use analysis::{AnalysisReport, AnalysisService, CalibrationParams};
pub use buffer::{FlushEvent, SampleBuffer};
pub use decoder::{decode, sign_extend, DecodedBlock, DecodedSample, SampleDecoder};
pub use errors::*;
pub use firmware::{FirmwareImage, OadTransfer};
pub use framer::{BatteryLevel, ByteStreamFramer};
pub use pipeline::{flush_channel, DecodeWorker, DecodedOutput, FlushQueue};
pub use profile::{DeviceProfile, SessionConfig};
pub use sequencer::FrameSequencer;
pub use session::{AcquisitionSession, SessionEvent, SessionStats};
pub use transport::{DeviceCommand, ReplayTransport, SerialAcquisition, Transport};

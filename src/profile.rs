//! Device profiles and per-session configuration.
//!
//! The headband ships in two wire profiles that never coexist on one connection:
//!
//! - **BLE, 2 channels**: notifications carry a 2-byte big-endian frame index followed by
//!   interleaved 16-bit sample words (one per channel per sample instant).
//! - **SPP, 9 slots**: the serial stream carries framed packets whose payload is a run of
//!   27-byte groups; slot 0 of each group is a status word, slots 1..9 are 24-bit samples.
//!
//! Everything that sizes buffers or drives the decoder is derived from a [`SessionConfig`].

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Bytes occupied by the big-endian frame index at the start of each notification.
pub const NOTIFICATION_INDEX_BYTES: usize = 2;

/// Default significant bit width of a BLE sample word.
pub const DEFAULT_BLE_BIT_WIDTH: u32 = 12;

/// Default depth of the flush -> decode queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Default number of sample instants decoded per flush (one second at 250 Hz).
const DEFAULT_SAMPLES_PER_FLUSH: usize = 250;

/// Default sampling rate for both profiles, in Hz.
const DEFAULT_SAMPLE_RATE_HZ: f32 = 250.0;

// ============================================================================
// Device Profile
// ============================================================================

/// Wire profile of the connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    /// Notification transport, 2 voltage channels, 2 bytes per word.
    #[default]
    Ble2Channel,
    /// Serial transport, 1 status slot + 8 voltage channels, 3 bytes per word.
    Spp9Channel,
}

impl DeviceProfile {
    /// Channel slots per sample instant, status slot included.
    pub fn slots_per_group(self) -> usize {
        match self {
            DeviceProfile::Ble2Channel => 2,
            DeviceProfile::Spp9Channel => 9,
        }
    }

    /// Bytes per sample word.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            DeviceProfile::Ble2Channel => 2,
            DeviceProfile::Spp9Channel => 3,
        }
    }

    /// Bytes per whole sample instant across all slots.
    pub fn group_bytes(self) -> usize {
        self.slots_per_group() * self.bytes_per_sample()
    }

    /// Whether slot 0 of each group carries a status bit instead of a voltage.
    pub fn has_status_slot(self) -> bool {
        matches!(self, DeviceProfile::Spp9Channel)
    }

    /// Number of voltage channels in the decoded matrix.
    pub fn voltage_channels(self) -> usize {
        if self.has_status_slot() {
            self.slots_per_group() - 1
        } else {
            self.slots_per_group()
        }
    }

    /// Per-notification status bytes following the frame index.
    pub fn notification_status_bytes(self) -> usize {
        match self {
            DeviceProfile::Ble2Channel => 0,
            DeviceProfile::Spp9Channel => 3,
        }
    }

    /// Amplifier gain the firmware runs with out of the box.
    pub fn default_gain(self) -> f32 {
        match self {
            DeviceProfile::Ble2Channel => 1.0,
            DeviceProfile::Spp9Channel => 24.0,
        }
    }

    /// Sample instants carried by one notification or serial data frame.
    pub fn default_samples_per_packet(self) -> usize {
        match self {
            DeviceProfile::Ble2Channel => 4,
            DeviceProfile::Spp9Channel => 10,
        }
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration of one acquisition session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub profile: DeviceProfile,
    /// Sample instants per notification / serial data frame.
    pub samples_per_packet: usize,
    /// Sample instants per decoded block; sets the buffer capacity.
    pub samples_per_flush: usize,
    /// Amplifier gain applied when scaling to volts.
    pub gain: f32,
    /// Significant bits of a BLE sample word (ignored for SPP).
    pub bit_width: u32,
    /// Nominal sampling rate, used to turn ordinals into seconds.
    pub sample_rate_hz: f32,
    /// Capacity of the flush -> decode queue.
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_profile(DeviceProfile::default())
    }
}

impl SessionConfig {
    /// Factory defaults for a profile.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        Self {
            profile,
            samples_per_packet: profile.default_samples_per_packet(),
            samples_per_flush: DEFAULT_SAMPLES_PER_FLUSH,
            gain: profile.default_gain(),
            bit_width: DEFAULT_BLE_BIT_WIDTH,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_samples_per_packet(mut self, n: usize) -> Self {
        self.samples_per_packet = n;
        self
    }

    pub fn with_samples_per_flush(mut self, n: usize) -> Self {
        self.samples_per_flush = n;
        self
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_bit_width(mut self, bits: u32) -> Self {
        self.bit_width = bits;
        self
    }

    pub fn with_sample_rate(mut self, hz: f32) -> Self {
        self.sample_rate_hz = hz;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Payload bytes contributed by one packet (one buffer slot).
    pub fn packet_bytes(&self) -> usize {
        self.samples_per_packet * self.profile.group_bytes()
    }

    /// Buffer capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.samples_per_flush * self.profile.group_bytes()
    }

    /// Expected length of a whole notification frame on the BLE transport.
    pub fn notification_bytes(&self) -> usize {
        NOTIFICATION_INDEX_BYTES + self.profile.notification_status_bytes() + self.packet_bytes()
    }

    /// Reject configurations the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.samples_per_packet == 0 || self.samples_per_flush == 0 {
            return Err(DriverError::InvalidInput(
                "samples_per_packet and samples_per_flush must be non-zero".into(),
            ));
        }
        if self.samples_per_packet > self.samples_per_flush {
            return Err(DriverError::InvalidInput(format!(
                "packet of {} samples does not fit a flush of {}",
                self.samples_per_packet, self.samples_per_flush
            )));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(DriverError::InvalidInput(format!(
                "sample rate must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if !(self.gain.is_finite() && self.gain > 0.0) {
            return Err(DriverError::InvalidInput(format!(
                "gain must be positive, got {}",
                self.gain
            )));
        }
        if !(1..=16).contains(&self.bit_width) {
            return Err(DriverError::InvalidInput(format!(
                "bit width must be within 1..=16, got {}",
                self.bit_width
            )));
        }
        if self.queue_depth == 0 {
            return Err(DriverError::InvalidInput("queue depth must be non-zero".into()));
        }
        Ok(())
    }
}

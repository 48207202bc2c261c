//! Raw sample word decoding.
//!
//! A flushed buffer is a run of sample groups; each group holds one word per channel
//! slot for a single sample instant. The decoder turns the words into volts:
//!
//! - **BLE** words are 16-bit big-endian. The low `bit_width` bits are a two's
//!   complement sample which is left-aligned into the 17-bit ADC range before scaling
//!   by `0.286 µV / gain`. `0xFFFF` marks a known-bad sample.
//! - **SPP** words are 24-bit big-endian two's complement scaled by `0.536 µV / gain`;
//!   `0xFFFFFF` marks a known-bad sample. Slot 0 of each 9-slot group is a status word
//!   whose bit 0 is the electrode status flag.
//!
//! Known-bad samples (including lost-packet filler) decode to NaN.

use serde::Serialize;

use crate::buffer::FlushEvent;
use crate::errors::{DriverError, Result};
use crate::profile::{DeviceProfile, SessionConfig, DEFAULT_BLE_BIT_WIDTH};

/// Volts per LSB of a full-range BLE sample at unity gain.
pub const BLE_VOLTS_PER_LSB: f64 = 0.286e-6;

/// Volts per LSB of an SPP sample at unity gain.
pub const SPP_VOLTS_PER_LSB: f64 = 0.536e-6;

/// Resolution of the BLE front-end ADC that narrower words are aligned to.
const BLE_ADC_BITS: u32 = 17;

const BLE_SENTINEL: u32 = 0x0000_FFFF;
const SPP_SENTINEL: u32 = 0x00FF_FFFF;

/// Sign-extend the low `bits` bits of `value` as a two's complement integer.
///
/// `bits` must be within `1..=32`.
pub fn sign_extend(value: u32, bits: u32) -> i32 {
    debug_assert!((1..=32).contains(&bits));
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

// ============================================================================
// Word formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum WordFormat {
    Ble { bit_width: u32 },
    Spp,
}

impl WordFormat {
    fn bytes(self) -> usize {
        match self {
            WordFormat::Ble { .. } => 2,
            WordFormat::Spp => 3,
        }
    }

    fn raw(self, word: &[u8]) -> u32 {
        word.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
    }

    fn volts(self, word: &[u8], scale: f64) -> f32 {
        let raw = self.raw(word);
        match self {
            WordFormat::Ble { bit_width } => {
                if raw == BLE_SENTINEL {
                    return f32::NAN;
                }
                let mask = (1u32 << bit_width) - 1;
                let value = sign_extend(raw & mask, bit_width) << (BLE_ADC_BITS - bit_width);
                (f64::from(value) * scale) as f32
            }
            WordFormat::Spp => {
                if raw == SPP_SENTINEL {
                    return f32::NAN;
                }
                (f64::from(sign_extend(raw, 24)) * scale) as f32
            }
        }
    }

    fn status(self, word: &[u8]) -> f32 {
        let raw = self.raw(word);
        if raw == SPP_SENTINEL {
            f32::NAN
        } else {
            (raw & 0x01) as f32
        }
    }

    fn volts_per_lsb(self) -> f64 {
        match self {
            WordFormat::Ble { .. } => BLE_VOLTS_PER_LSB,
            WordFormat::Spp => SPP_VOLTS_PER_LSB,
        }
    }
}

/// Decode `buffer` into a matrix with one row per channel slot.
///
/// `bytes_per_sample` selects the word format: 2 for BLE words (default bit width),
/// 3 for SPP words, where row 0 holds the status bits (0/1/NaN). `buffer.len()` must be a
/// multiple of `channel_count * bytes_per_sample`.
pub fn decode(
    buffer: &[u8],
    channel_count: u32,
    bytes_per_sample: u32,
    gain: f32,
) -> Result<Vec<Vec<f32>>> {
    let format = match bytes_per_sample {
        2 => WordFormat::Ble {
            bit_width: DEFAULT_BLE_BIT_WIDTH,
        },
        3 => WordFormat::Spp,
        other => {
            return Err(DriverError::InvalidInput(format!(
                "unsupported sample width: {other} bytes"
            )))
        }
    };
    if channel_count == 0 || !(gain.is_finite() && gain > 0.0) {
        return Err(DriverError::InvalidInput(format!(
            "channel_count={channel_count}, gain={gain}"
        )));
    }
    decode_slots(
        buffer,
        channel_count as usize,
        format,
        format == WordFormat::Spp,
        gain,
    )
}

fn decode_slots(
    buffer: &[u8],
    slots: usize,
    format: WordFormat,
    status_slot: bool,
    gain: f32,
) -> Result<Vec<Vec<f32>>> {
    let group = slots * format.bytes();
    if buffer.len() % group != 0 {
        return Err(DriverError::InvalidLength {
            len: buffer.len(),
            group,
        });
    }
    let samples = buffer.len() / group;
    let scale = format.volts_per_lsb() / f64::from(gain);
    let mut rows = vec![Vec::with_capacity(samples); slots];

    for chunk in buffer.chunks_exact(group) {
        for (slot, word) in chunk.chunks_exact(format.bytes()).enumerate() {
            let value = if status_slot && slot == 0 {
                format.status(word)
            } else {
                format.volts(word, scale)
            };
            rows[slot].push(value);
        }
    }
    Ok(rows)
}

// ============================================================================
// Decoded output
// ============================================================================

/// One sample instant across all voltage channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedSample {
    pub voltages: Vec<f32>,
    /// Electrode status bit (SPP only): 0, 1, or NaN for a lost sample.
    pub status: Option<f32>,
    pub ordinal: u64,
}

/// A decoded flush: a channel-major voltage matrix plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedBlock {
    pub sequence: u64,
    /// Ordinal of the first sample instant, counted from session start.
    pub first_ordinal: u64,
    /// One row per voltage channel, each `sample_count()` long.
    pub channels: Vec<Vec<f32>>,
    pub status: Option<Vec<f32>>,
    pub interpolated_slots: usize,
}

impl DecodedBlock {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn sample_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// The `i`-th sample instant of the block.
    pub fn sample(&self, i: usize) -> Option<DecodedSample> {
        if i >= self.sample_count() {
            return None;
        }
        Some(DecodedSample {
            voltages: self.channels.iter().map(|row| row[i]).collect(),
            status: self.status.as_ref().map(|s| s[i]),
            ordinal: self.first_ordinal + i as u64,
        })
    }

    pub fn samples(&self) -> impl Iterator<Item = DecodedSample> + '_ {
        (0..self.sample_count()).filter_map(move |i| self.sample(i))
    }
}

/// Profile-bound decoder turning flush snapshots into [`DecodedBlock`]s.
#[derive(Debug, Clone)]
pub struct SampleDecoder {
    profile: DeviceProfile,
    format: WordFormat,
    gain: f32,
}

impl SampleDecoder {
    pub fn new(config: &SessionConfig) -> Self {
        let format = match config.profile {
            DeviceProfile::Ble2Channel => WordFormat::Ble {
                bit_width: config.bit_width,
            },
            DeviceProfile::Spp9Channel => WordFormat::Spp,
        };
        Self {
            profile: config.profile,
            format,
            gain: config.gain,
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// Decode a snapshot. The snapshot is only read; ownership stays with the caller.
    pub fn decode(&self, flush: &FlushEvent) -> Result<DecodedBlock> {
        let mut rows = decode_slots(
            &flush.bytes,
            self.profile.slots_per_group(),
            self.format,
            self.profile.has_status_slot(),
            self.gain,
        )?;
        let status = if self.profile.has_status_slot() {
            Some(rows.remove(0))
        } else {
            None
        };
        let samples = rows.first().map_or(0, Vec::len) as u64;
        Ok(DecodedBlock {
            sequence: flush.sequence,
            first_ordinal: flush.sequence * samples,
            channels: rows,
            status,
            interpolated_slots: flush.interpolated_slots,
        })
    }
}

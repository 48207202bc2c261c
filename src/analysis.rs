//! Boundary to the signal-processing service.
//!
//! Calibration, signal-quality scoring and the relaxation index are computed by an
//! external library. This crate only hands it decoded matrices (one row per channel, in
//! volts, NaN for lost samples) and collects what it returns.

use serde::Serialize;

use crate::errors::Result;

/// Per-channel calibration returned by the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationParams {
    pub offsets: Vec<f32>,
    pub scales: Vec<f32>,
}

/// Opaque compute service consuming channel x sample matrices.
///
/// Implementations may keep state across calls (running baselines, filters); the decode
/// worker calls them sequentially in flush order.
pub trait AnalysisService: Send {
    fn calibrate(&mut self, channels: &[Vec<f32>], sample_rate_hz: f32) -> Result<CalibrationParams>;

    /// One quality score per channel, `0.0` (unusable) to `1.0` (clean).
    fn quality(&mut self, channels: &[Vec<f32>], sample_rate_hz: f32) -> Result<Vec<f32>>;

    fn relaxation_index(&mut self, channels: &[Vec<f32>], sample_rate_hz: f32) -> Result<f32>;
}

/// Results attached to a decoded block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    /// Present on the first block analysed after the worker starts.
    pub calibration: Option<CalibrationParams>,
    pub quality: Vec<f32>,
    pub relaxation_index: f32,
}

/// Run the per-block analyses on `channels`, calibrating first when asked to.
pub fn analyse(
    service: &mut dyn AnalysisService,
    channels: &[Vec<f32>],
    sample_rate_hz: f32,
    calibrate: bool,
) -> Result<AnalysisReport> {
    let calibration = if calibrate {
        Some(service.calibrate(channels, sample_rate_hz)?)
    } else {
        None
    };
    Ok(AnalysisReport {
        calibration,
        quality: service.quality(channels, sample_rate_hz)?,
        relaxation_index: service.relaxation_index(channels, sample_rate_hz)?,
    })
}

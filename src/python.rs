//! Python bindings (`biolink._core`).

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::buffer::FlushEvent;
use crate::decoder::{self, DecodedBlock, SampleDecoder};
use crate::errors::DriverError;
use crate::firmware::{FirmwareImage, OAD_BLOCK_SIZE};
use crate::framer::BatteryLevel;
use crate::logging;
use crate::profile::{DeviceProfile, SessionConfig};
use crate::session::{AcquisitionSession, SessionEvent};

fn to_py_err(e: DriverError) -> PyErr {
    match e {
        DriverError::InvalidInput(_) | DriverError::InvalidLength { .. } => {
            PyValueError::new_err(e.to_string())
        }
        DriverError::Disconnected(_) | DriverError::Bluetooth(_) => {
            PyConnectionError::new_err(e.to_string())
        }
        DriverError::Io(_) | DriverError::Serial(_) => PyIOError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

fn parse_profile(name: &str) -> PyResult<DeviceProfile> {
    match name {
        "ble_2channel" | "ble" => Ok(DeviceProfile::Ble2Channel),
        "spp_9channel" | "spp" => Ok(DeviceProfile::Spp9Channel),
        other => Err(PyValueError::new_err(format!(
            "unknown profile {other:?}; expected 'ble_2channel' or 'spp_9channel'"
        ))),
    }
}

// ============================================================================
// Decoded Block
// ============================================================================

/// A decoded flush.
///
/// Attributes:
///     sequence: Flush counter since the session started.
///     first_ordinal: Sample ordinal of the first column.
///     channels: One list of volts per channel; NaN marks lost samples.
///     status: Electrode status row (9-channel profile only).
///     interpolated_slots: Packets in this block that were lost and NaN-filled.
#[pyclass(name = "DecodedBlock", frozen)]
#[derive(Clone)]
struct PyDecodedBlock {
    #[pyo3(get)]
    sequence: u64,
    #[pyo3(get)]
    first_ordinal: u64,
    #[pyo3(get)]
    channels: Vec<Vec<f32>>,
    #[pyo3(get)]
    status: Option<Vec<f32>>,
    #[pyo3(get)]
    interpolated_slots: usize,
}

#[pymethods]
impl PyDecodedBlock {
    fn __repr__(&self) -> String {
        format!(
            "DecodedBlock(sequence={}, channels={}, samples={}, interpolated_slots={})",
            self.sequence,
            self.channels.len(),
            self.__len__(),
            self.interpolated_slots
        )
    }

    /// Number of samples per channel.
    fn __len__(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Convert to dictionary for easy serialization.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("sequence", self.sequence)?;
        dict.set_item("first_ordinal", self.first_ordinal)?;
        dict.set_item("channels", self.channels.clone())?;
        dict.set_item("status", self.status.clone())?;
        dict.set_item("interpolated_slots", self.interpolated_slots)?;
        Ok(dict)
    }
}

impl From<DecodedBlock> for PyDecodedBlock {
    fn from(b: DecodedBlock) -> Self {
        PyDecodedBlock {
            sequence: b.sequence,
            first_ordinal: b.first_ordinal,
            channels: b.channels,
            status: b.status,
            interpolated_slots: b.interpolated_slots,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Acquisition session for one connection.
///
/// Bytes received from the device are pushed in; decoded blocks come out as soon as
/// a flush completes.
///
/// Example:
///     >>> s = Session("ble_2channel", samples_per_flush=250)
///     >>> s.start()
///     >>> for block in s.ingest_notification(payload):
///     ...     print(block.channels)
#[pyclass(name = "Session", unsendable)]
struct PySession {
    inner: AcquisitionSession,
    decoder: SampleDecoder,
}

impl PySession {
    fn decode_all(
        &self,
        flushes: impl IntoIterator<Item = FlushEvent>,
    ) -> PyResult<Vec<PyDecodedBlock>> {
        flushes
            .into_iter()
            .map(|f| {
                self.decoder
                    .decode(&f)
                    .map(PyDecodedBlock::from)
                    .map_err(to_py_err)
            })
            .collect()
    }
}

#[pymethods]
impl PySession {
    #[new]
    #[pyo3(signature = (profile="ble_2channel", samples_per_packet=None, samples_per_flush=250, gain=None, bit_width=12, sample_rate_hz=250.0))]
    fn new(
        profile: &str,
        samples_per_packet: Option<usize>,
        samples_per_flush: usize,
        gain: Option<f32>,
        bit_width: u32,
        sample_rate_hz: f32,
    ) -> PyResult<Self> {
        let profile = parse_profile(profile)?;
        let mut config = SessionConfig::for_profile(profile)
            .with_samples_per_flush(samples_per_flush)
            .with_bit_width(bit_width)
            .with_sample_rate(sample_rate_hz);
        if let Some(n) = samples_per_packet {
            config = config.with_samples_per_packet(n);
        }
        if let Some(g) = gain {
            config = config.with_gain(g);
        }
        let inner = AcquisitionSession::new(config).map_err(to_py_err)?;
        Ok(PySession {
            decoder: inner.decoder(),
            inner,
        })
    }

    fn start(&mut self) {
        self.inner.start();
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    #[getter]
    fn is_streaming(&self) -> bool {
        self.inner.is_streaming()
    }

    /// Ingest one BLE notification; returns the blocks it completed.
    ///
    /// Raises:
    ///     RuntimeError: If the session is stopped.
    ///     ValueError: If the notification has the wrong length.
    fn ingest_notification(&mut self, data: &[u8]) -> PyResult<Vec<PyDecodedBlock>> {
        let flushes = self.inner.ingest_notification(data).map_err(to_py_err)?;
        self.decode_all(flushes)
    }

    /// Ingest raw serial bytes; returns the blocks they completed.
    ///
    /// Battery reports update the `battery_percent` property.
    fn ingest_serial(&mut self, data: &[u8]) -> PyResult<Vec<PyDecodedBlock>> {
        let events = self.inner.ingest_serial(data).map_err(to_py_err)?;
        self.decode_all(events.into_iter().filter_map(|e| match e {
            SessionEvent::Flush(f) => Some(f),
            SessionEvent::Battery(_) => None,
        }))
    }

    /// Last battery report in percent, or None if unknown.
    #[getter]
    fn battery_percent(&self) -> Option<u8> {
        self.inner.battery().and_then(BatteryLevel::percent)
    }

    /// Seconds since session start for a sample ordinal.
    fn seconds_at(&self, ordinal: u64) -> f64 {
        self.inner.seconds_at(ordinal)
    }

    /// Ingestion counters since the last start().
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.inner.stats();
        let dict = PyDict::new(py);
        dict.set_item("frames", stats.frames)?;
        dict.set_item("lost_slots", stats.lost_slots)?;
        dict.set_item("anomalies", stats.anomalies)?;
        dict.set_item("desyncs", stats.desyncs)?;
        dict.set_item("rejected_frames", stats.rejected_frames)?;
        dict.set_item("flushes", stats.flushes)?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        let cfg = self.inner.config();
        format!(
            "Session(profile={:?}, samples_per_flush={}, streaming={})",
            cfg.profile,
            cfg.samples_per_flush,
            self.inner.is_streaming()
        )
    }
}

// ============================================================================
// Firmware
// ============================================================================

/// Firmware image for over-the-air update.
#[pyclass(name = "FirmwareImage")]
struct PyFirmwareImage {
    inner: FirmwareImage,
}

#[pymethods]
impl PyFirmwareImage {
    #[new]
    fn new(data: Vec<u8>) -> PyResult<Self> {
        FirmwareImage::from_bytes(data)
            .map(|inner| PyFirmwareImage { inner })
            .map_err(to_py_err)
    }

    #[staticmethod]
    fn load(path: &str) -> PyResult<Self> {
        FirmwareImage::load(path)
            .map(|inner| PyFirmwareImage { inner })
            .map_err(to_py_err)
    }

    /// Write the length and CRC-32 header fields; returns the CRC.
    fn prepare(&mut self) -> PyResult<u32> {
        self.inner.prepare().map_err(to_py_err)
    }

    fn verify(&self) -> bool {
        self.inner.verify()
    }

    #[getter]
    fn crc32(&self) -> u32 {
        self.inner.crc32()
    }

    #[getter]
    fn version(&self) -> String {
        self.inner.version_string()
    }

    #[getter]
    fn block_count(&self) -> usize {
        self.inner.block_count()
    }

    /// All transfer units (index + payload), 20 bytes each.
    fn blocks<'py>(&self, py: Python<'py>) -> PyResult<Vec<Bound<'py, PyBytes>>> {
        let blocks = self.inner.blocks().map_err(to_py_err)?;
        Ok(blocks
            .iter()
            .map(|b| PyBytes::new(py, &b.to_bytes()))
            .collect())
    }

    fn data<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, self.inner.bytes())
    }

    fn __len__(&self) -> usize {
        self.inner.bytes().len()
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Map a 3-bit battery code to percent (None for unknown codes).
#[pyfunction]
fn battery_percent(code: u8) -> Option<u8> {
    BatteryLevel::from_code(code).percent()
}

/// Decode a raw sample buffer into one row of volts per channel.
#[pyfunction]
#[pyo3(signature = (buffer, channel_count, bytes_per_sample, gain=1.0))]
fn decode(
    buffer: &[u8],
    channel_count: u32,
    bytes_per_sample: u32,
    gain: f32,
) -> PyResult<Vec<Vec<f32>>> {
    decoder::decode(buffer, channel_count, bytes_per_sample, gain).map_err(to_py_err)
}

/// Route Rust logs into Python's `logging`, optionally at an explicit level.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

/// The Python module definition
#[pymodule]
#[pyo3(name = "_core")]
fn core_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySession>()?;
    m.add_class::<PyDecodedBlock>()?;
    m.add_class::<PyFirmwareImage>()?;
    m.add_function(wrap_pyfunction!(battery_percent, m)?)?;
    m.add_function(wrap_pyfunction!(decode, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("OAD_BLOCK_SIZE", OAD_BLOCK_SIZE)?;
    m.add("PROFILES", vec!["ble_2channel", "spp_9channel"])?;
    Ok(())
}

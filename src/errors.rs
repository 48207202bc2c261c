use std::io;
use thiserror::Error;

/// Errors surfaced by the acquisition core.
///
/// Stream-local recovery (framer resynchronisation, lost-frame interpolation) never
/// produces one of these; it is logged and counted instead.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid buffer length {len}: not a multiple of {group} bytes")]
    InvalidLength { len: usize, group: usize },
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    #[error("firmware checksum rejected by device (crc32={crc32:#010X})")]
    ChecksumMismatch { crc32: u32 },
    #[error("device reported OAD failure status {0:#04X}")]
    OadStatus(u8),
    #[error("session not ready: {0}")]
    NotReady(String),
    #[error("analysis service failed: {0}")]
    Analysis(String),
    #[error("decode queue closed")]
    QueueClosed,
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("device not found: {mac}")]
    NotFound { mac: String },
    #[error("characteristic not found: {0}")]
    MissingCharacteristic(String),
    #[error("connection not established: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

//! Serial transport: outbound commands and the inbound byte pump.
//!
//! The serial link is a plain byte stream. [`SerialAcquisition`] owns the transport,
//! the [`AcquisitionSession`] fed from it and the producer side of the decode queue.
//! Each [`SerialAcquisition::pump`] call performs one read, runs the bytes through the
//! session and submits any completed flushes.
//!
//! # Disconnects
//!
//! Read timeouts are not failures; they only mean the device had nothing to say. End of
//! stream or any other I/O error stops the session (discarding partial data) and is
//! reported as [`DriverError::Disconnected`].

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::errors::{DriverError, Result};
use crate::framer::{BatteryLevel, CMD_BATTERY, CMD_DATA, SYNC_BYTE};
use crate::pipeline::FlushQueue;
use crate::profile::SessionConfig;
use crate::session::{AcquisitionSession, SessionEvent, SessionStats};

// ============================================================================
// Constants
// ============================================================================

/// Serial baud rate of the headband's SPP bridge.
pub const BAUD_RATE: u32 = 115_200;

/// Read timeout for the serial port; bounds the latency of a `pump()` call.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after each command so the device can act on it.
const COMMAND_DELAY: Duration = Duration::from_millis(50);

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 1024;

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Fixed 8-byte commands understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    StartStream,
    StopStream,
    BatteryPoll,
}

impl DeviceCommand {
    pub fn bytes(self) -> [u8; 8] {
        let (command, arg) = match self {
            DeviceCommand::StartStream => (CMD_DATA, 1),
            DeviceCommand::StopStream => (CMD_DATA, 0),
            DeviceCommand::BatteryPoll => (CMD_BATTERY, 1),
        };
        [SYNC_BYTE, 0x00, 0x01, command, 0x00, 0x00, 0x00, arg]
    }
}

/// Outcome of one `pump()` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub bytes_read: usize,
    pub flushes: usize,
    /// Battery level reported during this read, if any.
    pub battery: Option<BatteryLevel>,
}

// ============================================================================
// Serial Acquisition
// ============================================================================

/// Drives one serial connection: commands out, framed samples in.
pub struct SerialAcquisition {
    transport: Box<dyn Transport>,
    session: AcquisitionSession,
    queue: FlushQueue,
    command_delay: Duration,
    read_buf: Vec<u8>,
}

impl SerialAcquisition {
    /// Open a serial port (e.g. `/dev/rfcomm0`) and bind it to a new session.
    pub fn connect_serial(path: &str, config: SessionConfig, queue: FlushQueue) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()?;
        info!("serial port opened: path={}, baud={}", path, BAUD_RATE);
        Self::from_transport(port, config, queue)
    }

    /// Bind an already-open transport to a new session.
    pub fn from_transport(
        transport: impl Transport + 'static,
        config: SessionConfig,
        queue: FlushQueue,
    ) -> Result<Self> {
        Ok(Self {
            transport: Box::new(transport),
            session: AcquisitionSession::new(config)?,
            queue,
            command_delay: COMMAND_DELAY,
            read_buf: vec![0u8; READ_CHUNK],
        })
    }

    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    pub fn session(&self) -> &AcquisitionSession {
        &self.session
    }

    pub fn queue(&self) -> &FlushQueue {
        &self.queue
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn battery(&self) -> Option<BatteryLevel> {
        self.session.battery()
    }

    /// Reset the session and ask the device to stream.
    pub fn start(&mut self) -> Result<()> {
        self.session.start();
        self.send(DeviceCommand::StartStream)
    }

    /// Ask the device to stop streaming and discard partial data.
    pub fn stop(&mut self) -> Result<()> {
        let sent = self.send(DeviceCommand::StopStream);
        self.session.stop();
        sent
    }

    /// Request a battery report; it arrives through a later `pump()`.
    pub fn poll_battery(&mut self) -> Result<()> {
        self.send(DeviceCommand::BatteryPoll)
    }

    /// Read once from the transport and ingest whatever arrived.
    pub fn pump(&mut self) -> Result<PumpReport> {
        let n = match self.transport.read(&mut self.read_buf) {
            Ok(0) => return Err(self.disconnect("end of stream".into())),
            Ok(n) => n,
            Err(e) if is_idle(&e) => return Ok(PumpReport::default()),
            Err(e) => return Err(self.disconnect(e.to_string())),
        };

        let mut report = PumpReport {
            bytes_read: n,
            ..PumpReport::default()
        };
        for event in self.session.ingest_serial(&self.read_buf[..n])? {
            match event {
                SessionEvent::Flush(flush) => {
                    report.flushes += 1;
                    self.queue.submit(flush)?;
                }
                SessionEvent::Battery(level) => report.battery = Some(level),
            }
        }
        Ok(report)
    }

    /// Pump until `deadline`, then stop the device.
    pub fn run_until(&mut self, deadline: Instant) -> Result<SessionStats> {
        while Instant::now() < deadline {
            self.pump()?;
        }
        self.stop()?;
        Ok(self.session.stats())
    }

    fn send(&mut self, command: DeviceCommand) -> Result<()> {
        debug!("sending command: {:?}", command);
        let written = self
            .transport
            .write_all(&command.bytes())
            .and_then(|()| self.transport.flush());
        if let Err(e) = written {
            return Err(self.disconnect(e.to_string()));
        }
        if !self.command_delay.is_zero() {
            std::thread::sleep(self.command_delay);
        }
        Ok(())
    }

    fn disconnect(&mut self, reason: String) -> DriverError {
        warn!(
            "serial transport lost: reason={}, frames={}",
            reason,
            self.session.stats().frames
        );
        self.session.stop();
        DriverError::Disconnected(reason)
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

// ============================================================================
// Replay Transport
// ============================================================================

/// In-memory transport serving a captured byte dump and recording what is written.
#[derive(Debug, Clone)]
pub struct ReplayTransport {
    input: Cursor<Vec<u8>>,
    chunk: usize,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl ReplayTransport {
    pub fn new(input: Vec<u8>) -> Self {
        Self {
            input: Cursor::new(input),
            chunk: READ_CHUNK,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Serve at most `chunk` bytes per read, to mimic a slow link.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Shared handle to the bytes written so far.
    pub fn sent_handle(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.sent)
    }
}

impl Read for ReplayTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = buf.len().min(self.chunk);
        self.input.read(&mut buf[..limit])
    }
}

impl Write for ReplayTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "replay sink poisoned"))?;
        sent.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

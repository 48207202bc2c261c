//! BLE notification source via BlueZ.
//!
//! The 2-channel profile streams over a notify characteristic: each notification is one
//! frame (`index`, status bytes, sample words). [`NotificationLink`] connects to the
//! headband, subscribes, and feeds every notification into an [`AcquisitionSession`],
//! submitting completed flushes to the decode queue.
//!
//! Like the rest of the crate's public API this is blocking: a private tokio runtime
//! drives bluer underneath.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bluer::gatt::remote::Characteristic;
use bluer::{Address, Device, Uuid};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Runtime;

use crate::errors::{BluetoothError, DriverError, Result};
use crate::pipeline::FlushQueue;
use crate::session::{AcquisitionSession, SessionStats};
use crate::transport::DeviceCommand;

const CONNECT_TIMEOUT_SECS: u64 = 15;
/// How long to wait for a notification before re-checking the stop flag.
const IDLE_POLL_MS: u64 = 250;

/// Where to find the headband and its characteristics.
#[derive(Debug, Clone)]
pub struct NotificationLinkConfig {
    pub mac: String,
    pub service_uuid: Uuid,
    pub data_uuid: Uuid,
    /// Writable characteristic accepting the 8-byte start/stop commands, if the firmware
    /// exposes one.
    pub command_uuid: Option<Uuid>,
    pub connect_timeout: Duration,
    pub idle_poll: Duration,
}

impl NotificationLinkConfig {
    pub fn new(mac: &str, service_uuid: Uuid, data_uuid: Uuid) -> Self {
        Self {
            mac: mac.to_string(),
            service_uuid,
            data_uuid,
            command_uuid: None,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            idle_poll: Duration::from_millis(IDLE_POLL_MS),
        }
    }

    pub fn with_command_uuid(mut self, uuid: Uuid) -> Self {
        self.command_uuid = Some(uuid);
        self
    }
}

/// Parse a textual UUID (`0000fff0-0000-1000-8000-00805f9b34fb`).
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| DriverError::InvalidInput(format!("invalid uuid {s}: {e}")))
}

fn connection_err(e: bluer::Error) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

/// Blocking notification subscriber.
pub struct NotificationLink {
    config: NotificationLinkConfig,
    rt: Runtime,
}

impl NotificationLink {
    pub fn new(config: NotificationLinkConfig) -> Result<Self> {
        Ok(Self {
            config,
            rt: Runtime::new()?,
        })
    }

    /// Stream until `stop` is set or the link drops.
    ///
    /// The session is started on subscription and stopped on return; the returned
    /// stats are those observed just before stopping.
    pub fn stream(
        &self,
        session: &mut AcquisitionSession,
        queue: &mut FlushQueue,
        stop: &AtomicBool,
    ) -> Result<SessionStats> {
        self.rt.block_on(self.stream_async(session, queue, stop))
    }

    async fn stream_async(
        &self,
        session: &mut AcquisitionSession,
        queue: &mut FlushQueue,
        stop: &AtomicBool,
    ) -> Result<SessionStats> {
        let device = self.connect().await?;
        let data = find_characteristic(&device, self.config.service_uuid, self.config.data_uuid)
            .await?;
        let command = match self.config.command_uuid {
            Some(uuid) => Some(find_characteristic(&device, self.config.service_uuid, uuid).await?),
            None => None,
        };

        let mut notifications = Box::pin(data.notify().await.map_err(connection_err)?);
        session.start();
        if let Some(command) = &command {
            command
                .write(&DeviceCommand::StartStream.bytes())
                .await
                .map_err(connection_err)?;
        }
        info!("subscribed to notifications: mac={}", self.config.mac);

        let result = 'stream: loop {
            if stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            let value = match tokio::time::timeout(self.config.idle_poll, notifications.next()).await
            {
                Err(_) => continue,
                Ok(None) => {
                    break Err(DriverError::Disconnected("notification stream ended".into()))
                }
                Ok(Some(value)) => value,
            };
            match session.ingest_notification(&value) {
                Ok(flushes) => {
                    for flush in flushes {
                        if let Err(e) = queue.submit(flush) {
                            break 'stream Err(e);
                        }
                    }
                }
                Err(DriverError::InvalidInput(reason)) => {
                    warn!("dropping malformed notification: len={}, reason={}", value.len(), reason);
                }
                Err(e) => break Err(e),
            }
        };

        if let Some(command) = &command {
            if let Err(e) = command.write(&DeviceCommand::StopStream.bytes()).await {
                debug!("stop command not delivered: error={}", e);
            }
        }
        session.stop();
        result.map(|()| session.stats())
    }

    async fn connect(&self) -> Result<Device> {
        let bt = bluer::Session::new().await.map_err(connection_err)?;
        let adapter = bt.default_adapter().await.map_err(connection_err)?;
        adapter.set_powered(true).await.map_err(connection_err)?;

        let address: Address = self
            .config
            .mac
            .parse()
            .map_err(|_| DriverError::InvalidInput(format!("invalid mac: {}", self.config.mac)))?;
        let device = adapter.device(address).map_err(connection_err)?;

        if !device.is_connected().await.unwrap_or(false) {
            debug!("connecting: mac={}", address);
            tokio::time::timeout(self.config.connect_timeout, device.connect())
                .await
                .map_err(|_| {
                    DriverError::Bluetooth(BluetoothError::Connection("connect timed out".into()))
                })?
                .map_err(connection_err)?;
        }
        info!("device connected: mac={}", address);
        Ok(device)
    }
}

async fn find_characteristic(
    device: &Device,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
) -> Result<Characteristic> {
    for service in device.services().await.map_err(connection_err)? {
        if service.uuid().await.map_err(connection_err)? != service_uuid {
            continue;
        }
        for characteristic in service.characteristics().await.map_err(connection_err)? {
            if characteristic.uuid().await.map_err(connection_err)? == characteristic_uuid {
                return Ok(characteristic);
            }
        }
    }
    Err(DriverError::Bluetooth(BluetoothError::MissingCharacteristic(
        characteristic_uuid.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid("0000fff0-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(uuid.as_u128(), 0x0000fff0_0000_1000_8000_00805f9b34fb);
        assert!(matches!(parse_uuid("fff0"), Err(DriverError::InvalidInput(_))));
    }

    #[test]
    fn test_config_defaults() {
        let cfg = NotificationLinkConfig::new("00:11:22:33:44:55", Uuid::nil(), Uuid::nil());
        assert!(cfg.command_uuid.is_none());
        assert_eq!(cfg.connect_timeout, Duration::from_secs(CONNECT_TIMEOUT_SECS));
    }
}

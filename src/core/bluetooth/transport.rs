//! Transport capability boundary for the reader connection.
//! The state machine only sees these traits; the bluest-backed adapter
//! below is the production implementation, tests inject their own.

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};

use crate::core::bluetooth::constants::{
    NOTIFICATION_CHANNEL_CAPACITY, UUID_COMMAND_CHARACTERISTIC, UUID_DATA_CHARACTERISTIC,
    UUID_PASSPORT_SERVICE, UUID_STATUS_CHARACTERISTIC,
};
use crate::error::{adapter_error, BleError};

/// A decoded-later notification from the reader, funneled through a
/// single ordered channel so state updates never interleave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// Raw payload of a status-characteristic notification.
    Status(Vec<u8>),
    /// Raw payload of a data-characteristic notification.
    Data(Vec<u8>),
}

/// GATT-level operations needed to establish a reader session.
#[async_trait]
pub trait ReaderTransport: Send + Sync {
    /// Establishes the underlying connection. One attempt, no retry.
    async fn connect(&self) -> Result<(), BleError>;

    /// Discovers the passport service and binds its three
    /// characteristics. Fails with `ServiceNotSupported` when the
    /// service or any characteristic is missing.
    async fn discover(&self) -> Result<Box<dyn ReaderLink>, BleError>;

    /// Tears down the underlying connection.
    async fn disconnect(&self) -> Result<(), BleError>;
}

/// An established link: the bound characteristics of one connection.
/// Dropping the link releases the bindings.
#[async_trait]
pub trait ReaderLink: Send + Sync {
    /// Subscribes to status and data notifications, forwarding both into
    /// one channel. The connection is not usable before this succeeds.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ReaderEvent>, BleError>;

    /// Writes an encoded command to the command characteristic.
    async fn write_command(&self, payload: &[u8]) -> Result<(), BleError>;
}

/// Production transport over a bluest adapter and device handle.
pub struct BluestTransport {
    adapter: Adapter,
    device: Device,
}

impl BluestTransport {
    pub fn new(adapter: Adapter, device: Device) -> Self {
        Self { adapter, device }
    }
}

#[async_trait]
impl ReaderTransport for BluestTransport {
    async fn connect(&self) -> Result<(), BleError> {
        if self.device.is_connected().await {
            info!("device already connected at transport level");
            return Ok(());
        }
        info!("initiating connection to {}", self.device.id());
        self.adapter
            .connect_device(&self.device)
            .await
            .map_err(|e| adapter_error(&e, BleError::ConnectFailed))
    }

    async fn discover(&self) -> Result<Box<dyn ReaderLink>, BleError> {
        info!("discovering services on {}", self.device.id());
        let services = self
            .device
            .services()
            .await
            .map_err(|e| adapter_error(&e, BleError::ConnectFailed))?;

        let service = services
            .iter()
            .find(|s| s.uuid() == UUID_PASSPORT_SERVICE)
            .ok_or_else(|| {
                for service in &services {
                    debug!("available service: {}", service.uuid());
                }
                error!("passport service {} not found", UUID_PASSPORT_SERVICE);
                BleError::ServiceNotSupported
            })?
            .clone();

        let mut command = None;
        let mut status = None;
        let mut data = None;
        let characteristics = service
            .characteristics()
            .await
            .map_err(|e| adapter_error(&e, BleError::ConnectFailed))?;
        for characteristic in characteristics {
            match characteristic.uuid() {
                uuid if uuid == UUID_COMMAND_CHARACTERISTIC => command = Some(characteristic),
                uuid if uuid == UUID_STATUS_CHARACTERISTIC => status = Some(characteristic),
                uuid if uuid == UUID_DATA_CHARACTERISTIC => data = Some(characteristic),
                _ => {}
            }
        }

        match (command, status, data) {
            (Some(command), Some(status), Some(data)) => {
                info!("passport service bound: command/status/data characteristics found");
                Ok(Box::new(BluestLink {
                    command,
                    status,
                    data,
                }))
            }
            (command, status, data) => {
                error!(
                    "required characteristics missing: command={} status={} data={}",
                    command.is_some(),
                    status.is_some(),
                    data.is_some()
                );
                Err(BleError::ServiceNotSupported)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if self.device.is_connected().await {
            info!("disconnecting from {}", self.device.id());
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(|e| adapter_error(&e, BleError::ConnectFailed))?;
        } else {
            info!("device {} not connected", self.device.id());
        }
        Ok(())
    }
}

/// Bound characteristic handles for one active connection.
struct BluestLink {
    command: Characteristic,
    status: Characteristic,
    data: Characteristic,
}

#[async_trait]
impl ReaderLink for BluestLink {
    async fn subscribe(&self) -> Result<mpsc::Receiver<ReaderEvent>, BleError> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let status_ready =
            spawn_forwarder(self.status.clone(), tx.clone(), ReaderEvent::Status, "status");
        let data_ready = spawn_forwarder(self.data.clone(), tx, ReaderEvent::Data, "data");

        // Only report Connected once both subscriptions are live.
        status_ready
            .await
            .map_err(|_| BleError::ConnectFailed("status subscription task died".into()))??;
        data_ready
            .await
            .map_err(|_| BleError::ConnectFailed("data subscription task died".into()))??;

        Ok(rx)
    }

    async fn write_command(&self, payload: &[u8]) -> Result<(), BleError> {
        self.command
            .write(payload)
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))
    }
}

/// Spawns a task that subscribes to one characteristic and forwards its
/// notifications into the shared funnel. The returned oneshot resolves
/// once the subscription is established (or failed).
fn spawn_forwarder(
    characteristic: Characteristic,
    tx: mpsc::Sender<ReaderEvent>,
    wrap: fn(Vec<u8>) -> ReaderEvent,
    label: &'static str,
) -> oneshot::Receiver<Result<(), BleError>> {
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut stream = match characteristic.notify().await {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                stream
            }
            Err(e) => {
                error!("failed to subscribe to {} notifications: {}", label, e);
                let _ = ready_tx.send(Err(BleError::ConnectFailed(e.to_string())));
                return;
            }
        };

        info!("listening for {} notifications", label);
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => {
                    debug!("{} notification: {:02x?}", label, value);
                    if tx.send(wrap(value)).await.is_err() {
                        // State machine dropped the receiver; unsubscribe
                        // by letting the stream fall out of scope.
                        break;
                    }
                }
                Err(e) => {
                    error!("error in {} notification stream: {}", label, e);
                    break;
                }
            }
        }
        info!("{} notification stream ended", label);
    });

    ready_rx
}

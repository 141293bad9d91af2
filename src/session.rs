//! Reader session controller.
//! Orchestrates discovery, connection and protocol commands, and exposes
//! the combined observable state consumed by hosts. Failures surface as a
//! single dismissible latest-error value; none of them are fatal.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::bluetooth::{
    ConnectionState, DiscoveredDevice, DiscoverySource, PassportBleManager, PassportData,
    PassportScanner, PassportStatus, ReaderCommand, SCAN_DURATION_SECS,
};
use crate::error::BleError;

pub struct ReaderSession {
    discovery: Arc<Mutex<Box<dyn DiscoverySource>>>,
    manager: PassportBleManager,
    is_scanning: Arc<watch::Sender<bool>>,
    last_error: Arc<watch::Sender<Option<String>>>,
    timeout_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ReaderSession {
    /// Builds a session over the default Bluetooth adapter.
    pub async fn new() -> Result<Self, BleError> {
        let scanner = PassportScanner::new().await?;
        Ok(Self::with_parts(Box::new(scanner), PassportBleManager::new()))
    }

    /// Builds a session from injected capabilities. Hosts with their own
    /// transport layer (and tests) use this.
    pub fn with_parts(discovery: Box<dyn DiscoverySource>, manager: PassportBleManager) -> Self {
        Self {
            discovery: Arc::new(Mutex::new(discovery)),
            manager,
            is_scanning: Arc::new(watch::Sender::new(false)),
            last_error: Arc::new(watch::Sender::new(None)),
            timeout_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts device discovery. A no-op while a discovery is already
    /// running. The scan auto-stops after the fixed window unless
    /// [`stop_discovery`](Self::stop_discovery) is called first.
    pub async fn start_discovery(&self, name_filter: Option<String>) -> Result<(), BleError> {
        if *self.is_scanning.borrow() {
            warn!("discovery already in progress, ignoring start");
            return Ok(());
        }

        if let Err(e) = self.discovery.lock().await.start(name_filter).await {
            error!("failed to start discovery: {}", e);
            self.record_error(&e);
            return Err(e);
        }

        self.is_scanning.send_replace(true);
        self.last_error.send_replace(None);
        info!("device discovery started");

        let discovery = self.discovery.clone();
        let is_scanning = self.is_scanning.clone();
        let timeout_task = self.timeout_task.clone();
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(SCAN_DURATION_SECS)).await;
            info!("discovery window elapsed, stopping scan");
            Self::stop_inner(&discovery, &is_scanning, &timeout_task).await;
        });
        *self.timeout_task.lock().await = Some(timeout);

        Ok(())
    }

    /// Stops device discovery. Safe to call repeatedly, and safe to race
    /// against the auto-stop timeout; cancellation is not an error.
    pub async fn stop_discovery(&self) {
        Self::stop_inner(&self.discovery, &self.is_scanning, &self.timeout_task).await;
    }

    /// Shared teardown for the manual stop and the timeout task. Taking
    /// the timeout handle first keeps the two paths mutually idempotent.
    async fn stop_inner(
        discovery: &Mutex<Box<dyn DiscoverySource>>,
        is_scanning: &watch::Sender<bool>,
        timeout_task: &Mutex<Option<JoinHandle<()>>>,
    ) {
        let timeout = timeout_task.lock().await.take();

        discovery.lock().await.stop().await;
        is_scanning.send_replace(false);

        // Aborted last: when the timeout task itself runs this teardown,
        // all work is already done by the time it self-aborts.
        if let Some(handle) = timeout {
            handle.abort();
        }
    }

    /// Stops discovery and connects to the selected device.
    pub async fn select_device(&self, address: &str) -> Result<(), BleError> {
        self.stop_discovery().await;
        info!("selecting device {}", address);

        let transport = self.discovery.lock().await.transport_for(address);
        let transport = match transport {
            Some(transport) => transport,
            None => {
                let e = BleError::ConnectFailed(format!(
                    "device {} not found in scan results",
                    address
                ));
                self.record_error(&e);
                return Err(e);
            }
        };

        match self.manager.connect(transport).await {
            Ok(()) => {
                self.last_error.send_replace(None);
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Disconnects from the reader, clearing status and passport record.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.manager.disconnect().await.map_err(|e| {
            self.record_error(&e);
            e
        })
    }

    /// Tells the reader to start polling for a passport chip.
    pub async fn start_passport_scan(&self) -> Result<(), BleError> {
        self.send(ReaderCommand::StartScan, true).await
    }

    /// Tells the reader to stop polling.
    pub async fn stop_passport_scan(&self) -> Result<(), BleError> {
        self.send(ReaderCommand::StopScan, false).await
    }

    /// Requests the last read passport record.
    pub async fn fetch_data(&self) -> Result<(), BleError> {
        self.send(ReaderCommand::GetData, true).await
    }

    /// Resets the reader and clears the local record and status.
    pub async fn reset_reader(&self) -> Result<(), BleError> {
        match self.manager.reset_reader().await {
            Ok(()) => {
                self.last_error.send_replace(None);
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// Dismisses the latest error.
    pub fn clear_error(&self) {
        self.last_error.send_replace(None);
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.connection_state()
    }

    pub fn passport_status(&self) -> watch::Receiver<PassportStatus> {
        self.manager.passport_status()
    }

    pub fn passport_data(&self) -> watch::Receiver<Option<PassportData>> {
        self.manager.passport_data()
    }

    pub async fn devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.discovery.lock().await.snapshots()
    }

    pub fn is_scanning(&self) -> watch::Receiver<bool> {
        self.is_scanning.subscribe()
    }

    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.last_error.subscribe()
    }

    /// Command failures surface as dismissible errors without touching
    /// connection state. `clear_on_success` mirrors which operations the
    /// reader treats as error-clearing.
    async fn send(&self, command: ReaderCommand, clear_on_success: bool) -> Result<(), BleError> {
        match self.manager.send_command(command).await {
            Ok(()) => {
                if clear_on_success {
                    self.last_error.send_replace(None);
                }
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    fn record_error(&self, e: &BleError) {
        self.last_error.send_replace(Some(e.to_string()));
    }
}

//! Device discovery for passport readers.
//! Each scan session accumulates devices in an address-keyed map and
//! re-publishes the full snapshot on every advertisement. Cancelling a
//! scan actively stops the radio scan before the stop call returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use regex::Regex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::transport::{BluestTransport, ReaderTransport};
use crate::core::bluetooth::types::DiscoveredDevice;
use crate::error::{adapter_error, BleError};

/// Discovery capability consumed by the session controller. The bluest
/// scanner below is the production implementation; tests inject a
/// scripted one.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Starts a fresh scan session, clearing previous results. Fails
    /// without emitting a snapshot when the scan cannot start.
    async fn start(&mut self, name_filter: Option<String>) -> Result<(), BleError>;

    /// Stops the scan, actively stopping the radio before returning.
    /// Idempotent.
    async fn stop(&mut self);

    /// Latest-snapshot channel of discovered devices.
    fn snapshots(&self) -> watch::Receiver<Vec<DiscoveredDevice>>;

    /// Builds a connect transport for a previously discovered device.
    fn transport_for(&self, address: &str) -> Option<Arc<dyn ReaderTransport>>;
}

/// Address-keyed accumulator for one scan session. Applies the name
/// filter before insertion and keeps the latest RSSI per address.
pub struct DeviceRegistry {
    name_filter: Option<String>,
    devices: HashMap<String, DiscoveredDevice>,
}

impl DeviceRegistry {
    pub fn new(name_filter: Option<String>) -> Self {
        Self {
            name_filter,
            devices: HashMap::new(),
        }
    }

    /// Records one discovery event. Returns the updated full snapshot,
    /// or `None` when the device does not match the filter.
    pub fn observe(&mut self, device: DiscoveredDevice) -> Option<Vec<DiscoveredDevice>> {
        if let Some(filter) = &self.name_filter {
            if !device.matches_filter(filter) {
                return None;
            }
        }
        self.devices.insert(device.address.clone(), device);
        Some(self.devices.values().cloned().collect())
    }
}

pub struct PassportScanner {
    adapter: Adapter,
    /// Raw platform handles kept for the connect step, keyed like the
    /// snapshot entries.
    devices: Arc<Mutex<HashMap<String, Device>>>,
    snapshot_tx: Arc<watch::Sender<Vec<DiscoveredDevice>>>,
    cancel_token: CancellationToken,
    scan_task: Option<JoinHandle<()>>,
}

impl PassportScanner {
    /// Binds the default Bluetooth adapter and waits for it to become
    /// available.
    pub async fn new() -> Result<Self, BleError> {
        let adapter = Adapter::default()
            .await
            .ok_or(BleError::AdapterUnavailable)?;
        adapter
            .wait_available()
            .await
            .map_err(|e| adapter_error(&e, |_| BleError::AdapterUnavailable))?;
        info!("Bluetooth adapter is available");

        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            snapshot_tx: Arc::new(watch::Sender::new(Vec::new())),
            cancel_token: CancellationToken::new(),
            scan_task: None,
        })
    }

    async fn scan_loop(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        snapshot_tx: Arc<watch::Sender<Vec<DiscoveredDevice>>>,
        mut registry: DeviceRegistry,
        cancel_token: CancellationToken,
        ready_tx: oneshot::Sender<Result<(), BleError>>,
    ) {
        let mut scan_stream = match adapter.scan(&[]).await {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                stream
            }
            Err(e) => {
                error!("failed to start scan: {}", e);
                let _ = ready_tx.send(Err(adapter_error(&e, BleError::ScanFailed)));
                return;
            }
        };
        info!("Bluetooth scan started");

        loop {
            tokio::select! {
                item = scan_stream.next() => {
                    match item {
                        Some(discovered) => {
                            let device = discovered.device;
                            let name = device.name().ok();
                            // RSSI stays None when the platform omits it.
                            let rssi = discovered.rssi;
                            let id = device.id().to_string();
                            let address = extract_mac_address(&id).unwrap_or_else(|| id.clone());
                            debug!("advertisement: name={:?} address={} rssi={:?}", name, address, rssi);

                            let entry = DiscoveredDevice::new(name, address.clone(), rssi);
                            if let Some(snapshot) = registry.observe(entry) {
                                devices.lock().unwrap().insert(address, device);
                                snapshot_tx.send_replace(snapshot);
                            }
                        }
                        None => {
                            info!("scan stream ended");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    info!("scan cancelled");
                    break;
                }
            }
        }

        // Dropping the stream stops the platform scan; do it before the
        // task ends so stop() observes a stopped radio.
        drop(scan_stream);
        info!("Bluetooth scan stopped");
    }
}

#[async_trait]
impl DiscoverySource for PassportScanner {
    async fn start(&mut self, name_filter: Option<String>) -> Result<(), BleError> {
        if self.scan_task.is_some() {
            self.stop().await;
        }

        self.devices.lock().unwrap().clear();
        self.snapshot_tx.send_replace(Vec::new());
        self.cancel_token = CancellationToken::new();

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(Self::scan_loop(
            self.adapter.clone(),
            self.devices.clone(),
            self.snapshot_tx.clone(),
            DeviceRegistry::new(name_filter),
            self.cancel_token.clone(),
            ready_tx,
        ));
        self.scan_task = Some(handle);

        // Surface scan-start failures to the caller instead of letting
        // the session appear active with a dead task.
        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.scan_task = None;
                Err(e)
            }
            Err(_) => {
                self.scan_task = None;
                Err(BleError::ScanFailed("scan task ended unexpectedly".into()))
            }
        }
    }

    async fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.scan_task.take() {
            info!("waiting for scan task to finish");
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("scan task finished with join error: {:?}", e);
                }
            }
        }
    }

    fn snapshots(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.snapshot_tx.subscribe()
    }

    fn transport_for(&self, address: &str) -> Option<Arc<dyn ReaderTransport>> {
        let device = self.devices.lock().unwrap().get(address).cloned()?;
        Some(Arc::new(BluestTransport::new(self.adapter.clone(), device)))
    }
}

/// Pulls a MAC address out of a platform device id. Some platforms embed
/// it in the id string, macOS does not; callers fall back to the id.
fn extract_mac_address(device_id: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

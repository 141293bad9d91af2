//! Notification handling for the reader connection.
//! A single pump task drains the transport's event funnel and applies
//! decoded updates to the shared state channels, so status and data
//! updates are never interleaved.

use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::bluetooth::transport::ReaderEvent;
use crate::core::bluetooth::types::{PassportData, PassportStatus};
use crate::core::passport::parse_passport_record;

#[derive(Clone)]
pub struct NotificationHandler {
    status_tx: Arc<watch::Sender<PassportStatus>>,
    data_tx: Arc<watch::Sender<Option<PassportData>>>,
}

impl NotificationHandler {
    pub fn new(
        status_tx: Arc<watch::Sender<PassportStatus>>,
        data_tx: Arc<watch::Sender<Option<PassportData>>>,
    ) -> Self {
        Self { status_tx, data_tx }
    }

    /// Spawns the pump task for one connection. The task ends when the
    /// transport closes the funnel or the manager aborts it.
    pub fn spawn_pump(&self, mut events: mpsc::Receiver<ReaderEvent>) -> JoinHandle<()> {
        let status_tx = self.status_tx.clone();
        let data_tx = self.data_tx.clone();

        tokio::spawn(async move {
            info!("notification pump started");
            while let Some(event) = events.recv().await {
                match event {
                    ReaderEvent::Status(bytes) => match bytes.first() {
                        Some(&value) => {
                            let status = PassportStatus::from_byte(value);
                            debug!("reader status: {:?}", status);
                            status_tx.send_replace(status);
                        }
                        None => debug!("empty status notification ignored"),
                    },
                    ReaderEvent::Data(bytes) => match parse_passport_record(&bytes) {
                        Ok(record) => {
                            info!("passport record received and decoded");
                            data_tx.send_replace(Some(record));
                        }
                        Err(e) => {
                            // Keep whatever record we had; the reader
                            // status reflects the fault.
                            error!("failed to decode passport record: {}", e);
                            status_tx.send_replace(PassportStatus::Error);
                        }
                    },
                }
            }
            info!("notification pump ended");
        })
    }
}

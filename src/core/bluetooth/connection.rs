//! Connection establishment with bounded retry.
//! One connect() call makes up to `max_retries` transport attempts with a
//! fixed delay between them; there is no automatic reconnect on drop.

use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::transport::{ReaderLink, ReaderTransport};
use crate::error::BleError;

pub struct ConnectionManager {
    max_retries: u32,
    retry_delay: Duration,
}

impl ConnectionManager {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
        }
    }

    /// Connects and binds the passport service, retrying transient
    /// transport failures. `ServiceNotSupported` is not retried: the
    /// device will not grow the service between attempts. Cancelling
    /// the token aborts the in-flight attempt and the retry sleeps.
    pub async fn connect_with_retry(
        &self,
        transport: &dyn ReaderTransport,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ReaderLink>, BleError> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            let outcome = tokio::select! {
                outcome = self.try_connect(transport) => outcome,
                _ = cancel.cancelled() => {
                    info!("connection attempt {} cancelled", attempt);
                    return Err(cancelled());
                }
            };
            match outcome {
                Ok(link) => {
                    info!("connected on attempt {}", attempt);
                    return Ok(link);
                }
                Err(BleError::ServiceNotSupported) => {
                    return Err(BleError::ServiceNotSupported);
                }
                Err(e) => {
                    warn!("connection attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::select! {
                            _ = tokio::time::sleep(self.retry_delay) => {}
                            _ = cancel.cancelled() => {
                                info!("connection retry cancelled");
                                return Err(cancelled());
                            }
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BleError::ConnectFailed(format!(
                "failed to connect after {} attempts",
                self.max_retries
            ))
        }))
    }

    async fn try_connect(
        &self,
        transport: &dyn ReaderTransport,
    ) -> Result<Box<dyn ReaderLink>, BleError> {
        transport.connect().await?;
        info!("transport connected, discovering passport service");
        transport.discover().await
    }
}

/// Error reported for a connect attempt interrupted by a disconnect.
pub(crate) fn cancelled() -> BleError {
    BleError::ConnectFailed("cancelled by disconnect".into())
}

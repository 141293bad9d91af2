//! Connection state machine for the passport reader.
//! Owns the connection lifecycle, the characteristic bindings of the
//! active link, and the observable state channels. All transitions go
//! through this type; collaborators only read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{error, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::ReaderCommand;
use crate::core::bluetooth::connection::{self, ConnectionManager};
use crate::core::bluetooth::constants::{CONNECT_RETRY_DELAY_MS, MAX_CONNECT_RETRIES};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::transport::{ReaderLink, ReaderTransport};
use crate::core::bluetooth::types::{ConnectionState, PassportData, PassportStatus};
use crate::error::BleError;

/// Live resources of one connected session: the transport for teardown,
/// the bound link, and an abort handle for the notification pump. The
/// generation ties the pump watchdog to this session and no other.
struct ActiveSession {
    transport: Arc<dyn ReaderTransport>,
    link: Box<dyn ReaderLink>,
    pump: AbortHandle,
    generation: u64,
}

pub struct PassportBleManager {
    connection_tx: Arc<watch::Sender<ConnectionState>>,
    status_tx: Arc<watch::Sender<PassportStatus>>,
    data_tx: Arc<watch::Sender<Option<PassportData>>>,
    connection_manager: ConnectionManager,
    notification_handler: NotificationHandler,
    /// Locked across state transitions so only one runs at a time.
    session: Arc<Mutex<Option<ActiveSession>>>,
    /// Present while a connect attempt is in flight; disconnect() takes
    /// and cancels it to interrupt the attempt.
    connect_cancel: StdMutex<Option<CancellationToken>>,
    generation: AtomicU64,
}

impl PassportBleManager {
    pub fn new() -> Self {
        let connection_tx = Arc::new(watch::Sender::new(ConnectionState::Disconnected));
        let status_tx = Arc::new(watch::Sender::new(PassportStatus::Idle));
        let data_tx = Arc::new(watch::Sender::new(None));
        let notification_handler = NotificationHandler::new(status_tx.clone(), data_tx.clone());

        Self {
            connection_tx,
            status_tx,
            data_tx,
            connection_manager: ConnectionManager::new(MAX_CONNECT_RETRIES, CONNECT_RETRY_DELAY_MS),
            notification_handler,
            session: Arc::new(Mutex::new(None)),
            connect_cancel: StdMutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Connects through the given transport. Only valid from
    /// Disconnected; the state moves to Connecting before any I/O and
    /// rolls back to Disconnected on failure. A disconnect() issued
    /// while Connecting cancels the attempt.
    pub async fn connect(&self, transport: Arc<dyn ReaderTransport>) -> Result<(), BleError> {
        let cancel = {
            let session = self.session.lock().await;

            let current = *self.connection_tx.borrow();
            if current != ConnectionState::Disconnected || session.is_some() {
                warn!("connect() rejected in state {}", current.name());
                return Err(BleError::InvalidState {
                    expected: ConnectionState::Disconnected.name(),
                    actual: current.name(),
                });
            }

            self.connection_tx.send_replace(ConnectionState::Connecting);
            let token = CancellationToken::new();
            *self.connect_cancel.lock().unwrap() = Some(token.clone());
            token
            // Session lock released here so disconnect() can interrupt
            // the attempt instead of queueing behind it.
        };

        let attempt = async {
            let link = self
                .connection_manager
                .connect_with_retry(transport.as_ref(), &cancel)
                .await?;
            let events = link.subscribe().await?;
            Ok::<_, BleError>((link, events))
        }
        .await;

        let mut session = self.session.lock().await;
        self.connect_cancel.lock().unwrap().take();

        let (link, events) = match attempt {
            Ok(parts) if !cancel.is_cancelled() => parts,
            Ok((link, _events)) => {
                info!("connect raced a disconnect, tearing back down");
                drop(link);
                let _ = transport.disconnect().await;
                self.connection_tx
                    .send_replace(ConnectionState::Disconnected);
                return Err(connection::cancelled());
            }
            Err(e) => {
                error!("connection failed: {}", e);
                let _ = transport.disconnect().await;
                self.connection_tx
                    .send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let pump = self.notification_handler.spawn_pump(events);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        *session = Some(ActiveSession {
            transport,
            link,
            pump: pump.abort_handle(),
            generation,
        });
        self.watch_pump(pump, generation);
        self.connection_tx.send_replace(ConnectionState::Connected);
        info!("reader connected and subscribed");
        Ok(())
    }

    /// Watchdog for one session's pump. The pump only ends on its own
    /// when the transport closes the event funnel, which means the
    /// device dropped the link: tear the session down and clear the
    /// published state as a requested disconnect would. A deliberate
    /// disconnect aborts the pump instead, which skips the cleanup here.
    fn watch_pump(&self, pump: JoinHandle<()>, generation: u64) {
        let session = Arc::clone(&self.session);
        let connection_tx = self.connection_tx.clone();
        let status_tx = self.status_tx.clone();
        let data_tx = self.data_tx.clone();

        tokio::spawn(async move {
            if pump.await.is_err() {
                return;
            }

            let mut guard = session.lock().await;
            let stale = match guard.as_ref() {
                Some(active) => active.generation != generation,
                None => true,
            };
            if stale {
                // A disconnect (or a newer session) got here first.
                return;
            }
            let Some(active) = guard.take() else { return };

            warn!("reader link dropped, clearing session");
            connection_tx.send_replace(ConnectionState::Disconnecting);
            drop(active.link);
            if let Err(e) = active.transport.disconnect().await {
                warn!("transport teardown after link drop failed: {}", e);
            }
            connection_tx.send_replace(ConnectionState::Disconnected);
            status_tx.send_replace(PassportStatus::Idle);
            data_tx.send_replace(None);
        });
    }

    /// Tears down the active connection. The characteristic bindings are
    /// dropped, the reader status resets to Idle and any passport record
    /// is cleared, regardless of whether the transport teardown failed.
    /// While Connecting, this cancels the in-flight attempt instead.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        let mut session = self.session.lock().await;

        if let Some(active) = session.take() {
            // Stop the pump before leaving Connected so no late
            // notification can publish a record once teardown has begun.
            active.pump.abort();
            self.connection_tx
                .send_replace(ConnectionState::Disconnecting);

            // Dropping the link releases the bound characteristics.
            drop(active.link);
            let teardown = active.transport.disconnect().await;
            if let Err(ref e) = teardown {
                error!("transport teardown failed: {}", e);
            }

            self.connection_tx
                .send_replace(ConnectionState::Disconnected);
            self.status_tx.send_replace(PassportStatus::Idle);
            self.data_tx.send_replace(None);
            info!("reader disconnected, state cleared");
            return teardown;
        }

        // No live session. If a connect is still in flight, cancel it;
        // its rollback reports Disconnected once the attempt unwinds.
        if let Some(token) = self.connect_cancel.lock().unwrap().take() {
            info!("disconnect() cancelling in-flight connect");
            self.connection_tx
                .send_replace(ConnectionState::Disconnecting);
            token.cancel();
            return Ok(());
        }

        info!("disconnect() ignored, already disconnected");
        Ok(())
    }

    /// Encodes and writes a command. Fails with `NotConnected` when no
    /// characteristic bindings exist; never attempts I/O in that case.
    pub async fn send_command(&self, command: ReaderCommand) -> Result<(), BleError> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(active) => {
                info!("sending reader command {:?}", command);
                active.link.write_command(&[command.to_byte()]).await
            }
            None => {
                warn!("command {:?} rejected: not connected", command);
                Err(BleError::NotConnected)
            }
        }
    }

    /// Sends Reset and locally returns the reader view to its initial
    /// state, mirroring the firmware's own reset behavior.
    pub async fn reset_reader(&self) -> Result<(), BleError> {
        self.send_command(ReaderCommand::Reset).await?;
        self.data_tx.send_replace(None);
        self.status_tx.send_replace(PassportStatus::Idle);
        Ok(())
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    pub fn passport_status(&self) -> watch::Receiver<PassportStatus> {
        self.status_tx.subscribe()
    }

    pub fn passport_data(&self) -> watch::Receiver<Option<PassportData>> {
        self.data_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.connection_tx.borrow()
    }
}

impl Default for PassportBleManager {
    fn default() -> Self {
        Self::new()
    }
}

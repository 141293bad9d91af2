//! State machine and session tests over injected mock capabilities.
//! No radio involved: the mocks script transport behavior and the tests
//! assert the observable state the bridge publishes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use passport_ble_bridge::core::bluetooth::{
    ConnectionState, DiscoveredDevice, DiscoverySource, PassportBleManager, PassportStatus,
    ReaderEvent, ReaderLink, ReaderTransport,
};
use passport_ble_bridge::error::BleError;
use passport_ble_bridge::session::ReaderSession;

// ---------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------

struct MockState {
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    /// Remaining connect attempts to fail before succeeding.
    fail_connects: AtomicUsize,
    /// When set, connect attempts block forever instead of resolving.
    hang_connects: AtomicBool,
    missing_service: bool,
    writes: StdMutex<Vec<Vec<u8>>>,
    events: StdMutex<Option<mpsc::Receiver<ReaderEvent>>>,
}

struct MockTransport {
    state: Arc<MockState>,
}

struct MockLink {
    state: Arc<MockState>,
}

fn mock_transport(
    missing_service: bool,
    fail_connects: usize,
) -> (Arc<MockTransport>, mpsc::Sender<ReaderEvent>, Arc<MockState>) {
    let (tx, rx) = mpsc::channel(16);
    let state = Arc::new(MockState {
        connect_calls: AtomicUsize::new(0),
        disconnect_calls: AtomicUsize::new(0),
        fail_connects: AtomicUsize::new(fail_connects),
        hang_connects: AtomicBool::new(false),
        missing_service,
        writes: StdMutex::new(Vec::new()),
        events: StdMutex::new(Some(rx)),
    });
    (
        Arc::new(MockTransport {
            state: state.clone(),
        }),
        tx,
        state,
    )
}

#[async_trait]
impl ReaderTransport for MockTransport {
    async fn connect(&self) -> Result<(), BleError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.hang_connects.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let remaining = self.state.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BleError::ConnectFailed("scripted failure".into()));
        }
        Ok(())
    }

    async fn discover(&self) -> Result<Box<dyn ReaderLink>, BleError> {
        if self.state.missing_service {
            return Err(BleError::ServiceNotSupported);
        }
        Ok(Box::new(MockLink {
            state: self.state.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.state.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ReaderLink for MockLink {
    async fn subscribe(&self) -> Result<mpsc::Receiver<ReaderEvent>, BleError> {
        self.state
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BleError::ConnectFailed("already subscribed".into()))
    }

    async fn write_command(&self, payload: &[u8]) -> Result<(), BleError> {
        self.state.writes.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Mock discovery
// ---------------------------------------------------------------------

struct MockDiscovery {
    start_calls: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
    fail_start: bool,
    snapshot_tx: watch::Sender<Vec<DiscoveredDevice>>,
    transport: Option<Arc<MockTransport>>,
}

impl MockDiscovery {
    fn new(transport: Option<Arc<MockTransport>>) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let start_calls = Arc::new(AtomicUsize::new(0));
        let stop_calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                start_calls: start_calls.clone(),
                stop_calls: stop_calls.clone(),
                fail_start: false,
                snapshot_tx: watch::Sender::new(Vec::new()),
                transport,
            },
            start_calls,
            stop_calls,
        )
    }
}

#[async_trait]
impl DiscoverySource for MockDiscovery {
    async fn start(&mut self, _name_filter: Option<String>) -> Result<(), BleError> {
        if self.fail_start {
            return Err(BleError::AdapterUnavailable);
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshots(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.snapshot_tx.subscribe()
    }

    fn transport_for(&self, address: &str) -> Option<Arc<dyn ReaderTransport>> {
        if address == "AA:BB:CC:DD:EE:FF" {
            self.transport
                .clone()
                .map(|t| t as Arc<dyn ReaderTransport>)
        } else {
            None
        }
    }
}

async fn await_change<T: Clone>(rx: &mut watch::Receiver<T>) -> T {
    timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("timed out waiting for state change")
        .expect("state channel closed");
    rx.borrow().clone()
}

async fn await_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    timeout(Duration::from_secs(1), rx.wait_for(|state| *state == target))
        .await
        .expect("timed out waiting for connection state")
        .expect("state channel closed");
}

// ---------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------

#[tokio::test]
async fn connect_while_connected_is_rejected() {
    let manager = PassportBleManager::new();
    let (transport, _events, _state) = mock_transport(false, 0);

    manager.connect(transport).await.unwrap();
    assert_eq!(manager.current_state(), ConnectionState::Connected);

    let (second, _events2, state2) = mock_transport(false, 0);
    let err = manager.connect(second).await.unwrap_err();
    assert!(matches!(err, BleError::InvalidState { .. }));
    assert_eq!(manager.current_state(), ConnectionState::Connected);
    // The rejected attempt never touched the transport.
    assert_eq!(state2.connect_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disconnect_clears_record_and_resets_status() {
    let manager = PassportBleManager::new();
    let (transport, events, state) = mock_transport(false, 0);
    let mut data_rx = manager.passport_data();
    let mut status_rx = manager.passport_status();

    manager.connect(transport).await.unwrap();

    events.send(ReaderEvent::Status(vec![5])).await.unwrap();
    events
        .send(ReaderEvent::Data(
            b"P1|DOE|JANE|UTO|19900101|F|20300101|04".to_vec(),
        ))
        .await
        .unwrap();
    assert_eq!(await_change(&mut status_rx).await, PassportStatus::DataRead);
    assert!(await_change(&mut data_rx).await.is_some());

    manager.disconnect().await.unwrap();

    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    assert!(data_rx.borrow().is_none());
    assert_eq!(*status_rx.borrow(), PassportStatus::Idle);
    assert_eq!(state.disconnect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn send_command_while_disconnected_fails_with_not_connected() {
    let manager = PassportBleManager::new();
    let err = manager
        .send_command(passport_ble_bridge::ReaderCommand::StartScan)
        .await
        .unwrap_err();
    assert!(matches!(err, BleError::NotConnected));
    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn missing_service_fails_connect_without_retry() {
    let manager = PassportBleManager::new();
    let (transport, _events, state) = mock_transport(true, 0);

    let err = manager.connect(transport).await.unwrap_err();
    assert!(matches!(err, BleError::ServiceNotSupported));
    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    // A missing service is permanent; only one attempt is made.
    assert_eq!(state.connect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_connect_failures_are_retried() {
    let manager = PassportBleManager::new();
    let (transport, _events, state) = mock_transport(false, 2);

    manager.connect(transport).await.unwrap();
    assert_eq!(manager.current_state(), ConnectionState::Connected);
    assert_eq!(state.connect_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_three_attempts() {
    let manager = PassportBleManager::new();
    let (transport, _events, state) = mock_transport(false, 10);

    let err = manager.connect(transport).await.unwrap_err();
    assert!(matches!(err, BleError::ConnectFailed(_)));
    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    assert_eq!(state.connect_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn dropped_link_resets_state_and_clears_record() {
    let manager = PassportBleManager::new();
    let (transport, events, state) = mock_transport(false, 0);
    let mut conn_rx = manager.connection_state();
    let mut data_rx = manager.passport_data();
    let status_rx = manager.passport_status();

    manager.connect(transport).await.unwrap();
    events
        .send(ReaderEvent::Data(
            b"P1|DOE|JANE|UTO|19900101|F|20300101|04".to_vec(),
        ))
        .await
        .unwrap();
    assert!(await_change(&mut data_rx).await.is_some());

    // The device drops the link: the transport's notification streams end
    // and the event funnel closes.
    drop(events);

    await_state(&mut conn_rx, ConnectionState::Disconnected).await;
    assert!(data_rx.borrow().is_none());
    assert_eq!(*status_rx.borrow(), PassportStatus::Idle);
    // The transport was torn down once, by the drop handling.
    assert_eq!(state.disconnect_calls.load(Ordering::SeqCst), 1);

    // A later explicit disconnect is a plain no-op.
    manager.disconnect().await.unwrap();
    assert_eq!(state.disconnect_calls.load(Ordering::SeqCst), 1);

    // The slot is free: a fresh connect succeeds.
    let (second, _events2, _state2) = mock_transport(false, 0);
    manager.connect(second).await.unwrap();
    assert_eq!(manager.current_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_while_connecting_cancels_the_attempt() {
    let manager = Arc::new(PassportBleManager::new());
    let (transport, _events, state) = mock_transport(false, 0);
    state.hang_connects.store(true, Ordering::SeqCst);
    let mut conn_rx = manager.connection_state();

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(transport).await })
    };
    await_state(&mut conn_rx, ConnectionState::Connecting).await;

    // Interrupts the blocked attempt instead of queueing behind it.
    manager.disconnect().await.unwrap();
    await_state(&mut conn_rx, ConnectionState::Disconnected).await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, BleError::ConnectFailed(_)));
    // The cancelled attempt still released the transport.
    assert_eq!(state.disconnect_calls.load(Ordering::SeqCst), 1);

    let (second, _events2, _state2) = mock_transport(false, 0);
    manager.connect(second).await.unwrap();
    assert_eq!(manager.current_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn commands_are_written_with_firmware_byte_values() {
    let manager = PassportBleManager::new();
    let (transport, _events, state) = mock_transport(false, 0);
    manager.connect(transport).await.unwrap();

    manager
        .send_command(passport_ble_bridge::ReaderCommand::StartScan)
        .await
        .unwrap();
    manager
        .send_command(passport_ble_bridge::ReaderCommand::GetData)
        .await
        .unwrap();
    manager.reset_reader().await.unwrap();

    let writes = state.writes.lock().unwrap().clone();
    assert_eq!(writes, vec![vec![0x01], vec![0x03], vec![0x04]]);
}

// ---------------------------------------------------------------------
// Session controller
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn discovery_auto_stops_after_scan_window() {
    let (discovery, _starts, stops) = MockDiscovery::new(None);
    let session = ReaderSession::with_parts(Box::new(discovery), PassportBleManager::new());

    session.start_discovery(Some("Passport".into())).await.unwrap();
    assert!(*session.is_scanning().borrow());

    // Past the 10 s window; the paused clock auto-advances through the
    // timeout task's sleep.
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert!(!*session.is_scanning().borrow());
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_stop_racing_timeout_fires_teardown_once() {
    let (discovery, _starts, stops) = MockDiscovery::new(None);
    let session = ReaderSession::with_parts(Box::new(discovery), PassportBleManager::new());

    session.start_discovery(None).await.unwrap();
    session.stop_discovery().await;
    assert!(!*session.is_scanning().borrow());

    // The aborted timeout task must not stop again later.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    // Stopping again stays idempotent (scanner stop itself is, too).
    session.stop_discovery().await;
    assert!(!*session.is_scanning().borrow());
}

#[tokio::test(start_paused = true)]
async fn starting_discovery_while_scanning_is_a_noop() {
    let (discovery, starts, _stops) = MockDiscovery::new(None);
    let session = ReaderSession::with_parts(Box::new(discovery), PassportBleManager::new());

    session.start_discovery(None).await.unwrap();
    session.start_discovery(None).await.unwrap();

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert!(*session.is_scanning().borrow());
}

#[tokio::test]
async fn passport_command_while_disconnected_surfaces_dismissible_error() {
    let (discovery, _starts, _stops) = MockDiscovery::new(None);
    let session = ReaderSession::with_parts(Box::new(discovery), PassportBleManager::new());

    let err = session.start_passport_scan().await.unwrap_err();
    assert!(matches!(err, BleError::NotConnected));

    // Surfaced for display, connection state untouched.
    let message = session.last_error().borrow().clone().expect("error recorded");
    assert!(message.contains("not connected"));
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Disconnected);

    session.clear_error();
    assert!(session.last_error().borrow().is_none());
}

#[tokio::test]
async fn select_device_connects_and_commands_flow() {
    let (transport, events, state) = mock_transport(false, 0);
    let (discovery, _starts, stops) = MockDiscovery::new(Some(transport));
    let session = ReaderSession::with_parts(Box::new(discovery), PassportBleManager::new());
    let mut status_rx = session.passport_status();

    session.start_discovery(None).await.unwrap();
    session.select_device("AA:BB:CC:DD:EE:FF").await.unwrap();

    // Selecting a device stops discovery before connecting.
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(!*session.is_scanning().borrow());
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);

    session.start_passport_scan().await.unwrap();
    assert_eq!(state.writes.lock().unwrap().clone(), vec![vec![0x01]]);

    events.send(ReaderEvent::Status(vec![1])).await.unwrap();
    assert_eq!(await_change(&mut status_rx).await, PassportStatus::Scanning);
}

#[tokio::test]
async fn select_device_with_unknown_address_records_error() {
    let (discovery, _starts, _stops) = MockDiscovery::new(None);
    let session = ReaderSession::with_parts(Box::new(discovery), PassportBleManager::new());

    let err = session.select_device("00:00:00:00:00:00").await.unwrap_err();
    assert!(matches!(err, BleError::ConnectFailed(_)));
    assert!(session.last_error().borrow().is_some());
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_connect_rolls_back_and_session_stays_usable() {
    let (transport, _events, _state) = mock_transport(true, 0);
    let (discovery, _starts, _stops) = MockDiscovery::new(Some(transport));
    let session = ReaderSession::with_parts(Box::new(discovery), PassportBleManager::new());

    session.start_discovery(None).await.unwrap();
    let err = session.select_device("AA:BB:CC:DD:EE:FF").await.unwrap_err();
    assert!(matches!(err, BleError::ServiceNotSupported));
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Disconnected);
    assert!(session.last_error().borrow().is_some());

    // Still usable after the failure.
    session.clear_error();
    session.start_discovery(None).await.unwrap();
    assert!(*session.is_scanning().borrow());
}

#[tokio::test]
async fn failed_discovery_start_surfaces_error_without_scanning() {
    let (mut discovery, _starts, _stops) = MockDiscovery::new(None);
    discovery.fail_start = true;
    let session = ReaderSession::with_parts(Box::new(discovery), PassportBleManager::new());

    let err = session.start_discovery(None).await.unwrap_err();
    assert!(matches!(err, BleError::AdapterUnavailable));
    assert!(!*session.is_scanning().borrow());
    assert!(session.last_error().borrow().is_some());
}

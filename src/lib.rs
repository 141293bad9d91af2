//! Passport reader bridge library.
//! Maintains a connection to a BLE passport reader device, drives its
//! command/status protocol, and reconstructs passport records from the
//! notification stream. Hosts observe state through latest-value
//! channels and issue operations through [`ReaderSession`].

// Module declarations
pub mod core;
pub mod error;
pub mod logging;
pub mod session;

pub use crate::core::bluetooth::{
    ConnectionState, DiscoveredDevice, DiscoverySource, PassportBleManager, PassportData,
    PassportStatus, ReaderCommand, ReaderEvent, ReaderLink, ReaderTransport,
};
pub use error::{BleError, DecodeError};
pub use session::ReaderSession;

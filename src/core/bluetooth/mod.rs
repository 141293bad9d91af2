//! Bluetooth functionality for the passport reader bridge.
//! This module handles all Bluetooth operations including scanning,
//! connecting, and receiving notifications from the reader device.

mod commands;
mod connection;
mod constants;
mod manager;
mod notification;
mod scanner;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use commands::ReaderCommand;
pub use connection::ConnectionManager;
pub use constants::*; // Re-export all constants
pub use manager::PassportBleManager;
pub use notification::NotificationHandler;
pub use scanner::{DeviceRegistry, DiscoverySource, PassportScanner};
pub use transport::{BluestTransport, ReaderEvent, ReaderLink, ReaderTransport};
pub use types::{ConnectionState, DiscoveredDevice, PassportData, PassportStatus};

//! Core functionality for the passport reader bridge.
//! This module contains the wire protocol and the Bluetooth stack that
//! drives the reader device.

pub mod bluetooth;
pub mod passport;

// Re-export commonly used types
pub use bluetooth::PassportBleManager;
pub use passport::parse_passport_record;

//! Shared data structures for the Bluetooth module.

use serde::Serialize;

/// Lifecycle state of the connection to a reader device.
///
/// Only the manager advances this; everything else observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Static name used in logs and `InvalidState` errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
        }
    }
}

/// Reader-side state as reported over the status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PassportStatus {
    Idle,
    Scanning,
    NoCard,
    CardDetected,
    Reading,
    DataRead,
    Error,
}

impl PassportStatus {
    /// Decodes a firmware status byte. Total: unrecognized values degrade
    /// to `Error` instead of failing.
    pub fn from_byte(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Scanning,
            2 => Self::NoCard,
            3 => Self::CardDetected,
            4 => Self::Reading,
            5 => Self::DataRead,
            _ => Self::Error,
        }
    }
}

/// A passport record reconstructed from a data notification.
///
/// Equality and hashing are structural, including the uid bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PassportData {
    pub document_number: String,
    pub surname: String,
    pub given_names: String,
    pub nationality: String,
    /// 8-digit `YYYYMMDD` string as sent by the firmware.
    pub date_of_birth: String,
    pub sex: String,
    /// 8-digit `YYYYMMDD` string as sent by the firmware.
    pub expiry_date: String,
    /// Raw bytes of the uid field's text. The firmware displays this as
    /// hex but transmits it as text; kept verbatim.
    pub uid: Vec<u8>,
    pub photo_available: bool,
}

impl PassportData {
    /// Uppercase hex rendering of the chip uid, as shown to operators.
    pub fn uid_hex(&self) -> String {
        self.uid.iter().map(|b| format!("{:02X}", b)).collect()
    }

    /// Formats an 8-digit `YYYYMMDD` date as `YYYY-MM-DD`. Anything that
    /// is not 8 characters is returned unchanged.
    pub fn format_date(raw: &str) -> String {
        if raw.len() == 8 {
            format!("{}-{}-{}", &raw[0..4], &raw[4..6], &raw[6..8])
        } else {
            raw.to_string()
        }
    }
}

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// The advertised name, if any.
    pub name: Option<String>,
    /// The address (MAC on most platforms); unique key within a scan.
    pub address: String,
    /// Signal strength in dBm, when the platform reports one.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    pub fn new(name: Option<String>, address: String, rssi: Option<i16>) -> Self {
        Self {
            name,
            address,
            rssi,
        }
    }

    /// Case-insensitive substring match against a name filter.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.name
            .as_ref()
            .map(|name| name.to_lowercase().contains(&filter.to_lowercase()))
            .unwrap_or(false)
    }
}

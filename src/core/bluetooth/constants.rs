//! Constants used throughout the bridge.
//! UUIDs and timing values match the reader firmware's passport service
//! definition; changing any of them breaks interoperability.

use uuid::Uuid;

/// Substring used to pre-filter discovered devices by advertised name.
pub const READER_NAME_FILTER: &str = "Passport";

/// The UUID of the passport reader service.
pub const UUID_PASSPORT_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Status characteristic (Notify, device -> host).
pub const UUID_STATUS_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Data characteristic (Notify, device -> host).
pub const UUID_DATA_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Command characteristic (Write, host -> device).
pub const UUID_COMMAND_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400004_b5a3_f393_e0a9_e50e24dcca9e);

/// Maximum number of connection attempts per connect() call.
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Delay between connection retries in milliseconds.
pub const CONNECT_RETRY_DELAY_MS: u64 = 100;

/// Device discovery auto-stops after this window.
pub const SCAN_DURATION_SECS: u64 = 10;

/// Capacity of the notification funnel between the transport and the
/// state machine. Status and data events share one ordered channel.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 32;

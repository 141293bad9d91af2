//! Error types for the passport reader bridge.
//! Transport failures roll the connection back to Disconnected and are
//! surfaced as a single dismissible error; decode failures on data
//! notifications only move the reader status to Error.

use thiserror::Error;

/// Errors produced by discovery, connection and command operations.
#[derive(Debug, Error)]
pub enum BleError {
    /// No Bluetooth adapter present, or the adapter never became available.
    #[error("Bluetooth adapter is not available")]
    AdapterUnavailable,

    /// The platform denied Bluetooth access.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// Device scan could not be started or aborted unexpectedly.
    #[error("device scan failed: {0}")]
    ScanFailed(String),

    /// The transport-level connection attempt failed after all retries.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The passport service or one of its required characteristics is
    /// missing on the connected device.
    #[error("device does not expose the passport reader service")]
    ServiceNotSupported,

    /// A command was issued while no characteristic bindings exist.
    #[error("not connected to a reader device")]
    NotConnected,

    /// Writing to the command characteristic failed.
    #[error("command write failed: {0}")]
    WriteFailed(String),

    /// An operation was attempted in a connection state that does not
    /// permit it, e.g. connect() while already connected.
    #[error("invalid state for this operation: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// A passport data payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Errors produced while decoding a passport data payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload held fewer `|`-separated fields than a record needs.
    #[error("malformed passport record: expected at least 8 fields, got {fields}")]
    MalformedRecord { fields: usize },
}

/// Maps a platform adapter error, preferring the permission variant when
/// the underlying message indicates an authorization failure.
pub(crate) fn adapter_error(err: &bluest::Error, fallback: fn(String) -> BleError) -> BleError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("authoriz") || lower.contains("permission") {
        BleError::PermissionDenied
    } else {
        fallback(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_record_reports_field_count() {
        let err = DecodeError::MalformedRecord { fields: 3 };
        assert!(err.to_string().contains("got 3"));
    }

    #[test]
    fn decode_error_converts_into_ble_error() {
        let err: BleError = DecodeError::MalformedRecord { fields: 0 }.into();
        assert!(matches!(
            err,
            BleError::Decode(DecodeError::MalformedRecord { fields: 0 })
        ));
    }

    #[test]
    fn invalid_state_names_both_states() {
        let err = BleError::InvalidState {
            expected: "Disconnected",
            actual: "Connected",
        };
        let text = err.to_string();
        assert!(text.contains("Disconnected") && text.contains("Connected"));
    }
}

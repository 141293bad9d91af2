//! Reader command encoding.
//! Each command is a single byte written to the command characteristic;
//! values match the firmware's command enum.

/// Commands accepted by the reader firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderCommand {
    /// Start polling for a passport chip (0x01).
    StartScan,
    /// Stop polling (0x02).
    StopScan,
    /// Request the last read record (0x03).
    GetData,
    /// Reset the reader to idle (0x04).
    Reset,
}

impl ReaderCommand {
    /// Wire encoding of the command.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::StartScan => 0x01,
            Self::StopScan => 0x02,
            Self::GetData => 0x03,
            Self::Reset => 0x04,
        }
    }

    /// Inverse of `to_byte`, for diagnostics and tests.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::StartScan),
            0x02 => Some(Self::StopScan),
            0x03 => Some(Self::GetData),
            0x04 => Some(Self::Reset),
            _ => None,
        }
    }
}

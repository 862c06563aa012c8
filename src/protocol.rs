use crate::error::{DynoError, Result};
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Base UUID used to expand 16-bit Bluetooth SIG assigned numbers
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit assigned number into a full 128-bit UUID
#[must_use]
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Modern firmware data service
pub const MODERN_SERVICE_UUID: Uuid = Uuid::from_u128(0x7E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);
/// Modern firmware command characteristic (write)
pub const MODERN_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x7E40_0002_B5A3_F393_E0A9_E50E_24DC_CA9E);
/// Modern firmware sample characteristic (notify)
pub const MODERN_READ_CHAR_UUID: Uuid = Uuid::from_u128(0x7E40_0003_B5A3_F393_E0A9_E50E_24DC_CA9E);

/// Legacy firmware data service
pub const LEGACY_SERVICE_UUID: Uuid = bluetooth_uuid(0xFFF0);
/// Legacy firmware command characteristic (write)
pub const LEGACY_WRITE_CHAR_UUID: Uuid = bluetooth_uuid(0xFFF2);
/// Legacy firmware sample characteristic (notify)
pub const LEGACY_READ_CHAR_UUID: Uuid = bluetooth_uuid(0xFFF1);

/// Battery Service
pub const BATTERY_SERVICE_UUID: Uuid = bluetooth_uuid(0x180F);
/// Battery Level characteristic, single byte 0-100
pub const BATTERY_LEVEL_CHAR_UUID: Uuid = bluetooth_uuid(0x2A19);
/// Device Information Service
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid = bluetooth_uuid(0x180A);
/// System ID characteristic, 8 bytes
pub const SYSTEM_ID_CHAR_UUID: Uuid = bluetooth_uuid(0x2A23);
/// Firmware Revision String characteristic
pub const FIRMWARE_REVISION_CHAR_UUID: Uuid = bluetooth_uuid(0x2A26);
/// Hardware Revision String characteristic
pub const HARDWARE_REVISION_CHAR_UUID: Uuid = bluetooth_uuid(0x2A27);

/// Length of the System ID attribute
pub const SYSTEM_ID_LEN: usize = 8;

/// Byte positions of the address inside the System ID, most significant first.
/// Indices 3 and 4 hold the manufacturer-defined filler.
const SYSTEM_ID_ADDRESS_INDICES: [usize; 6] = [7, 6, 5, 2, 1, 0];

/// Single-byte commands accepted on the write characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Stop sample emission
    Stop = 0x00,
    /// Start sample emission
    Start = 0x01,
    /// Heartbeat that keeps the peripheral from sleeping
    KeepAlive = 0x02,
}

impl Command {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Stop),
            0x01 => Some(Self::Start),
            0x02 => Some(Self::KeepAlive),
            _ => None,
        }
    }

    /// Serialize the opcode
    #[must_use]
    pub fn to_bytes(self) -> Bytes {
        Bytes::copy_from_slice(&[self as u8])
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Start => write!(f, "start"),
            Self::KeepAlive => write!(f, "keep-alive"),
        }
    }
}

/// Firmware protocol revision, each with its own attribute triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolRevision {
    /// Original firmware using 16-bit vendor attributes
    Legacy,
    /// Current firmware using 128-bit vendor attributes
    Modern,
}

impl ProtocolRevision {
    /// Order in which revisions are probed on a fresh connection
    pub const PROBE_ORDER: [Self; 2] = [Self::Modern, Self::Legacy];

    /// Data service UUID
    #[must_use]
    pub const fn service_uuid(self) -> Uuid {
        match self {
            Self::Legacy => LEGACY_SERVICE_UUID,
            Self::Modern => MODERN_SERVICE_UUID,
        }
    }

    /// Command characteristic UUID
    #[must_use]
    pub const fn write_uuid(self) -> Uuid {
        match self {
            Self::Legacy => LEGACY_WRITE_CHAR_UUID,
            Self::Modern => MODERN_WRITE_CHAR_UUID,
        }
    }

    /// Sample notification characteristic UUID
    #[must_use]
    pub const fn read_uuid(self) -> Uuid {
        match self {
            Self::Legacy => LEGACY_READ_CHAR_UUID,
            Self::Modern => MODERN_READ_CHAR_UUID,
        }
    }
}

impl fmt::Display for ProtocolRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "Legacy"),
            Self::Modern => write!(f, "Modern"),
        }
    }
}

/// Iterate the big-endian signed 16-bit samples batched in one notification.
///
/// A trailing odd byte is ignored.
pub fn samples(payload: &[u8]) -> impl Iterator<Item = i16> + '_ {
    payload
        .chunks_exact(2)
        .map(|mut chunk: &[u8]| chunk.get_i16())
}

/// Round to two decimal places
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Derive the device address from the System ID attribute
///
/// # Errors
///
/// Returns [`DynoError::ParseError`] if fewer than 8 bytes are supplied.
pub fn decode_mac_address(system_id: &[u8]) -> Result<String> {
    if system_id.len() < SYSTEM_ID_LEN {
        return Err(DynoError::ParseError(format!(
            "System ID too short: {} bytes, expected {SYSTEM_ID_LEN}",
            system_id.len()
        )));
    }

    let parts: Vec<String> = SYSTEM_ID_ADDRESS_INDICES
        .iter()
        .map(|&i| format!("{:02X}", system_id[i]))
        .collect();

    Ok(parts.join(":"))
}

/// Extract the numeric version from a revision string attribute
///
/// Control bytes other than tab, LF and CR are dropped, as is anything outside
/// printable ASCII. The first contiguous run of digits is the version.
///
/// # Errors
///
/// Returns [`DynoError::ParseError`] if the value holds no digits.
pub fn decode_version(raw: &[u8]) -> Result<String> {
    let printable: String = raw
        .iter()
        .copied()
        .filter(|b| matches!(b, b'\t' | b'\n' | b'\r' | 0x20..=0x7E))
        .map(char::from)
        .collect();

    let trimmed = printable.trim();
    let version: String = trimmed
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();

    if version.is_empty() {
        return Err(DynoError::ParseError(format!(
            "No version number in {trimmed:?}"
        )));
    }

    Ok(version)
}

/// Decode the Battery Level attribute
///
/// # Errors
///
/// Returns [`DynoError::ParseError`] for an empty value or a level above 100.
pub fn decode_battery_level(raw: &[u8]) -> Result<u8> {
    match raw.first() {
        Some(&level) if level <= 100 => Ok(level),
        Some(&level) => Err(DynoError::ParseError(format!(
            "Battery level out of range: {level}"
        ))),
        None => Err(DynoError::ParseError("Empty battery level".to_string())),
    }
}

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when working with a force dynamometer
#[derive(Error, Debug)]
pub enum DynoError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth capability on this host
    #[error("Bluetooth is not available on this host")]
    Unavailable,

    /// Discovery or pairing yielded no matching peripheral
    #[error("Dynamometer not found")]
    DeviceNotFound,

    /// A single connection attempt did not resolve in time
    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// All connection attempts were exhausted
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Neither protocol revision could be resolved on the peripheral
    #[error("Dynamometer service not found")]
    ServiceNotFound,

    /// A characteristic is missing from a resolved service
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// Calibration produced an insufficient or degenerate sample set
    #[error("Calibration failed: {0}")]
    CalibrationFailed(String),

    /// Operation attempted without a live link
    #[error("Device not connected")]
    NotConnected,

    /// A characteristic already has an active subscriber
    #[error("Characteristic {0} already has a subscriber")]
    AlreadySubscribed(Uuid),

    /// Unsubscribe requested for a characteristic nobody subscribed to
    #[error("Characteristic {0} is not subscribed")]
    NotSubscribed(Uuid),

    /// Operation is not valid in the current session state
    #[error("Invalid device state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Caller-supplied values were rejected
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Attribute payload could not be decoded
    #[error("Failed to parse attribute value: {0}")]
    ParseError(String),

    /// Link-level read or write failure reported by the backend
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for dynamometer operations
pub type Result<T> = std::result::Result<T, DynoError>;

/// Coarse classification of [`DynoError`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No wireless capability on the host
    Unavailable,
    /// Discovery or pairing yielded nothing
    DeviceNotFound,
    /// A connection attempt timed out
    ConnectionTimeout,
    /// Connection retries exhausted or the link dropped during setup
    ConnectionFailed,
    /// Neither protocol revision resolves
    ServiceNotFound,
    /// Calibration sample set was unusable
    CalibrationFailed,
    /// No live link
    NotConnected,
    /// Subscription bookkeeping, state and parse errors
    Protocol,
    /// Errors surfaced by the Bluetooth stack itself
    Transport,
}

impl DynoError {
    /// Map this error onto the taxonomy shared by every code path
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable => ErrorKind::Unavailable,
            Self::DeviceNotFound => ErrorKind::DeviceNotFound,
            Self::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            Self::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Self::ServiceNotFound | Self::CharacteristicNotFound(_) => ErrorKind::ServiceNotFound,
            Self::CalibrationFailed(_) => ErrorKind::CalibrationFailed,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::AlreadySubscribed(_)
            | Self::NotSubscribed(_)
            | Self::InvalidState { .. }
            | Self::InvalidParameters(_)
            | Self::ParseError(_) => ErrorKind::Protocol,
            Self::Ble(_) | Self::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::ConnectionTimeout { .. }
                | Self::NotConnected
                | Self::DeviceNotFound
        )
    }

    /// Check if the caller may simply retry the failed operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CalibrationFailed(_) | Self::ConnectionTimeout { .. } | Self::InvalidState { .. }
        )
    }
}

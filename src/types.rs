use crate::ACCEPTED_NAME_PREFIXES;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level state of a [`DeviceSession`](crate::DeviceSession)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// No live link
    Disconnected,
    /// Connected, reference point not chosen yet
    WaitingForSetup,
    /// Reference point chosen, zero offset not measured yet
    WaitingForCalibration,
    /// Zero-offset sampling window in progress
    Calibrating,
    /// Calibrated and idle
    Ready,
    /// Streaming samples, or waiting for a rep to begin
    Measuring,
    /// Rep detected, force still rising
    MeasuringGoingUp,
    /// Rep past its peak, force falling
    MeasuringGoingDown,
}

impl DeviceStatus {
    /// Whether a link is established in this state
    #[must_use]
    pub const fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    /// Whether samples are flowing in this state
    #[must_use]
    pub const fn is_measuring(self) -> bool {
        matches!(
            self,
            Self::Measuring | Self::MeasuringGoingUp | Self::MeasuringGoingDown
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::WaitingForSetup => write!(f, "Waiting for setup"),
            Self::WaitingForCalibration => write!(f, "Waiting for calibration"),
            Self::Calibrating => write!(f, "Calibrating"),
            Self::Ready => write!(f, "Ready"),
            Self::Measuring => write!(f, "Measuring"),
            Self::MeasuringGoingUp => write!(f, "Measuring (going up)"),
            Self::MeasuringGoingDown => write!(f, "Measuring (going down)"),
        }
    }
}

/// Identity of one discovered peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Backend-specific peripheral identifier
    pub id: String,
    /// Advertised local name, if any
    pub name: Option<String>,
}

impl DeviceHandle {
    /// Create a new device handle
    #[must_use]
    pub const fn new(id: String, name: Option<String>) -> Self {
        Self { id, name }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Best-effort information read from the standard GATT services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Battery level percentage
    pub battery_level: Option<u8>,
    /// Address derived from the System ID, `AA:BB:CC:DD:EE:FF`
    pub mac_address: Option<String>,
    /// Firmware version digits
    pub firmware_version: String,
    /// Hardware version digits
    pub hardware_version: String,
}

impl DeviceMetadata {
    /// Version reported when the attribute cannot be read
    pub const DEFAULT_VERSION: &'static str = "1";
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self {
            battery_level: None,
            mac_address: None,
            firmware_version: Self::DEFAULT_VERSION.to_string(),
            hardware_version: Self::DEFAULT_VERSION.to_string(),
        }
    }
}

/// Known load and the ADC reading it produces, used to scale samples to kgf
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    /// Reference load in kgf
    pub weight: f64,
    /// ADC counts above zero produced by the reference load
    pub adc_value: i32,
}

impl ReferencePoint {
    /// Reference for first-generation hardware
    pub const HARDWARE_V1: Self = Self {
        weight: 8.65,
        adc_value: 235,
    };

    /// Reference for every later hardware generation
    pub const HARDWARE_DEFAULT: Self = Self {
        weight: 45.0,
        adc_value: 3800,
    };

    /// Choose the factory reference for a hardware version string
    #[must_use]
    pub fn for_hardware(hardware_version: &str) -> Self {
        if hardware_version.starts_with('1') {
            Self::HARDWARE_V1
        } else {
            Self::HARDWARE_DEFAULT
        }
    }

    /// kgf per ADC count
    #[must_use]
    pub fn conversion_factor(&self) -> f64 {
        self.weight / f64::from(self.adc_value)
    }

    /// Whether this reference yields a positive, finite conversion factor
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let factor = self.conversion_factor();
        factor.is_finite() && factor > 0.0
    }
}

/// Outcome of a zero-offset calibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// ADC reading with no load applied
    pub zero_adc_value: i32,
    /// Reference load in kgf
    pub reference_weight: f64,
    /// ADC counts produced by the reference load
    pub reference_adc_value: i32,
}

impl CalibrationResult {
    /// Combine a measured zero offset with a reference point
    #[must_use]
    pub const fn new(zero_adc_value: i32, reference: ReferencePoint) -> Self {
        Self {
            zero_adc_value,
            reference_weight: reference.weight,
            reference_adc_value: reference.adc_value,
        }
    }

    /// kgf per ADC count
    #[must_use]
    pub fn conversion_factor(&self) -> f64 {
        self.reference_weight / f64::from(self.reference_adc_value)
    }
}

/// Summary of one captured contraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepSummary {
    /// Every force value from the start of the rise to the end of the release
    pub data: Vec<f64>,
    /// Peak force
    pub max: f64,
    /// Lowest force
    pub min: f64,
    /// Mean force
    pub avg: f64,
}

impl RepSummary {
    /// Compute the statistics over a captured buffer
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_samples(data: Vec<f64>) -> Self {
        if data.is_empty() {
            return Self {
                data,
                max: 0.0,
                min: 0.0,
                avg: 0.0,
            };
        }

        let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = data.iter().copied().fold(f64::INFINITY, f64::min);
        let avg = data.iter().sum::<f64>() / data.len() as f64;

        Self { data, max, min, avg }
    }
}

/// Which peripherals `pair` accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Accepted advertised name prefixes
    pub name_prefixes: Vec<String>,
    /// Identifiers of previously bonded peripherals
    pub bonded_ids: Vec<String>,
}

impl DeviceFilter {
    /// Check a discovered peripheral against this filter
    #[must_use]
    pub fn matches(&self, id: &str, name: Option<&str>) -> bool {
        if self.bonded_ids.iter().any(|bonded| bonded == id) {
            return true;
        }

        name.is_some_and(|name| {
            self.name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
        })
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            name_prefixes: ACCEPTED_NAME_PREFIXES
                .iter()
                .map(ToString::to_string)
                .collect(),
            bonded_ids: Vec::new(),
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Timeout for a single connection attempt in milliseconds
    pub timeout_ms: u64,
    /// Number of connection attempts before giving up
    pub max_retries: u32,
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Settle time after connecting before the link is re-verified
    pub stabilization_delay_ms: u64,
    /// Extra time granted to a recovery handler after the attempts run out
    pub recovery_grace_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_retries: 5,
            scan_timeout_ms: 10_000,
            stabilization_delay_ms: 500,
            recovery_grace_ms: 60_000,
        }
    }
}

/// Protocol timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between keep-alive writes in milliseconds
    pub keep_alive_interval_ms: u64,
    /// Length of the zero-offset sampling window in milliseconds
    pub calibration_window_ms: u64,
    /// Attempts per metadata attribute
    pub metadata_attempts: u32,
    /// Backoff unit for metadata retries, multiplied by the attempt number
    pub metadata_backoff_ms: u64,
    /// Interval between link checks while disconnecting
    pub disconnect_poll_interval_ms: u64,
    /// Number of link checks while disconnecting
    pub disconnect_poll_attempts: u32,
    /// Interval between link-loss checks while connected
    pub link_monitor_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: 60_000,
            calibration_window_ms: 2_000,
            metadata_attempts: 3,
            metadata_backoff_ms: 200,
            disconnect_poll_interval_ms: 1_000,
            disconnect_poll_attempts: 10,
            link_monitor_interval_ms: 1_000,
        }
    }
}

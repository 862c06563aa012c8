#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Dynolink
//!
//! A Rust library for wireless isometric force dynamometers via Bluetooth Low Energy.
//!
//! The crate covers everything between the radio and a stream of calibrated
//! force values in kgf:
//!
//! - **Discovery and pairing**: advertised-name and bonded-id filtering
//! - **Connection**: per-attempt timeouts, bounded retries and an optional
//!   recovery grace period
//! - **Protocol revisions**: Modern and Legacy firmware expose different
//!   attribute triples; the session probes Modern first and falls back
//! - **Metadata**: battery level, address, firmware and hardware versions,
//!   all best-effort
//! - **Calibration**: a fixed sampling window reduced to a zero offset with a
//!   10% trimmed mean
//! - **Streaming**: continuous decoding of batched big-endian samples
//! - **Rep capture**: a hysteresis state machine that records one
//!   rise-peak-release contraction
//! - **Keep-alive**: a periodic heartbeat so the device does not sleep
//!
//! ## Quick Start
//!
//! ```no_run
//! use dynolink::{DeviceSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = DeviceSession::with_btleplug(SessionConfig::default()).await?;
//!     session.connect().await?;
//!     session.setup(None, None).await?;
//!     session.start_calibration().await?;
//!
//!     session
//!         .start_continuous_streaming(|kgf| {
//!             println!("{kgf:.2} kgf");
//!             Ok(())
//!         })
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     session.stop_streaming().await?;
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy backend abstraction and the btleplug implementation
pub mod ble;
/// Zero-offset calibration
pub mod calibration;
/// Device session and status state machine
pub mod device;
/// Error types and handling
pub mod error;
/// Attribute layout, opcodes and value decoding
pub mod protocol;
/// Single-contraction detection
pub mod rep;
/// Continuous force decoding
pub mod stream;
/// Connection, subscription and write management over a backend
pub mod transport;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
pub use ble::{BleBackend, BtleplugBackend, CharacteristicRef, NotificationStream};
pub use device::{DeviceSession, EventCallback, RepCallbacks, SessionConfig, StatusCallback};
pub use error::{DynoError, ErrorKind, Result};
pub use protocol::{Command, ProtocolRevision};
pub use rep::{RepDetector, RepPhase};
pub use stream::{BatchCallback, CallbackError, CallbackResult, ForceDecoder, ValueCallback};
pub use transport::{RecoveryHandler, Subscription, Transport};
pub use types::{
    CalibrationResult, ConnectionParams, DeviceFilter, DeviceHandle, DeviceMetadata,
    DeviceStatus, ReferencePoint, RepSummary, TimingConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Advertised name prefixes of supported dynamometers
///
/// First-generation units advertise as `DYNO`, later units as `IsoForce`.
pub const ACCEPTED_NAME_PREFIXES: [&str; 2] = ["IsoForce", "DYNO"];

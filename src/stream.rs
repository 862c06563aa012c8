use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    protocol::{round2, samples},
    transport::Subscription,
    types::CalibrationResult,
};

/// Error a consumer callback may report; it is logged and otherwise ignored
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of consumer callbacks
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Per-sample consumer callback
pub type ValueCallback = Arc<dyn Fn(f64) -> CallbackResult + Send + Sync>;

/// Per-notification consumer callback
pub type BatchCallback = Arc<dyn Fn(&[f64]) -> CallbackResult + Send + Sync>;

/// Convert one raw reading to kgf
///
/// `max(0, round((raw - zero) * factor, 2))`
#[must_use]
pub fn decode(raw: i16, zero_adc_value: i32, conversion_factor: f64) -> f64 {
    let calibrated = i32::from(raw) - zero_adc_value;
    let value = round2(f64::from(calibrated) * conversion_factor);
    if value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Sample decoder bound to one calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceDecoder {
    zero_adc_value: i32,
    conversion_factor: f64,
}

impl ForceDecoder {
    /// Build a decoder; the conversion factor is computed once here
    #[must_use]
    pub fn new(calibration: &CalibrationResult) -> Self {
        Self {
            zero_adc_value: calibration.zero_adc_value,
            conversion_factor: calibration.conversion_factor(),
        }
    }

    /// Convert one raw reading to kgf
    #[must_use]
    pub fn decode(&self, raw: i16) -> f64 {
        decode(raw, self.zero_adc_value, self.conversion_factor)
    }

    /// Convert every sample batched in one notification payload
    #[must_use]
    pub fn decode_payload(&self, payload: &[u8]) -> Vec<f64> {
        samples(payload).map(|raw| self.decode(raw)).collect()
    }
}

/// Hand a consumer one value, logging instead of propagating its failure
pub(crate) fn deliver(on_value: &ValueCallback, value: f64) {
    if let Err(e) = on_value(value) {
        warn!("Force consumer rejected {:.2} kgf: {}", value, e);
    }
}

/// Decode a subscription into the consumer callback until it is released
pub(crate) fn spawn_stream(
    mut subscription: Subscription,
    decoder: ForceDecoder,
    on_value: ValueCallback,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = subscription.next().await {
            for raw in samples(&payload) {
                deliver(&on_value, decoder.decode(raw));
            }
        }
        debug!("Force stream ended");
    })
}

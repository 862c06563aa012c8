use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::{
    error::{DynoError, Result},
    protocol::{self, Command},
    transport::Link,
};

/// Fewest samples a calibration window may produce
pub const MIN_CALIBRATION_SAMPLES: usize = 10;

/// Share of samples discarded from each end of the sorted window, as `n / TRIM_DIVISOR`
const TRIM_DIVISOR: usize = 10;

/// Reduce a calibration window to the zero offset
///
/// The samples are sorted, `floor(n / 10)` are dropped from each end, and the
/// mean of the rest is rounded to the nearest integer.
///
/// # Errors
///
/// Returns [`DynoError::CalibrationFailed`] with fewer than
/// [`MIN_CALIBRATION_SAMPLES`] samples, or if the trimmed mean is unusable.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn zero_offset(mut samples: Vec<i16>) -> Result<i32> {
    if samples.len() < MIN_CALIBRATION_SAMPLES {
        return Err(DynoError::CalibrationFailed(format!(
            "collected {} samples, need at least {MIN_CALIBRATION_SAMPLES}",
            samples.len()
        )));
    }

    samples.sort_unstable();
    let trim = samples.len() / TRIM_DIVISOR;
    let kept = &samples[trim..samples.len() - trim];
    if kept.is_empty() {
        return Err(DynoError::CalibrationFailed(
            "no samples left after trimming".to_string(),
        ));
    }

    let sum: i64 = kept.iter().copied().map(i64::from).sum();
    let mean = (sum as f64 / kept.len() as f64).round();
    if !mean.is_finite() {
        return Err(DynoError::CalibrationFailed(format!(
            "trimmed mean is not finite: {mean}"
        )));
    }

    debug!(
        "Trimmed {} sample(s) from each end of {}, zero offset {}",
        trim,
        samples.len(),
        mean
    );
    Ok(mean as i32)
}

/// Record raw samples for one calibration window
///
/// The sample subscription is rebuilt from scratch, the device is started,
/// and everything delivered until `window` elapses is kept. The subscription
/// is released afterwards even when a write fails.
pub(crate) async fn collect_samples(link: &Link, window: Duration) -> Result<Vec<i16>> {
    let mut subscription = link.resubscribe().await?;
    let collected = sample_window(link, &mut subscription, window).await;

    if let Err(e) = link.release().await {
        warn!("Failed to release calibration subscription: {}", e);
    }
    collected
}

async fn sample_window(
    link: &Link,
    subscription: &mut crate::transport::Subscription,
    window: Duration,
) -> Result<Vec<i16>> {
    let mut samples = Vec::new();

    link.send(Command::Start).await?;
    info!("Calibration window open for {}ms", window.as_millis());

    let deadline = sleep_until(Instant::now() + window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            payload = subscription.next() => match payload {
                Some(payload) => samples.extend(protocol::samples(&payload)),
                None => return Err(DynoError::NotConnected),
            },
        }
    }

    link.send(Command::Stop).await?;
    while let Some(payload) = subscription.try_next() {
        samples.extend(protocol::samples(&payload));
    }

    info!("Calibration window closed with {} samples", samples.len());
    Ok(samples)
}

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{DeviceStatus, RepSummary};

/// Consecutive qualifying batches needed for any phase change
pub const MAX_COUNT: u32 = 3;

/// Batch mean (kgf) above which a contraction is considered started
pub const RISE_THRESHOLD: f64 = 2.0;

/// Batch mean (kgf) below which a contraction is considered released
pub const RELEASE_THRESHOLD: f64 = 1.0;

/// Phase of a single contraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepPhase {
    /// Waiting for the force to rise
    Measuring,
    /// Force rising towards the peak
    GoingUp,
    /// Force falling after the peak
    GoingDown,
    /// Contraction released
    Done,
}

impl From<RepPhase> for DeviceStatus {
    fn from(phase: RepPhase) -> Self {
        match phase {
            RepPhase::Measuring => Self::Measuring,
            RepPhase::GoingUp => Self::MeasuringGoingUp,
            RepPhase::GoingDown => Self::MeasuringGoingDown,
            RepPhase::Done => Self::Ready,
        }
    }
}

impl fmt::Display for RepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measuring => write!(f, "Measuring"),
            Self::GoingUp => write!(f, "Going up"),
            Self::GoingDown => write!(f, "Going down"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// Hysteresis state machine for one isometric contraction
///
/// Fed one notification batch at a time. Every transition needs
/// [`MAX_COUNT`] consecutive batches meeting its condition; a single batch
/// that misses resets the streak.
///
/// | from        | condition                          | to          |
/// |-------------|------------------------------------|-------------|
/// | `Measuring` | mean > [`RISE_THRESHOLD`]          | `GoingUp`   |
/// | `GoingUp`   | mean < previous batch mean         | `GoingDown` |
/// | `GoingDown` | mean < [`RELEASE_THRESHOLD`]       | `Done`      |
///
/// Values are recorded from the batch that completes the rise onwards.
#[derive(Debug, Clone)]
pub struct RepDetector {
    phase: RepPhase,
    streak: u32,
    previous_mean: Option<f64>,
    buffer: Vec<f64>,
}

impl Default for RepDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RepDetector {
    /// Start in [`RepPhase::Measuring`]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: RepPhase::Measuring,
            streak: 0,
            previous_mean: None,
            buffer: Vec::new(),
        }
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> RepPhase {
        self.phase
    }

    /// Values recorded so far
    #[must_use]
    pub fn recorded(&self) -> &[f64] {
        &self.buffer
    }

    /// Feed one batch of decoded values
    ///
    /// Returns the new phase when this batch caused a transition. Empty
    /// batches and batches after [`RepPhase::Done`] are ignored.
    #[allow(clippy::cast_precision_loss)]
    pub fn feed(&mut self, batch: &[f64]) -> Option<RepPhase> {
        if batch.is_empty() || self.phase == RepPhase::Done {
            return None;
        }

        let mean = batch.iter().sum::<f64>() / batch.len() as f64;
        let previous = self.previous_mean.replace(mean);

        let (condition, next) = match self.phase {
            RepPhase::Measuring => (mean > RISE_THRESHOLD, RepPhase::GoingUp),
            RepPhase::GoingUp => (
                previous.is_some_and(|previous| mean < previous),
                RepPhase::GoingDown,
            ),
            RepPhase::GoingDown => (mean < RELEASE_THRESHOLD, RepPhase::Done),
            RepPhase::Done => return None,
        };

        let transition = if self.advance(condition) {
            self.phase = next;
            Some(next)
        } else {
            None
        };

        if self.phase != RepPhase::Measuring {
            self.buffer.extend_from_slice(batch);
        }

        transition
    }

    fn advance(&mut self, condition: bool) -> bool {
        if !condition {
            self.streak = 0;
            return false;
        }

        self.streak += 1;
        if self.streak >= MAX_COUNT {
            self.streak = 0;
            true
        } else {
            false
        }
    }

    /// Statistics over everything recorded
    #[must_use]
    pub fn into_summary(self) -> RepSummary {
        RepSummary::from_samples(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(detector: &mut RepDetector, batches: &[&[f64]]) -> Vec<Option<RepPhase>> {
        batches.iter().map(|batch| detector.feed(batch)).collect()
    }

    #[test]
    fn test_full_contraction() {
        let mut detector = RepDetector::new();
        let transitions = feed_all(
            &mut detector,
            &[
                &[0.0, 0.0],
                &[5.0, 5.0],
                &[6.0, 6.0],
                &[7.0, 7.0],
                &[8.0, 8.0],
                &[6.0, 6.0],
                &[5.0, 5.0],
                &[4.0, 4.0],
                &[0.0, 0.0],
                &[0.0, 0.0],
                &[0.0, 0.0],
            ],
        );

        assert_eq!(transitions[3], Some(RepPhase::GoingUp));
        assert_eq!(transitions[7], Some(RepPhase::GoingDown));
        assert_eq!(transitions[10], Some(RepPhase::Done));
        assert_eq!(transitions.iter().flatten().count(), 3);
        assert_eq!(detector.phase(), RepPhase::Done);

        let summary = detector.into_summary();
        assert_eq!(summary.data.len(), 16);
        assert!((summary.max - 8.0).abs() < f64::EPSILON);
        assert!(summary.min.abs() < f64::EPSILON);
        assert!((summary.avg - 3.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rise_needs_consecutive_batches() {
        let mut detector = RepDetector::new();
        feed_all(&mut detector, &[&[3.0], &[3.0], &[1.0], &[3.0], &[3.0]]);
        assert_eq!(detector.phase(), RepPhase::Measuring);
        assert!(detector.recorded().is_empty());

        assert_eq!(detector.feed(&[3.0]), Some(RepPhase::GoingUp));
        assert_eq!(detector.recorded(), &[3.0]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut detector = RepDetector::new();
        feed_all(&mut detector, &[&[2.0], &[2.0], &[2.0], &[2.0]]);
        assert_eq!(detector.phase(), RepPhase::Measuring);
    }

    #[test]
    fn test_release_streak_resets() {
        let mut detector = RepDetector::new();
        feed_all(
            &mut detector,
            &[&[5.0], &[6.0], &[7.0], &[6.0], &[5.0], &[4.0]],
        );
        assert_eq!(detector.phase(), RepPhase::GoingDown);

        feed_all(&mut detector, &[&[0.5], &[0.5], &[1.5], &[0.5], &[0.5]]);
        assert_eq!(detector.phase(), RepPhase::GoingDown);

        assert_eq!(detector.feed(&[0.0]), Some(RepPhase::Done));
    }

    #[test]
    fn test_peak_plateau_resets_fall_streak() {
        let mut detector = RepDetector::new();
        feed_all(&mut detector, &[&[5.0], &[6.0], &[7.0]]);
        assert_eq!(detector.phase(), RepPhase::GoingUp);

        feed_all(&mut detector, &[&[6.0], &[5.0], &[5.0], &[4.0], &[3.0]]);
        assert_eq!(detector.phase(), RepPhase::GoingUp);

        assert_eq!(detector.feed(&[2.0]), Some(RepPhase::GoingDown));
    }

    #[test]
    fn test_ignores_empty_and_late_batches() {
        let mut detector = RepDetector::new();
        assert_eq!(detector.feed(&[]), None);

        feed_all(
            &mut detector,
            &[
                &[5.0], &[6.0], &[7.0], &[6.0], &[5.0], &[4.0], &[0.0], &[0.0], &[0.0],
            ],
        );
        assert_eq!(detector.phase(), RepPhase::Done);
        let recorded = detector.recorded().len();

        assert_eq!(detector.feed(&[9.0]), None);
        assert_eq!(detector.recorded().len(), recorded);
    }

    #[test]
    fn test_phase_maps_to_status() {
        assert_eq!(DeviceStatus::from(RepPhase::GoingUp), DeviceStatus::MeasuringGoingUp);
        assert_eq!(DeviceStatus::from(RepPhase::Done), DeviceStatus::Ready);
    }
}

//! Learn-phase threshold recalibration.
//!
//! The reason phase classifies hotspot brightness against four cut-points
//! ([`crate::types::SeverityThresholds`]). Rather than hardcoding them
//! forever, the learn phase re-derives the cut-points from the trailing
//! radiance distribution and swaps them in atomically: readers always see
//! either the old complete set or the new complete set, never a mix.
//!
//! The percentile convention here is floor-indexed, not interpolated;
//! see [`crate::detect::interpolated_quantile`] for the other one.

use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

use crate::types::SeverityThresholds;

/// Percentiles that become the low/medium/high/extreme cut-points.
pub const CALIBRATION_PERCENTILES: [f64; 4] = [0.75, 0.85, 0.95, 0.98];

/// Floor-indexed percentile: `sorted[floor(n * q)]`, index clamped to the
/// last element. Assumes `sorted_asc` is sorted ascending and non-empty.
pub fn floor_percentile(sorted_asc: &[f64], q: f64) -> f64 {
    let idx = ((sorted_asc.len() as f64 * q).floor() as usize).min(sorted_asc.len() - 1);
    sorted_asc[idx]
}

/// Derive a fresh threshold set from observed radiance values.
///
/// Returns `None` for an empty sample; the caller keeps the current
/// thresholds untouched rather than installing degenerate ones. All four
/// cut-points are computed before anything is returned, so a partial set
/// can never exist.
pub fn recalibrate(values: &[f64]) -> Option<SeverityThresholds> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let [low_q, medium_q, high_q, extreme_q] = CALIBRATION_PERCENTILES;
    let thresholds = SeverityThresholds {
        low: floor_percentile(&sorted, low_q),
        medium: floor_percentile(&sorted, medium_q),
        high: floor_percentile(&sorted, high_q),
        extreme: floor_percentile(&sorted, extreme_q),
    };
    Some(thresholds)
}

/// Shared, atomically swappable threshold set.
///
/// Cloning is cheap and every clone observes the same underlying cell, so
/// the scheduler's learn phase can publish new cut-points while the reason
/// phase reads them without locks.
#[derive(Clone)]
pub struct LiveThresholds {
    inner: Arc<ArcSwap<SeverityThresholds>>,
}

impl Default for LiveThresholds {
    fn default() -> Self {
        Self::new(SeverityThresholds::default())
    }
}

impl LiveThresholds {
    pub fn new(initial: SeverityThresholds) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Snapshot of the current cut-points.
    pub fn current(&self) -> SeverityThresholds {
        **self.inner.load()
    }

    /// Publish a complete replacement set.
    pub fn replace(&self, next: SeverityThresholds) {
        info!(
            low = next.low,
            medium = next.medium,
            high = next.high,
            extreme = next.extreme,
            "severity thresholds recalibrated"
        );
        self.inner.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    #[test]
    fn floor_percentile_indexes_without_interpolation() {
        let sorted = [10.0, 20.0, 30.0, 40.0];
        // floor(4 * 0.75) = 3
        assert_eq!(floor_percentile(&sorted, 0.75), 40.0);
        // floor(4 * 0.5) = 2
        assert_eq!(floor_percentile(&sorted, 0.5), 30.0);
        // index clamps to the last element
        assert_eq!(floor_percentile(&sorted, 1.0), 40.0);
        assert_eq!(floor_percentile(&[7.0], 0.98), 7.0);
    }

    #[test]
    fn recalibrate_empty_sample_is_none() {
        assert!(recalibrate(&[]).is_none());
    }

    #[test]
    fn recalibrate_produces_ascending_cut_points() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let t = recalibrate(&values).expect("non-empty");
        // floor(100 * q) on 1..=100 lands on q*100 + 1.
        assert_eq!(t.low, 76.0);
        assert_eq!(t.medium, 86.0);
        assert_eq!(t.high, 96.0);
        assert_eq!(t.extreme, 99.0);
        assert!(t.is_ascending());
    }

    #[test]
    fn recalibrate_is_input_order_independent() {
        let mut shuffled = vec![30.0, 10.0, 40.0, 20.0, 50.0];
        let a = recalibrate(&shuffled).expect("non-empty");
        shuffled.reverse();
        let b = recalibrate(&shuffled).expect("non-empty");
        assert_eq!(a, b);
    }

    #[test]
    fn replace_swaps_the_whole_set_for_all_clones() {
        let live = LiveThresholds::default();
        let reader = live.clone();
        assert_eq!(reader.current().low, 15.0);

        live.replace(SeverityThresholds {
            low: 40.0,
            medium: 50.0,
            high: 60.0,
            extreme: 70.0,
        });

        let seen = reader.current();
        assert_eq!(seen.low, 40.0);
        assert_eq!(seen.extreme, 70.0);
        assert_eq!(seen.classify(55.0), Severity::Medium);
    }
}

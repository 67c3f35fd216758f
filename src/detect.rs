//! Anomaly detection.
//!
//! Two complementary detectors share this module:
//!
//! - [`AnomalyDetector::detect_anomalies`]: a rolling 30-sample
//!   mean-deviation test per region that raises region-level [`Alert`]s
//! - [`detect_hotspots`]: a standalone quantile/percentile-rank classifier
//!   over any scored point set, producing severity-tagged results
//!
//! Note the two percentile conventions in this crate are intentionally
//! different: [`interpolated_quantile`] (R-7 linear interpolation, used
//! here for the retention threshold) and
//! [`crate::calibrate::floor_percentile`] (floor-indexed, used by the
//! learn phase). They produce different cut-points for the same input and
//! must not be unified.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{MetricStore, StoreError};
use crate::types::{Alert, RegionLevel, Severity};

/// Rolling window length for the mean-deviation test.
pub const HISTORY_WINDOW: usize = 30;

/// Minimum historical rows before a region is testable.
pub const MIN_HISTORY: usize = 10;

/// Deviation ratio over the trailing mean that triggers an alert.
pub const DEVIATION_RATIO: f64 = 0.20;

// ============================================================================
// Rolling-window test
// ============================================================================

/// Severity score from the deviation ratio: `clamp(round(ratio * 10), 0, 10)`.
fn severity_score(ratio: f64) -> u8 {
    (ratio * 10.0).round().clamp(0.0, 10.0) as u8
}

/// Region-level rolling-window anomaly detector.
pub struct AnomalyDetector {
    store: MetricStore,
}

impl AnomalyDetector {
    pub fn new(store: MetricStore) -> Self {
        Self { store }
    }

    /// Run the rolling-window test for every district and state on `day`.
    /// Returns the number of alerts created.
    pub fn detect_anomalies(&self, day: NaiveDate) -> Result<usize, StoreError> {
        let districts = self.detect_for_level(RegionLevel::District, day)?;
        let states = self.detect_for_level(RegionLevel::State, day)?;
        info!(date = %day, districts, states, "rolling-window detection complete");
        Ok(districts + states)
    }

    /// Each region's test is independent; no cross-region ordering is implied.
    fn detect_for_level(&self, level: RegionLevel, day: NaiveDate) -> Result<usize, StoreError> {
        let mut created = 0;

        for region in self.store.regions_at(level)? {
            let hist =
                self.store
                    .metrics_before(level, &region.code, day, HISTORY_WINDOW)?;
            let Some(today) = self.store.metric_on(level, &region.code, day)? else {
                continue;
            };
            if hist.len() < MIN_HISTORY {
                debug!(code = %region.code, rows = hist.len(), "insufficient history, skipping");
                continue;
            }

            let mean = hist.iter().map(|m| m.radiance).sum::<f64>() / hist.len() as f64;
            // A zero (or negative) trailing mean cannot anchor a ratio test.
            if mean <= 0.0 {
                continue;
            }

            let deviation = today.radiance - mean;
            if deviation > DEVIATION_RATIO * mean {
                let ratio = deviation / mean;
                let now = Utc::now();
                let mut alert = Alert {
                    id: String::new(),
                    level,
                    code: region.code.clone(),
                    message: format!(
                        "{} radiance {:.2} is +{:.2}% vs 30-day mean {:.2}.",
                        capitalize(level),
                        today.radiance,
                        100.0 * ratio,
                        mean
                    ),
                    severity: severity_score(ratio),
                    detected_at: now,
                    created_at: now,
                    sent_at: None,
                    confirmed: false,
                };
                self.store.insert_alert(&mut alert)?;
                created += 1;
            }
        }
        Ok(created)
    }
}

fn capitalize(level: RegionLevel) -> &'static str {
    match level {
        RegionLevel::District => "District",
        RegionLevel::State => "State",
    }
}

// ============================================================================
// Quantile classifier
// ============================================================================

/// A scored point fed to [`detect_hotspots`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub code: String,
    pub value: f64,
}

/// Classifier output: a retained point with its empirical percentile rank
/// and derived severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedHotspot {
    pub code: String,
    pub value: f64,
    /// Empirical percentile rank in `[0, 1]` against the full input set.
    pub percentile: f64,
    pub severity: Severity,
}

/// R-7 quantile: position `(n-1) * q`, linearly interpolated between the
/// two surrounding order statistics. Returns `None` for empty input.
pub fn interpolated_quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let pos = (sorted.len() - 1) as f64 * q;
    let base = pos.floor() as usize;
    let rest = pos - base as f64;
    match sorted.get(base + 1) {
        Some(next) => Some(sorted[base] + rest * (next - sorted[base])),
        None => Some(sorted[base]),
    }
}

/// Empirical percentile rank: the count of values `<= v` among the full
/// sorted set, divided by n, clamped to `[0, 1]`.
///
/// The `<=` counting rule means a single-element input yields rank 1.0
/// for its own value, not 0.
pub fn percentile_rank(sorted_asc: &[f64], v: f64) -> f64 {
    if sorted_asc.is_empty() {
        return 0.0;
    }
    let below_or_equal = sorted_asc.partition_point(|x| *x <= v);
    (below_or_equal as f64 / sorted_asc.len() as f64).clamp(0.0, 1.0)
}

/// Retain the points at or above the `top_quantile` threshold and rank them.
///
/// Severity comes from each point's percentile rank against the *full*
/// value set (not the retained subset): `>= 0.97` extreme, `>= 0.90` high,
/// `>= 0.80` medium, else low. Output is ordered by value descending with
/// equal values keeping their original relative order.
pub fn detect_hotspots(points: &[ScoredPoint], top_quantile: f64) -> Vec<RankedHotspot> {
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let Some(threshold) = interpolated_quantile(&values, top_quantile) else {
        return Vec::new();
    };

    let mut sorted = values;
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut flagged: Vec<RankedHotspot> = points
        .iter()
        .filter(|p| p.value >= threshold)
        .map(|p| {
            let pr = percentile_rank(&sorted, p.value);
            let severity = if pr >= 0.97 {
                Severity::Extreme
            } else if pr >= 0.90 {
                Severity::High
            } else if pr >= 0.80 {
                Severity::Medium
            } else {
                Severity::Low
            };
            RankedHotspot {
                code: p.code.clone(),
                value: p.value,
                percentile: pr,
                severity,
            }
        })
        .collect();

    // Stable sort keeps original relative order for equal values.
    flagged.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(std::cmp::Ordering::Equal));
    flagged
}

/// Default retention quantile for [`detect_hotspots`].
pub const DEFAULT_TOP_QUANTILE: f64 = 0.75;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, DailyMetric, Region};
    use chrono::NaiveDate;

    fn open_temp() -> (MetricStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetricStore::open(dir.path().join("db")).expect("open");
        (store, dir)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("date literal")
    }

    fn seed_district(store: &MetricStore, code: &str) {
        store
            .upsert_region(&Region {
                code: code.into(),
                name: code.into(),
                level: RegionLevel::District,
                parent_code: None,
                bbox: BoundingBox {
                    west: 0.0,
                    south: 0.0,
                    east: 1.0,
                    north: 1.0,
                },
                contact_email: None,
            })
            .expect("seed");
    }

    fn write_history(store: &MetricStore, code: &str, days: u32, radiance: f64) {
        let start = date("2025-05-01");
        for i in 0..days {
            store
                .upsert_daily_metric(
                    RegionLevel::District,
                    &DailyMetric {
                        code: code.into(),
                        date: start + chrono::Duration::days(i64::from(i)),
                        radiance,
                        hotspot_count: 0,
                    },
                )
                .expect("write");
        }
    }

    #[test]
    fn concrete_rolling_case_raises_severity_3() {
        let (store, _dir) = open_temp();
        seed_district(&store, "D1");
        // 30 days at 20.0 before the 31st.
        write_history(&store, "D1", 30, 20.0);
        let day = date("2025-05-31");
        store
            .upsert_daily_metric(
                RegionLevel::District,
                &DailyMetric {
                    code: "D1".into(),
                    date: day,
                    radiance: 25.0,
                    hotspot_count: 0,
                },
            )
            .expect("write");

        let detector = AnomalyDetector::new(store.clone());
        let created = detector.detect_anomalies(day).expect("detect");
        assert_eq!(created, 1);

        let alerts = store.unsent_alerts(10).expect("read");
        let alert = &alerts[0];
        // deviation 5.0 = 25% of mean; (0.25 * 10).round() = 3
        assert_eq!(alert.severity, 3);
        assert_eq!(alert.level, RegionLevel::District);
        assert!(alert.message.contains("25.00"), "message: {}", alert.message);
        assert!(alert.message.contains("+25.00%"), "message: {}", alert.message);
        assert!(alert.message.contains("20.00"), "message: {}", alert.message);
    }

    #[test]
    fn deviation_at_threshold_does_not_alert() {
        let (store, _dir) = open_temp();
        seed_district(&store, "D1");
        write_history(&store, "D1", 30, 20.0);
        let day = date("2025-05-31");
        // Exactly +20%: the test requires strictly greater.
        store
            .upsert_daily_metric(
                RegionLevel::District,
                &DailyMetric {
                    code: "D1".into(),
                    date: day,
                    radiance: 24.0,
                    hotspot_count: 0,
                },
            )
            .expect("write");

        let detector = AnomalyDetector::new(store);
        assert_eq!(detector.detect_anomalies(day).expect("detect"), 0);
    }

    #[test]
    fn zero_mean_never_divides_or_alerts() {
        let (store, _dir) = open_temp();
        seed_district(&store, "D1");
        write_history(&store, "D1", 30, 0.0);
        let day = date("2025-05-31");
        store
            .upsert_daily_metric(
                RegionLevel::District,
                &DailyMetric {
                    code: "D1".into(),
                    date: day,
                    radiance: 1000.0,
                    hotspot_count: 0,
                },
            )
            .expect("write");

        let detector = AnomalyDetector::new(store);
        assert_eq!(detector.detect_anomalies(day).expect("detect"), 0);
    }

    #[test]
    fn insufficient_history_skips_region() {
        let (store, _dir) = open_temp();
        seed_district(&store, "D1");
        write_history(&store, "D1", 9, 20.0);
        let day = date("2025-05-10");
        store
            .upsert_daily_metric(
                RegionLevel::District,
                &DailyMetric {
                    code: "D1".into(),
                    date: day,
                    radiance: 100.0,
                    hotspot_count: 0,
                },
            )
            .expect("write");

        let detector = AnomalyDetector::new(store);
        assert_eq!(detector.detect_anomalies(day).expect("detect"), 0);
    }

    #[test]
    fn missing_today_metric_skips_region() {
        let (store, _dir) = open_temp();
        seed_district(&store, "D1");
        write_history(&store, "D1", 30, 20.0);

        let detector = AnomalyDetector::new(store);
        assert_eq!(
            detector.detect_anomalies(date("2025-07-15")).expect("detect"),
            0
        );
    }

    #[test]
    fn severity_clamps_to_ten() {
        assert_eq!(severity_score(0.25), 3);
        assert_eq!(severity_score(2.0), 10);
        assert_eq!(severity_score(0.0), 0);
    }

    // ----- quantile classifier -----

    fn points(vals: &[(&str, f64)]) -> Vec<ScoredPoint> {
        vals.iter()
            .map(|(c, v)| ScoredPoint {
                code: (*c).into(),
                value: *v,
            })
            .collect()
    }

    #[test]
    fn quantile_boundary_case_from_four_points() {
        // (n-1)*0.75 = 2.25 → 30 + 0.25 * (40 - 30) = 32.5
        let pts = points(&[("A", 10.0), ("B", 20.0), ("C", 30.0), ("D", 40.0)]);
        let ranked = detect_hotspots(&pts, DEFAULT_TOP_QUANTILE);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].code, "D");
        assert_eq!(ranked[0].percentile, 1.0);
        assert_eq!(ranked[0].severity, Severity::Extreme);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(detect_hotspots(&[], DEFAULT_TOP_QUANTILE).is_empty());
    }

    #[test]
    fn single_point_passes_with_rank_one() {
        let ranked = detect_hotspots(&points(&[("A", 5.0)]), DEFAULT_TOP_QUANTILE);
        assert_eq!(ranked.len(), 1);
        // One value <= itself out of one → rank 1.0, not 0.
        assert_eq!(ranked[0].percentile, 1.0);
        assert_eq!(ranked[0].severity, Severity::Extreme);
    }

    #[test]
    fn output_is_value_descending_with_stable_ties() {
        let pts = points(&[("A", 30.0), ("B", 40.0), ("C", 40.0), ("D", 35.0)]);
        let ranked = detect_hotspots(&pts, 0.5);
        let codes: Vec<&str> = ranked.iter().map(|h| h.code.as_str()).collect();
        // B before C: equal values keep input order.
        assert_eq!(codes, vec!["B", "C", "D"]);
    }

    #[test]
    fn percentile_rank_counts_less_or_equal() {
        let sorted = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile_rank(&sorted, 40.0), 1.0);
        assert_eq!(percentile_rank(&sorted, 30.0), 0.75);
        assert_eq!(percentile_rank(&sorted, 5.0), 0.0);
        assert_eq!(percentile_rank(&[], 1.0), 0.0);
    }

    #[test]
    fn interpolated_quantile_matches_r7() {
        let vals = [10.0, 20.0, 30.0, 40.0];
        let q = interpolated_quantile(&vals, 0.75).expect("non-empty");
        assert!((q - 32.5).abs() < 1e-9);
        assert_eq!(interpolated_quantile(&[], 0.75), None);
        assert_eq!(interpolated_quantile(&[7.0], 0.75), Some(7.0));
    }

    #[test]
    fn severity_bands_follow_percentile_rank() {
        // 100 points 1..=100; top quartile retained; ranks are i/100.
        let pts: Vec<ScoredPoint> = (1..=100)
            .map(|i| ScoredPoint {
                code: format!("P{i}"),
                value: f64::from(i),
            })
            .collect();
        let ranked = detect_hotspots(&pts, DEFAULT_TOP_QUANTILE);
        let by_code = |c: &str| {
            ranked
                .iter()
                .find(|h| h.code == c)
                .map(|h| h.severity)
                .expect("retained")
        };
        assert_eq!(by_code("P100"), Severity::Extreme); // rank 1.00
        assert_eq!(by_code("P97"), Severity::Extreme); // rank 0.97
        assert_eq!(by_code("P96"), Severity::High); // rank 0.96
        assert_eq!(by_code("P90"), Severity::High); // rank 0.90
        assert_eq!(by_code("P89"), Severity::Medium); // rank 0.89
        assert_eq!(by_code("P80"), Severity::Medium); // rank 0.80
        assert_eq!(by_code("P79"), Severity::Low); // rank 0.79
    }
}

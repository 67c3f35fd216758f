//! Core domain model shared across the pipeline.
//!
//! Everything persisted by [`crate::store::MetricStore`] lives here:
//! regions and their geometry, per-day radiance metrics, region-level
//! alerts, point-level hotspots, and the append-only agent log.

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// Regions
// ============================================================================

/// Administrative level of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionLevel {
    District,
    State,
}

impl std::fmt::Display for RegionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionLevel::District => write!(f, "district"),
            RegionLevel::State => write!(f, "state"),
        }
    }
}

/// Geographic bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    /// Draw a uniformly distributed point inside the box.
    ///
    /// The generator is injected so hotspot placement is reproducible
    /// under a seeded rng.
    pub fn random_point<R: Rng>(&self, rng: &mut R) -> (f64, f64) {
        let lat = self.south + rng.gen::<f64>() * (self.north - self.south);
        let lng = self.west + rng.gen::<f64>() * (self.east - self.west);
        (lat, lng)
    }
}

/// A district or state. Created once by the geo import; immutable afterwards
/// except for contact metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub code: String,
    pub name: String,
    pub level: RegionLevel,
    /// State code for districts; `None` for states.
    #[serde(default)]
    pub parent_code: Option<String>,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub contact_email: Option<String>,
}

// ============================================================================
// Metrics
// ============================================================================

/// One radiance measurement per (region, day). Re-ingestion of the same key
/// is an idempotent overwrite, never a duplicate insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetric {
    pub code: String,
    pub date: NaiveDate,
    /// Mean radiance over the region, nW/cm²/sr.
    pub radiance: f64,
    pub hotspot_count: u32,
}

// ============================================================================
// Alerts & hotspots
// ============================================================================

/// Region-level anomaly raised by the rolling-window detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: RegionLevel,
    pub code: String,
    pub message: String,
    /// 0..=10, from the deviation ratio.
    pub severity: u8,
    pub detected_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// `None` until the dispatcher confirms a successful send. Flips
    /// exactly once; never reset.
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    /// Set by an external confirmation workflow, not by this pipeline.
    #[serde(default)]
    pub confirmed: bool,
}

/// Discrete anomaly intensity, classified against [`SeverityThresholds`]
/// or an empirical percentile rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Extreme,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Extreme => write!(f, "extreme"),
        }
    }
}

/// Geolocated point-level anomaly raised by the scheduler's reason phase.
/// Distinct from [`Alert`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hotspot {
    pub id: String,
    pub district_code: String,
    pub lat: f64,
    pub lng: f64,
    /// Radiance at detection time, nW/cm²/sr.
    pub brightness: f64,
    /// Change versus the prior period.
    pub delta: f64,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    /// One-way flag, set false→true only after a confirmed send.
    #[serde(default)]
    pub notified: bool,
}

// ============================================================================
// Agent log
// ============================================================================

/// Loop phase or dispatcher component that produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Sense,
    Reason,
    Act,
    Learn,
    Notify,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Sense => write!(f, "sense"),
            Component::Reason => write!(f, "reason"),
            Component::Act => write!(f, "act"),
            Component::Learn => write!(f, "learn"),
            Component::Notify => write!(f, "notify"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
}

/// Append-only audit record. Written exactly once per executed phase;
/// never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub component: Component,
    pub status: LogStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AgentLogEntry {
    pub fn success(component: Component, timestamp: DateTime<Utc>) -> Self {
        Self {
            component,
            status: LogStatus::Success,
            error: None,
            timestamp,
        }
    }

    pub fn error(component: Component, error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            component,
            status: LogStatus::Error,
            error: Some(error.into()),
            timestamp,
        }
    }
}

// ============================================================================
// Severity thresholds
// ============================================================================

/// Four ascending radiance cut-points separating severity bands.
///
/// Initialized with static defaults at startup, replaced wholesale by the
/// learn phase (see [`crate::calibrate`]). Never partially updated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub extreme: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            low: 15.0,
            medium: 20.0,
            high: 25.0,
            extreme: 30.0,
        }
    }
}

impl SeverityThresholds {
    /// Classify a radiance value against the cut-points.
    pub fn classify(&self, radiance: f64) -> Severity {
        if radiance >= self.extreme {
            Severity::Extreme
        } else if radiance >= self.high {
            Severity::High
        } else if radiance >= self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Cut-points must be ascending to classify meaningfully.
    pub fn is_ascending(&self) -> bool {
        self.low <= self.medium && self.medium <= self.high && self.high <= self.extreme
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn default_thresholds_classify_bands() {
        let t = SeverityThresholds::default();
        assert_eq!(t.classify(10.0), Severity::Low);
        assert_eq!(t.classify(20.0), Severity::Medium);
        assert_eq!(t.classify(25.0), Severity::High);
        assert_eq!(t.classify(45.0), Severity::Extreme);
        assert!(t.is_ascending());
    }

    #[test]
    fn random_point_stays_inside_bbox() {
        let bbox = BoundingBox {
            west: 72.0,
            south: 18.0,
            east: 73.0,
            north: 19.5,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let (lat, lng) = bbox.random_point(&mut rng);
            assert!((bbox.south..=bbox.north).contains(&lat));
            assert!((bbox.west..=bbox.east).contains(&lng));
        }
    }

    #[test]
    fn random_point_reproducible_with_same_seed() {
        let bbox = BoundingBox {
            west: 0.0,
            south: 0.0,
            east: 1.0,
            north: 1.0,
        };
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        assert_eq!(bbox.random_point(&mut a), bbox.random_point(&mut b));
    }
}

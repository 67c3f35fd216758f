//! Durable keyed storage for regions, metrics, alerts, hotspots and the
//! agent log, backed by sled.
//!
//! Key layouts are chosen so sled's ordered iteration gives the access
//! patterns the pipeline needs without secondary indexes:
//!
//! - metrics: `code \0 YYYY-MM-DD`: per-region date ranges are contiguous
//!   and chronologically ordered
//! - alerts / hotspots: `millis:020 | code`: whole-tree iteration is
//!   chronological, reverse iteration is newest-first
//! - agent log: monotonic `generate_id()` as big-endian u64
//!
//! Values are JSON. No per-write flush; sled's background flushing is
//! durable enough for data that is regenerated each cycle (at most the
//! last few writes can be lost on crash).

use chrono::NaiveDate;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, error};

use crate::types::{
    AgentLogEntry, Alert, DailyMetric, Hotspot, Region, RegionLevel,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Keyed storage with upsert-by-(region, date) semantics.
///
/// Cheap to clone; all trees share one underlying database handle.
#[derive(Clone)]
pub struct MetricStore {
    db: sled::Db,
    regions: sled::Tree,
    district_metrics: sled::Tree,
    state_metrics: sled::Tree,
    alerts: sled::Tree,
    hotspots: sled::Tree,
    agent_log: sled::Tree,
}

fn metric_key(code: &str, date: NaiveDate) -> Vec<u8> {
    let mut key = Vec::with_capacity(code.len() + 11);
    key.extend_from_slice(code.as_bytes());
    key.push(0);
    key.extend_from_slice(date.format("%Y-%m-%d").to_string().as_bytes());
    key
}

fn record_key(millis: i64, code: &str) -> String {
    format!("{:020}|{}", millis.max(0), code)
}

impl MetricStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            regions: db.open_tree("regions")?,
            district_metrics: db.open_tree("district_metrics")?,
            state_metrics: db.open_tree("state_metrics")?,
            alerts: db.open_tree("alerts")?,
            hotspots: db.open_tree("hotspots")?,
            agent_log: db.open_tree("agent_log")?,
            db,
        })
    }

    fn metric_tree(&self, level: RegionLevel) -> &sled::Tree {
        match level {
            RegionLevel::District => &self.district_metrics,
            RegionLevel::State => &self.state_metrics,
        }
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    pub fn upsert_region(&self, region: &Region) -> Result<(), StoreError> {
        let value = serde_json::to_vec(region)?;
        self.regions.insert(region.code.as_bytes(), value)?;
        Ok(())
    }

    pub fn region(&self, code: &str) -> Result<Option<Region>, StoreError> {
        match self.regions.get(code.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All regions at the given level, in code order.
    pub fn regions_at(&self, level: RegionLevel) -> Result<Vec<Region>, StoreError> {
        let mut out = Vec::new();
        for item in self.regions.iter() {
            let (_key, value) = item?;
            let region: Region = serde_json::from_slice(&value)?;
            if region.level == level {
                out.push(region);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Daily metrics
    // ------------------------------------------------------------------

    /// Idempotent write: the (code, date) key is overwritten, never duplicated.
    pub fn upsert_daily_metric(
        &self,
        level: RegionLevel,
        metric: &DailyMetric,
    ) -> Result<(), StoreError> {
        let key = metric_key(&metric.code, metric.date);
        let value = serde_json::to_vec(metric)?;
        self.metric_tree(level).insert(key, value)?;
        Ok(())
    }

    /// The metric for one region on one day, if any.
    pub fn metric_on(
        &self,
        level: RegionLevel,
        code: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyMetric>, StoreError> {
        match self.metric_tree(level).get(metric_key(code, date))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Up to `limit` metrics for `code` strictly before `day`, newest first.
    pub fn metrics_before(
        &self,
        level: RegionLevel,
        code: &str,
        day: NaiveDate,
        limit: usize,
    ) -> Result<Vec<DailyMetric>, StoreError> {
        let mut prefix = Vec::with_capacity(code.len() + 1);
        prefix.extend_from_slice(code.as_bytes());
        prefix.push(0);
        let end = metric_key(code, day);

        let mut out = Vec::with_capacity(limit);
        for item in self.metric_tree(level).range(prefix..end).rev() {
            if out.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// The most recent `limit` metrics for `code`, newest first.
    pub fn recent_metrics(
        &self,
        level: RegionLevel,
        code: &str,
        limit: usize,
    ) -> Result<Vec<DailyMetric>, StoreError> {
        // \x01 sorts after the \0 separator, covering every date suffix.
        let mut prefix = Vec::with_capacity(code.len() + 1);
        prefix.extend_from_slice(code.as_bytes());
        prefix.push(0);
        let mut end = Vec::with_capacity(code.len() + 1);
        end.extend_from_slice(code.as_bytes());
        end.push(1);

        let mut out = Vec::with_capacity(limit);
        for item in self.metric_tree(level).range(prefix..end).rev() {
            if out.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Every metric recorded for the given date across all regions at a
    /// level, in code order.
    pub fn metrics_on_date(
        &self,
        level: RegionLevel,
        date: NaiveDate,
    ) -> Result<Vec<DailyMetric>, StoreError> {
        let mut out = Vec::new();
        for item in self.metric_tree(level).iter() {
            let (_key, value) = item?;
            let metric: DailyMetric = serde_json::from_slice(&value)?;
            if metric.date == date {
                out.push(metric);
            }
        }
        Ok(out)
    }

    /// Count of metrics for the given date; the ingest fast-path check.
    pub fn count_metrics_on_date(
        &self,
        level: RegionLevel,
        date: NaiveDate,
    ) -> Result<usize, StoreError> {
        Ok(self.metrics_on_date(level, date)?.len())
    }

    /// All radiance values at a level within `[since, until]`, for calibration.
    pub fn radiance_values_between(
        &self,
        level: RegionLevel,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<f64>, StoreError> {
        let mut out = Vec::new();
        for item in self.metric_tree(level).iter() {
            let (_key, value) = item?;
            let metric: DailyMetric = serde_json::from_slice(&value)?;
            if metric.date >= since && metric.date <= until {
                out.push(metric.radiance);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Insert a new alert. The caller-visible `id` is derived from
    /// (detected_at, code) so whole-tree order is chronological.
    pub fn insert_alert(&self, alert: &mut Alert) -> Result<(), StoreError> {
        let key = record_key(alert.detected_at.timestamp_millis(), &alert.code);
        alert.id = key.clone();
        let value = serde_json::to_vec(&*alert)?;
        self.alerts.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Up to `limit` alerts with `sent_at == None`, newest detection first.
    pub fn unsent_alerts(&self, limit: usize) -> Result<Vec<Alert>, StoreError> {
        let mut out = Vec::new();
        for item in self.alerts.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            let alert: Alert = serde_json::from_slice(&value)?;
            if alert.sent_at.is_none() {
                out.push(alert);
            }
        }
        Ok(out)
    }

    /// Flip `sent_at` from `None` to the given timestamp. A second call for
    /// the same alert is rejected so the flag can never regress or repeat.
    pub fn mark_alert_sent(
        &self,
        id: &str,
        sent_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        let value = self
            .alerts
            .get(id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("alert {id}")))?;
        let mut alert: Alert = serde_json::from_slice(&value)?;
        if alert.sent_at.is_some() {
            debug!(id = %id, "alert already marked sent, ignoring");
            return Ok(());
        }
        alert.sent_at = Some(sent_at);
        self.alerts.insert(id.as_bytes(), serde_json::to_vec(&alert)?)?;
        Ok(())
    }

    pub fn alert(&self, id: &str) -> Result<Option<Alert>, StoreError> {
        match self.alerts.get(id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.len()
    }

    // ------------------------------------------------------------------
    // Hotspots
    // ------------------------------------------------------------------

    pub fn insert_hotspot(&self, hotspot: &mut Hotspot) -> Result<(), StoreError> {
        let millis = hotspot.detected_at.timestamp_millis();
        // generate_id disambiguates multiple hotspots for one district
        // detected in the same millisecond.
        let seq = self.db.generate_id()?;
        let key = format!("{}|{:06}", record_key(millis, &hotspot.district_code), seq);
        hotspot.id = key.clone();
        let value = serde_json::to_vec(&*hotspot)?;
        self.hotspots.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// All hotspots with `notified == false`, newest first.
    pub fn unnotified_hotspots(&self, limit: usize) -> Result<Vec<Hotspot>, StoreError> {
        let mut out = Vec::new();
        for item in self.hotspots.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            let hotspot: Hotspot = serde_json::from_slice(&value)?;
            if !hotspot.notified {
                out.push(hotspot);
            }
        }
        Ok(out)
    }

    /// Flip `notified` false→true. One-way; repeat calls are no-ops.
    pub fn mark_hotspot_notified(&self, id: &str) -> Result<(), StoreError> {
        let value = self
            .hotspots
            .get(id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("hotspot {id}")))?;
        let mut hotspot: Hotspot = serde_json::from_slice(&value)?;
        if hotspot.notified {
            debug!(id = %id, "hotspot already notified, ignoring");
            return Ok(());
        }
        hotspot.notified = true;
        self.hotspots
            .insert(id.as_bytes(), serde_json::to_vec(&hotspot)?)?;
        Ok(())
    }

    pub fn hotspot(&self, id: &str) -> Result<Option<Hotspot>, StoreError> {
        match self.hotspots.get(id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn hotspot_count(&self) -> usize {
        self.hotspots.len()
    }

    // ------------------------------------------------------------------
    // Agent log (AuditSink)
    // ------------------------------------------------------------------

    /// Append an audit entry. Fire-and-forget: a failing sink must never
    /// feed an error back into the phase that is logging, so failures are
    /// logged here and swallowed.
    pub fn append_log(&self, entry: &AgentLogEntry) {
        let result = (|| -> Result<(), StoreError> {
            let id = self.db.generate_id()?;
            let value = serde_json::to_vec(entry)?;
            self.agent_log.insert(id.to_be_bytes(), value)?;
            Ok(())
        })();
        if let Err(e) = result {
            error!(component = %entry.component, error = %e, "failed to append agent log entry");
        }
    }

    /// The most recent `limit` audit entries, newest first.
    pub fn recent_log(&self, limit: usize) -> Result<Vec<AgentLogEntry>, StoreError> {
        let mut out = Vec::with_capacity(limit);
        for item in self.agent_log.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    pub fn log_count(&self) -> usize {
        self.agent_log.len()
    }
}

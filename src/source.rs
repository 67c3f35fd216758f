//! Tile summary acquisition.
//!
//! A tile summary is a scalar `{radiance, hotspot_count}` aggregate over a
//! region's bounding box for one day. Two acquisition paths exist:
//!
//! - the deterministic simulated path ([`simulated_radiance`]), a pure
//!   function of `(code, date)` used whenever no live source is configured
//! - [`LiveTileSource`], a thin HTTP client over a tile summary service,
//!   which may fail per-tile (transient) and refuses to start without
//!   credentials (configuration)
//!
//! The geoprocessing behind the live service (tile download, mosaicing,
//! cutline statistics) is the service's concern, not ours.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::types::BoundingBox;

/// Scalar summary for one region and one day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileSummary {
    /// Mean radiance, nW/cm²/sr.
    pub radiance: f64,
    pub hotspot_count: u32,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// Tile summary temporarily unavailable: skip the region, continue
    /// the batch.
    #[error("tile summary unavailable: {0}")]
    Transient(String),

    /// Missing or unusable live-source credentials; callers fall back to
    /// the simulated path rather than crash.
    #[error("tile source misconfigured: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::Transient(err.to_string())
    }
}

/// Synchronous-request-shaped source of tile summaries.
#[async_trait]
pub trait TileSummarySource: Send + Sync {
    async fn fetch(&self, bbox: &BoundingBox, date: NaiveDate) -> Result<TileSummary, SourceError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Simulated path
// ============================================================================

/// Deterministic pseudo-random radiance in `14.0..37.0`.
///
/// Pure function of `(code, date_iso)`: a djb2-style hash of
/// `"{code}|{date}"` reduced mod 1_000_003, then mapped into the plausible
/// night-light band. Same inputs always produce the same output, which is
/// what makes re-ingestion and tests reproducible.
pub fn simulated_radiance(code: &str, date_iso: &str) -> f64 {
    let mut h: u64 = 0;
    for b in code.bytes().chain(std::iter::once(b'|')).chain(date_iso.bytes()) {
        h = (h * 33 + u64::from(b)) % 1_000_003;
    }
    14.0 + (h % 23) as f64
}

/// Simulated summary for one region-day, pairing [`simulated_radiance`]
/// with the derived hotspot count used by the aggregator.
pub fn simulated_summary(code: &str, date: NaiveDate) -> TileSummary {
    let radiance = simulated_radiance(code, &date.format("%Y-%m-%d").to_string());
    TileSummary {
        radiance,
        hotspot_count: crate::ingest::hotspot_count_for(radiance),
    }
}

// ============================================================================
// Live path
// ============================================================================

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    radiance: f64,
    hotspot_count: u32,
}

/// HTTP client for a live tile summary service.
///
/// Construction fails without `EARTHDATA_USERNAME` / `EARTHDATA_PASSWORD`
/// in the environment; the caller is expected to treat that as "use the
/// simulated path", never as a hard failure.
pub struct LiveTileSource {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl LiveTileSource {
    pub fn from_env(endpoint: &str) -> Result<Self, SourceError> {
        let username = std::env::var("EARTHDATA_USERNAME")
            .map_err(|_| SourceError::Configuration("EARTHDATA_USERNAME not set".into()))?;
        let password = std::env::var("EARTHDATA_PASSWORD")
            .map_err(|_| SourceError::Configuration("EARTHDATA_PASSWORD not set".into()))?;

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username,
            password,
        })
    }
}

#[async_trait]
impl TileSummarySource for LiveTileSource {
    async fn fetch(&self, bbox: &BoundingBox, date: NaiveDate) -> Result<TileSummary, SourceError> {
        let url = format!("{}/summary", self.endpoint);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("west", bbox.west.to_string()),
                ("south", bbox.south.to_string()),
                ("east", bbox.east.to_string()),
                ("north", bbox.north.to_string()),
                ("date", date.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await?;

        match resp.status() {
            reqwest::StatusCode::OK => {
                let body: SummaryResponse = resp.json().await?;
                debug!(radiance = body.radiance, "live tile summary fetched");
                Ok(TileSummary {
                    radiance: body.radiance,
                    hotspot_count: body.hotspot_count,
                })
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => Err(
                SourceError::Configuration("tile service rejected credentials".into()),
            ),
            status => Err(SourceError::Transient(format!(
                "tile service returned {status}"
            ))),
        }
    }

    fn name(&self) -> &str {
        "live"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_radiance_is_deterministic() {
        let a = simulated_radiance("MH-MUM", "2025-06-01");
        let b = simulated_radiance("MH-MUM", "2025-06-01");
        assert_eq!(a, b);
    }

    #[test]
    fn simulated_radiance_varies_by_code_and_date() {
        let base = simulated_radiance("MH-MUM", "2025-06-01");
        let other_code = simulated_radiance("KA-BLR", "2025-06-01");
        let other_date = simulated_radiance("MH-MUM", "2025-06-02");
        // Not guaranteed distinct for every pair, but these known inputs differ.
        assert!(base != other_code || base != other_date);
    }

    #[test]
    fn simulated_radiance_stays_in_band() {
        for day in 1..=28 {
            let iso = format!("2025-02-{day:02}");
            let r = simulated_radiance("UP-GZB", &iso);
            assert!((14.0..37.0).contains(&r), "out of band: {r}");
        }
    }
}

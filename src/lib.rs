//! skyglow: Night-Light Radiance Monitoring
//!
//! Autonomous pipeline that watches satellite night-light radiance over
//! administrative regions, detects anomalous brightening, and notifies
//! regional contacts.
//!
//! ## Architecture
//!
//! - **Aggregator**: daily per-district tile summary ingestion with
//!   state-level rollups
//! - **AnomalyDetector**: rolling-window deviation test plus a quantile
//!   hotspot classifier
//! - **LoopScheduler**: the sense → reason → act → learn cycle with
//!   per-phase intervals and audit logging
//! - **NotificationDispatcher**: batch alert/hotspot delivery over a
//!   primary → fallback transport chain
//! - **Calibration**: percentile-derived severity thresholds, swapped
//!   atomically by the learn phase

pub mod agent;
pub mod calibrate;
pub mod config;
pub mod detect;
pub mod ingest;
pub mod notify;
pub mod source;
pub mod store;
pub mod types;

// Re-export configuration
pub use config::SkyglowConfig;

// Re-export commonly used types
pub use types::{
    Alert, AgentLogEntry, BoundingBox, Component, DailyMetric, Hotspot, LogStatus, Region,
    RegionLevel, Severity, SeverityThresholds,
};

// Re-export pipeline stages
pub use agent::{Clock, LoopScheduler, ManualClock, Phase, PhaseOutcome, SystemClock};
pub use calibrate::{recalibrate, LiveThresholds};
pub use detect::{detect_hotspots, AnomalyDetector, RankedHotspot, ScoredPoint};
pub use ingest::{hotspot_count_for, Aggregator, IngestSummary};
pub use notify::{
    DeliveryError, HttpRelayTransport, JsonFileTransport, Mailer, MailTransport,
    NotificationDispatcher,
};
pub use source::{simulated_radiance, LiveTileSource, TileSummary, TileSummarySource};
pub use store::{MetricStore, StoreError};

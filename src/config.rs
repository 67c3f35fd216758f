//! Deployment configuration loaded from TOML.
//!
//! Every tunable the pipeline uses is a field here. Each section implements
//! `Default` with the built-in constants, so behavior is unchanged when no
//! config file is present.
//!
//! ## Loading Order
//!
//! 1. `SKYGLOW_CONFIG` environment variable (path to TOML file)
//! 2. `skyglow.toml` in the current working directory
//! 3. Built-in defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a skyglow deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkyglowConfig {
    #[serde(default)]
    pub data: DataConfig,

    /// Loop scheduler intervals and reason-phase thresholds
    #[serde(default)]
    pub agent: AgentConfig,

    /// Notification dispatch and mail transports
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Live tile summary source (simulated when disabled)
    #[serde(default)]
    pub source: SourceConfig,
}

impl SkyglowConfig {
    /// Load configuration using the standard search order:
    /// 1. `$SKYGLOW_CONFIG` environment variable
    /// 2. `./skyglow.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SKYGLOW_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from SKYGLOW_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from SKYGLOW_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "SKYGLOW_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("skyglow.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./skyglow.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./skyglow.toml, using defaults");
                }
            }
        }

        info!("No skyglow.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a working pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.brightness_threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "agent.brightness_threshold must be non-negative".into(),
            ));
        }
        if self.notify.batch_limit == 0 {
            return Err(ConfigError::Invalid(
                "notify.batch_limit must be at least 1".into(),
            ));
        }
        if self.agent.phase_deadline_secs == 0 {
            return Err(ConfigError::Invalid(
                "agent.phase_deadline_secs must be at least 1".into(),
            ));
        }
        if self.source.live && self.source.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "source.endpoint is required when source.live = true".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Path to the sled database directory
    pub db_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/skyglow_db"),
        }
    }
}

/// Intervals (minutes) for the four loop phases, plus the reason-phase
/// hotspot trigger thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Minutes between tile summary ingests
    pub sense_interval_mins: i64,
    /// Minutes between hotspot detection runs
    pub reason_interval_mins: i64,
    /// Minutes between notification checks
    pub act_interval_mins: i64,
    /// Minutes between threshold recalibrations
    pub learn_interval_mins: i64,
    /// Hard deadline for a single phase execution (seconds)
    pub phase_deadline_secs: u64,
    /// Minimum radiance (nW/cm²/sr) for a hotspot
    pub brightness_threshold: f64,
    /// Minimum period-over-period radiance change for a hotspot
    pub delta_threshold: f64,
    /// Days of history fed to the learn-phase recalibration
    pub learn_window_days: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sense_interval_mins: 60,
            reason_interval_mins: 15,
            act_interval_mins: 30,
            learn_interval_mins: 360,
            phase_deadline_secs: 300,
            brightness_threshold: 15.0,
            delta_threshold: 5.0,
            learn_window_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Mail relay API base URL; when unset, only the JSON drop transport is used
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Relay API key
    #[serde(default)]
    pub relay_api_key: Option<String>,
    /// From address stamped on outgoing messages
    pub from_email: String,
    /// Fallback recipient for alerts on regions without a contact address
    pub operator_email: String,
    /// Drop directory for the JSON file transport
    pub drop_dir: PathBuf,
    /// Maximum unsent records processed per dispatch run
    pub batch_limit: usize,
    /// Delay between consecutive sends, applied regardless of outcome
    pub inter_send_delay_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            relay_api_key: None,
            from_email: "skyglow@localhost".into(),
            operator_email: "operator@localhost".into(),
            drop_dir: PathBuf::from("data/outbox"),
            batch_limit: 50,
            inter_send_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Use the live tile summary service instead of simulated values
    pub live: bool,
    /// Live service base URL
    #[serde(default)]
    pub endpoint: Option<String>,
}

//! The sense → reason → act → learn loop.
//!
//! Each cycle walks the four phases in a fixed order. A phase executes
//! only when its interval has elapsed since its last *successful* run;
//! below-interval phases are skipped silently. Every executed phase writes
//! exactly one audit entry, success or failure, and only success advances
//! the phase's clock, so a failed phase is retried on the very next cycle
//! instead of waiting out a full interval.
//!
//! Time and randomness are injected ([`Clock`], the seeded rng) so cycles
//! are fully reproducible in tests.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::calibrate::{recalibrate, LiveThresholds};
use crate::config::AgentConfig;
use crate::ingest::Aggregator;
use crate::notify::NotificationDispatcher;
use crate::store::{MetricStore, StoreError};
use crate::types::{AgentLogEntry, Component, Hotspot, RegionLevel};

// ============================================================================
// Clock
// ============================================================================

/// Source of "now", injected so interval gating is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ============================================================================
// Phases
// ============================================================================

/// The four loop phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Sense,
    Reason,
    Act,
    Learn,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [Phase::Sense, Phase::Reason, Phase::Act, Phase::Learn];

    fn component(self) -> Component {
        match self {
            Phase::Sense => Component::Sense,
            Phase::Reason => Component::Reason,
            Phase::Act => Component::Act,
            Phase::Learn => Component::Learn,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.component(), f)
    }
}

/// What happened to a phase during one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Interval not yet elapsed; nothing executed, nothing logged.
    Skipped,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("phase exceeded its {0}s deadline")]
    Deadline(u64),

    #[error("{0}")]
    Other(String),
}

/// Last successful completion per phase, for the status command.
#[derive(Debug, Clone, Default)]
pub struct LoopStatus {
    pub sense: Option<DateTime<Utc>>,
    pub reason: Option<DateTime<Utc>>,
    pub act: Option<DateTime<Utc>>,
    pub learn: Option<DateTime<Utc>>,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Drives the sense → reason → act → learn cycle.
pub struct LoopScheduler {
    store: MetricStore,
    aggregator: Aggregator,
    dispatcher: NotificationDispatcher,
    thresholds: LiveThresholds,
    config: AgentConfig,
    clock: Box<dyn Clock>,
    rng: StdRng,
    last_run: HashMap<Phase, DateTime<Utc>>,
}

impl LoopScheduler {
    pub fn new(
        store: MetricStore,
        aggregator: Aggregator,
        dispatcher: NotificationDispatcher,
        thresholds: LiveThresholds,
        config: AgentConfig,
    ) -> Self {
        Self::with_clock_and_rng(
            store,
            aggregator,
            dispatcher,
            thresholds,
            config,
            Box::new(SystemClock),
            StdRng::from_entropy(),
        )
    }

    pub fn with_clock_and_rng(
        store: MetricStore,
        aggregator: Aggregator,
        dispatcher: NotificationDispatcher,
        thresholds: LiveThresholds,
        config: AgentConfig,
        clock: Box<dyn Clock>,
        rng: StdRng,
    ) -> Self {
        // Epoch sentinel: every phase is due on the first cycle.
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now);
        let last_run = Phase::ORDER.iter().map(|p| (*p, epoch)).collect();
        Self {
            store,
            aggregator,
            dispatcher,
            thresholds,
            config,
            clock,
            rng,
            last_run,
        }
    }

    fn interval_mins(&self, phase: Phase) -> i64 {
        match phase {
            Phase::Sense => self.config.sense_interval_mins,
            Phase::Reason => self.config.reason_interval_mins,
            Phase::Act => self.config.act_interval_mins,
            Phase::Learn => self.config.learn_interval_mins,
        }
    }

    /// Run one full cycle: every phase in order, each gated on its own
    /// interval. Returns what happened to each phase.
    pub async fn run_cycle(&mut self) -> Vec<(Phase, PhaseOutcome)> {
        let mut outcomes = Vec::with_capacity(Phase::ORDER.len());
        for phase in Phase::ORDER {
            let outcome = self.tick_phase(phase).await;
            outcomes.push((phase, outcome));
        }
        outcomes
    }

    /// Run cycles until cancellation, pausing `tick` between them.
    pub async fn run(&mut self, cancel: &CancellationToken, tick: Duration) {
        info!(
            sense_mins = self.config.sense_interval_mins,
            reason_mins = self.config.reason_interval_mins,
            act_mins = self.config.act_interval_mins,
            learn_mins = self.config.learn_interval_mins,
            "agent loop started"
        );
        loop {
            self.run_cycle().await;
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("agent loop stopping");
                    return;
                }
                () = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// Gate, execute under deadline, audit, and advance the phase clock.
    async fn tick_phase(&mut self, phase: Phase) -> PhaseOutcome {
        let now = self.clock.now();
        let due_at = self.last_run[&phase] + ChronoDuration::minutes(self.interval_mins(phase));
        if now < due_at {
            return PhaseOutcome::Skipped;
        }

        let deadline = Duration::from_secs(self.config.phase_deadline_secs);
        let result = match tokio::time::timeout(deadline, self.execute(phase)).await {
            Ok(r) => r,
            Err(_elapsed) => Err(PhaseError::Deadline(self.config.phase_deadline_secs)),
        };

        let logged_at = self.clock.now();
        match result {
            Ok(()) => {
                self.store
                    .append_log(&AgentLogEntry::success(phase.component(), logged_at));
                self.last_run.insert(phase, now);
                PhaseOutcome::Succeeded
            }
            Err(e) => {
                // last_run stays put: the phase is due again next cycle.
                error!(phase = %phase, error = %e, "phase failed, will retry next cycle");
                self.store.append_log(&AgentLogEntry::error(
                    phase.component(),
                    e.to_string(),
                    logged_at,
                ));
                PhaseOutcome::Failed(e.to_string())
            }
        }
    }

    async fn execute(&mut self, phase: Phase) -> Result<(), PhaseError> {
        match phase {
            Phase::Sense => self.sense().await,
            Phase::Reason => self.reason(),
            Phase::Act => self.act().await,
            Phase::Learn => self.learn(),
        }
    }

    /// Ingest today's tile summaries.
    async fn sense(&mut self) -> Result<(), PhaseError> {
        let today = self.clock.now().date_naive();
        let summary = self.aggregator.ingest(today).await?;
        if !summary.success {
            return Err(PhaseError::Other(
                "no districts available to ingest".into(),
            ));
        }
        Ok(())
    }

    /// Compare each district's two most recent days; a bright and rising
    /// reading becomes a geolocated hotspot somewhere in the district.
    fn reason(&mut self) -> Result<(), PhaseError> {
        let districts = self.store.regions_at(RegionLevel::District)?;
        let thresholds = self.thresholds.current();
        let now = self.clock.now();
        let mut raised = 0;

        for district in &districts {
            let recent = self
                .store
                .recent_metrics(RegionLevel::District, &district.code, 2)?;
            let [current, previous] = recent.as_slice() else {
                continue;
            };

            let delta = current.radiance - previous.radiance;
            if current.radiance > self.config.brightness_threshold
                && delta > self.config.delta_threshold
            {
                let (lat, lng) = district.bbox.random_point(&mut self.rng);
                let mut hotspot = Hotspot {
                    id: String::new(),
                    district_code: district.code.clone(),
                    lat,
                    lng,
                    brightness: current.radiance,
                    delta,
                    severity: thresholds.classify(current.radiance),
                    detected_at: now,
                    notified: false,
                };
                self.store.insert_hotspot(&mut hotspot)?;
                raised += 1;
            }
        }

        if raised > 0 {
            info!(raised, "reason phase raised hotspots");
        }
        Ok(())
    }

    /// Deliver notifications for hotspots raised by the reason phase.
    async fn act(&mut self) -> Result<(), PhaseError> {
        let summary = self.dispatcher.notify_hotspots().await?;
        if summary.failure_count > 0 {
            warn!(
                failed = summary.failure_count,
                "act phase had delivery failures"
            );
        }
        Ok(())
    }

    /// Recalibrate severity cut-points from the trailing radiance window.
    /// An empty window leaves the current thresholds in place.
    fn learn(&mut self) -> Result<(), PhaseError> {
        let until = self.clock.now().date_naive();
        let since = until - ChronoDuration::days(self.config.learn_window_days);
        let values = self
            .store
            .radiance_values_between(RegionLevel::District, since, until)?;

        match recalibrate(&values) {
            Some(next) => self.thresholds.replace(next),
            None => info!("no radiance history in window, thresholds unchanged"),
        }
        Ok(())
    }

    /// Last successful completion per phase. Epoch sentinels read as "never".
    pub fn status(&self) -> LoopStatus {
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now);
        let get = |phase: Phase| {
            self.last_run
                .get(&phase)
                .copied()
                .filter(|t| *t > epoch)
        };
        LoopStatus {
            sense: get(Phase::Sense),
            reason: get(Phase::Reason),
            act: get(Phase::Act),
            learn: get(Phase::Learn),
        }
    }
}

//! Four-channel affect state that modulates how broadly the deep path reads
//! session history.
//!
//! | channel | meaning          |
//! |---------|------------------|
//! | D       | drive            |
//! | O       | novelty-seeking  |
//! | S       | stability        |
//! | E       | relief           |
//!
//! Every value lives in `[0, 1]`. Heartbeats pull the state toward a
//! baseline; event severity and idle time push it away.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use vigil_config::schema::{AffectConfig, LifeStage};
use vigil_core::{Result, Severity, jsonl};

/// Most an idle stretch can move O or D in a single call.
const IDLE_STEP_CAP: f64 = 0.1;
/// Idle drift per minute.
const IDLE_PER_MINUTE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AffectChannel {
    Drive,
    Novelty,
    Stability,
    Relief,
}

impl AffectChannel {
    pub const ALL: [AffectChannel; 4] = [
        AffectChannel::Drive,
        AffectChannel::Novelty,
        AffectChannel::Stability,
        AffectChannel::Relief,
    ];

    fn index(self) -> usize {
        match self {
            AffectChannel::Drive => 0,
            AffectChannel::Novelty => 1,
            AffectChannel::Stability => 2,
            AffectChannel::Relief => 3,
        }
    }
}

/// A persisted point-in-time reading. One per line in `affect.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffectSnapshot {
    pub drive: f64,
    pub novelty: f64,
    pub stability: f64,
    pub relief: f64,
    pub taken_at: DateTime<Utc>,
}

impl AffectSnapshot {
    fn values(&self) -> [f64; 4] {
        [self.drive, self.novelty, self.stability, self.relief]
    }
}

impl std::fmt::Display for AffectSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "D {:.2} O {:.2} S {:.2} E {:.2}",
            self.drive, self.novelty, self.stability, self.relief
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AffectState {
    values: [f64; 4],
    baseline: [f64; 4],
}

impl AffectState {
    /// Start at the baseline.
    pub fn new(baseline: [f64; 4]) -> Self {
        let baseline = baseline.map(clamp_unit);
        Self {
            values: baseline,
            baseline,
        }
    }

    /// Baseline from config, scaled by the life stage.
    pub fn from_config(config: &AffectConfig, stage: LifeStage) -> Self {
        let configured = config.baseline.as_array();
        let multipliers = stage.baseline_multipliers();
        let mut baseline = [0.0; 4];
        for i in 0..4 {
            baseline[i] = configured[i] * multipliers[i];
        }
        Self::new(baseline)
    }

    /// Restore the latest snapshot from `path`. Files left with several lines
    /// are compacted to that one. A missing or unreadable file leaves the state at baseline.
    pub fn load(path: &Path, config: &AffectConfig, stage: LifeStage) -> Result<Self> {
        let mut state = Self::from_config(config, stage);
        let snapshots: Vec<AffectSnapshot> = jsonl::read_all(path)?;
        if let Some(last) = snapshots.last() {
            state.restore(last);
            if snapshots.len() > 1
                && let Err(e) = jsonl::rewrite(path, std::slice::from_ref(last))
            {
                warn!(path = %path.display(), error = %e, "failed to compact affect log");
            }
            debug!(snapshot = %last, "affect restored");
        }
        Ok(state)
    }

    /// Replace the snapshot stored at `path` with the current one.
    pub fn persist(&self, path: &Path) -> Result<()> {
        jsonl::rewrite(path, &[self.snapshot()])
    }

    /// Adopt a new baseline after a config change. Current values are kept
    /// and drift toward the new baseline on later decays.
    pub fn rebase(&mut self, config: &AffectConfig, stage: LifeStage) {
        self.baseline = Self::from_config(config, stage).baseline;
    }

    pub fn restore(&mut self, snapshot: &AffectSnapshot) {
        self.values = snapshot.values().map(clamp_unit);
    }

    pub fn get(&self, channel: AffectChannel) -> f64 {
        self.values[channel.index()]
    }

    pub fn baseline(&self, channel: AffectChannel) -> f64 {
        self.baseline[channel.index()]
    }

    /// Move every channel `rate` of the way to its baseline.
    pub fn decay(&mut self, rate: f64) {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        for i in 0..4 {
            let x = self.values[i];
            self.values[i] = clamp_unit(x + (self.baseline[i] - x) * rate);
        }
    }

    pub fn nudge(&mut self, channel: AffectChannel, delta: f64) {
        if !delta.is_finite() {
            return;
        }
        let i = channel.index();
        self.values[i] = clamp_unit(self.values[i] + delta);
    }

    pub fn apply_severity(&mut self, severity: Severity) {
        match severity {
            Severity::High => {
                self.nudge(AffectChannel::Drive, 0.15);
                self.nudge(AffectChannel::Stability, -0.10);
            }
            Severity::Normal => self.nudge(AffectChannel::Drive, 0.03),
            Severity::Low => self.nudge(AffectChannel::Relief, 0.05),
        }
    }

    /// Quiet time makes the agent curious and less driven.
    pub fn idle(&mut self, elapsed: Duration) {
        let minutes = elapsed.as_secs_f64() / 60.0;
        let step = (minutes * IDLE_PER_MINUTE).min(IDLE_STEP_CAP);
        self.nudge(AffectChannel::Novelty, step);
        self.nudge(AffectChannel::Drive, -step);
    }

    /// Multiplier for deep-path context breadth, in `[0.5, 2.0]`.
    ///
    /// Low stability and high novelty widen the window; high drive narrows it.
    pub fn context_factor(&self) -> f64 {
        let d = self.get(AffectChannel::Drive);
        let o = self.get(AffectChannel::Novelty);
        let s = self.get(AffectChannel::Stability);
        let factor = 1.0 + (0.5 - s).max(0.0) + (o - 0.5).max(0.0) - (d - 0.5).max(0.0);
        factor.clamp(0.5, 2.0)
    }

    /// `base` scaled by [`Self::context_factor`], never below one.
    pub fn scale(&self, base: usize) -> usize {
        ((base as f64) * self.context_factor()).round().max(1.0) as usize
    }

    pub fn snapshot(&self) -> AffectSnapshot {
        AffectSnapshot {
            drive: self.values[0],
            novelty: self.values[1],
            stability: self.values[2],
            relief: self.values[3],
            taken_at: Utc::now(),
        }
    }
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}

//! PID signal extraction from iteration outcomes.
//!
//! The error signal is "distance from done": incomplete work, low quality
//! and errors all add to it. From the stream of per-iteration errors the
//! collector derives the three classic terms:
//!
//! | Term | Meaning | Computation |
//! |------|---------|-------------|
//! | P | how far from done right now | weighted error, deadband-snapped |
//! | I | accumulated unresolved difficulty | leaky sum, blockers add, learnings relieve |
//! | D | is the error growing or shrinking | recency-weighted mean of recent deltas |
//!
//! A positive derivative means the error is **increasing** (regression).

use std::collections::{BTreeSet, VecDeque};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// Input
// ============================================================================

/// What one iteration produced, as reported by the session launcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationOutcome {
    /// Fraction of the completion criteria satisfied, in `[0, 1]`.
    pub completion: f64,
    /// Quality score of the produced work, in `[0, 1]`.
    pub quality: f64,
    /// Errors hit during the iteration.
    #[serde(default)]
    pub errors: Vec<String>,
    /// New insights recorded during the iteration.
    #[serde(default)]
    pub learnings: Vec<String>,
    /// Things preventing progress.
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub duration: Duration,
    /// Pid of the session that ran the iteration.
    #[serde(default)]
    pub pid: Option<u32>,
}

impl IterationOutcome {
    #[must_use]
    pub fn new(completion: f64, quality: f64) -> Self {
        Self {
            completion,
            quality,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    #[must_use]
    pub fn with_blockers(mut self, blockers: Vec<String>) -> Self {
        self.blockers = blockers;
        self
    }

    #[must_use]
    pub fn with_learnings(mut self, learnings: Vec<String>) -> Self {
        self.learnings = learnings;
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tuning for the P, I and D computations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    /// P below this snaps to zero.
    pub deadband: f64,
    /// Weight of `1 - quality` in P.
    pub quality_penalty: f64,
    /// Contribution of each error to P.
    pub error_penalty: f64,
    /// Cap on the total error contribution to P.
    pub error_penalty_cap: f64,

    /// Per-iteration retention factor of the integral.
    pub integral_decay: f64,
    pub integral_min: f64,
    pub integral_max: f64,
    /// Added to I per blocker seen in an earlier iteration.
    pub blocker_bonus: f64,
    /// Subtracted from I per learning.
    pub learning_relief: f64,

    /// Number of recent P deltas averaged into D.
    pub derivative_window: usize,
    /// |D| below this snaps to zero.
    pub derivative_deadband: f64,
    /// Retained history length.
    pub history_length: usize,

    /// Mean error reduction per iteration that counts as a trend.
    pub trend_velocity_threshold: f64,
    /// Deltas smaller than this are ignored when counting oscillations.
    pub oscillation_floor: f64,
    /// Sign alternations that make a trend oscillating.
    pub oscillation_alternations: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            deadband: 0.05,
            quality_penalty: 0.2,
            error_penalty: 0.05,
            error_penalty_cap: 0.3,
            integral_decay: 0.9,
            integral_min: -1.0,
            integral_max: 5.0,
            blocker_bonus: 0.1,
            learning_relief: 0.05,
            derivative_window: 5,
            derivative_deadband: 0.01,
            history_length: 20,
            trend_velocity_threshold: 0.02,
            oscillation_floor: 0.05,
            oscillation_alternations: 3,
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.integral_decay) {
            return Err(format!(
                "control.metrics.integralDecay must be in [0, 1], got {}",
                self.integral_decay
            ));
        }
        if self.integral_min > self.integral_max {
            return Err("control.metrics.integralMin exceeds integralMax".to_string());
        }
        if self.derivative_window == 0 {
            return Err("control.metrics.derivativeWindow must be at least 1".to_string());
        }
        if self.history_length <= self.derivative_window {
            return Err("control.metrics.historyLength must exceed derivativeWindow".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Output
// ============================================================================

/// The three control terms for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidMetrics {
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub timestamp: DateTime<Utc>,
}

/// Direction of the error over the recent window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Regressing,
    Oscillating,
    Stable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Improving => write!(f, "improving"),
            Self::Regressing => write!(f, "regressing"),
            Self::Oscillating => write!(f, "oscillating"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

/// Serializable collector state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsState {
    pub integral: f64,
    pub proportional_history: VecDeque<f64>,
    pub derivative_history: VecDeque<f64>,
    pub quality_history: VecDeque<f64>,
    /// Normalized blocker signatures per iteration, for the retained window.
    #[serde(default)]
    pub blocker_history: VecDeque<BTreeSet<String>>,
    pub last: Option<PidMetrics>,
    pub samples: u64,
}

// ============================================================================
// Collector
// ============================================================================

/// Turns iteration outcomes into [`PidMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    config: MetricsConfig,
    state: MetricsState,
}

impl MetricsCollector {
    #[must_use]
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            state: MetricsState::default(),
        }
    }

    /// Resume from a saved state.
    #[must_use]
    pub fn from_state(config: MetricsConfig, state: MetricsState) -> Self {
        Self { config, state }
    }

    #[must_use]
    pub fn state(&self) -> &MetricsState {
        &self.state
    }

    #[must_use]
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    #[must_use]
    pub fn last(&self) -> Option<PidMetrics> {
        self.state.last
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.state = MetricsState::default();
    }

    /// Fold one outcome into the signals.
    pub fn update(&mut self, outcome: &IterationOutcome) -> PidMetrics {
        let proportional = self.proportional(outcome);
        let integral = self.integral(outcome, proportional);

        push_bounded(
            &mut self.state.proportional_history,
            proportional,
            self.config.history_length,
        );
        let derivative = self.derivative();
        push_bounded(
            &mut self.state.derivative_history,
            derivative,
            self.config.history_length,
        );
        push_bounded(
            &mut self.state.quality_history,
            outcome.quality.clamp(0.0, 1.0),
            self.config.history_length,
        );

        let metrics = PidMetrics {
            proportional,
            integral,
            derivative,
            timestamp: Utc::now(),
        };
        self.state.last = Some(metrics);
        self.state.samples += 1;
        metrics
    }

    fn proportional(&self, outcome: &IterationOutcome) -> f64 {
        let completion = outcome.completion.clamp(0.0, 1.0);
        let quality = outcome.quality.clamp(0.0, 1.0);
        let error_term = (outcome.errors.len() as f64 * self.config.error_penalty)
            .min(self.config.error_penalty_cap);

        let p = ((1.0 - completion) + self.config.quality_penalty * (1.0 - quality) + error_term)
            .clamp(0.0, 1.0);
        if p < self.config.deadband {
            0.0
        } else {
            p
        }
    }

    fn integral(&mut self, outcome: &IterationOutcome, proportional: f64) -> f64 {
        let current: BTreeSet<String> = outcome
            .blockers
            .iter()
            .map(|b| normalize_blocker(b))
            .filter(|b| !b.is_empty())
            .collect();
        let recurring = current
            .iter()
            .filter(|sig| self.state.blocker_history.iter().any(|seen| seen.contains(*sig)))
            .count();
        push_bounded(
            &mut self.state.blocker_history,
            current,
            self.config.history_length,
        );

        let integral = self.state.integral * self.config.integral_decay
            + proportional
            + self.config.blocker_bonus * recurring as f64
            - self.config.learning_relief * outcome.learnings.len() as f64;

        self.state.integral = if integral.is_finite() {
            integral.clamp(self.config.integral_min, self.config.integral_max)
        } else {
            self.config.integral_max
        };
        self.state.integral
    }

    fn derivative(&self) -> f64 {
        let deltas = recent_deltas(
            &self.state.proportional_history,
            self.config.derivative_window,
        );
        if deltas.is_empty() {
            return 0.0;
        }

        // Linear recency weights: oldest 1, newest n.
        let (weighted, total) = deltas
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(sum, total), (i, delta)| {
                let weight = (i + 1) as f64;
                (sum + weight * delta, total + weight)
            });
        let d = weighted / total;
        if d.abs() < self.config.derivative_deadband {
            0.0
        } else {
            d
        }
    }

    /// Classify the recent error movement.
    ///
    /// Oscillation takes precedence over a net direction.
    #[must_use]
    pub fn trend(&self) -> Trend {
        let deltas = recent_deltas(
            &self.state.proportional_history,
            self.config.derivative_window + 1,
        );
        if deltas.is_empty() {
            return Trend::Stable;
        }

        if count_alternations(&deltas, self.config.oscillation_floor)
            >= self.config.oscillation_alternations
        {
            return Trend::Oscillating;
        }

        // Error reduction per iteration.
        let velocity = -deltas.iter().sum::<f64>() / deltas.len() as f64;
        if velocity > self.config.trend_velocity_threshold {
            Trend::Improving
        } else if velocity < -self.config.trend_velocity_threshold {
            Trend::Regressing
        } else {
            Trend::Stable
        }
    }

    #[must_use]
    pub fn proportional_history(&self) -> &VecDeque<f64> {
        &self.state.proportional_history
    }

    #[must_use]
    pub fn quality_history(&self) -> &VecDeque<f64> {
        &self.state.quality_history
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, max: usize) {
    history.push_back(value);
    while history.len() > max {
        history.pop_front();
    }
}

/// The last `window` consecutive differences, oldest first.
fn recent_deltas(history: &VecDeque<f64>, window: usize) -> Vec<f64> {
    let values: Vec<f64> = history.iter().copied().collect();
    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let skip = deltas.len().saturating_sub(window);
    deltas[skip..].to_vec()
}

/// Count sign changes between consecutive deltas larger than `floor`.
pub(crate) fn count_alternations(deltas: &[f64], floor: f64) -> usize {
    let significant: Vec<f64> = deltas.iter().copied().filter(|d| d.abs() > floor).collect();
    significant
        .windows(2)
        .filter(|w| w[0].signum() != w[1].signum())
        .count()
}

fn digit_runs() -> Option<&'static Regex> {
    static DIGITS: OnceLock<Option<Regex>> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new(r"\d+").ok()).as_ref()
}

/// Reduce a blocker description to a signature that survives cosmetic
/// differences (line numbers, counts, spacing, case).
///
/// # Example
///
/// ```
/// use ralph_fleet::control::metrics::normalize_blocker;
///
/// assert_eq!(
///     normalize_blocker("Test  FAILED at line 42"),
///     normalize_blocker("test failed at line 7"),
/// );
/// ```
#[must_use]
pub fn normalize_blocker(blocker: &str) -> String {
    let lowered = blocker.to_lowercase();
    let stripped = match digit_runs() {
        Some(re) => re.replace_all(&lowered, "").into_owned(),
        None => lowered.chars().filter(|c| !c.is_ascii_digit()).collect(),
    };
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

//! Gain scheduling.
//!
//! Gains are picked from a small catalog of profiles. The starting profile
//! comes from a complexity assessment of the task; afterwards the scheduler
//! retargets every iteration from the live signals and moves the effective
//! gains toward the target by a fixed smoothing factor, so a profile switch
//! never causes a step change in the control output.
//!
//! | Profile | kp | ki | kd | Used when |
//! |---------|----|----|----|-----------|
//! | conservative | 0.30 | 0.05 | 0.10 | complex or security-sensitive work |
//! | standard | 0.50 | 0.10 | 0.20 | default |
//! | aggressive | 0.80 | 0.20 | 0.30 | small, well-understood work |
//! | recovery | 0.40 | 0.02 | 0.50 | stuck, regressing or wound up |
//! | cautious | 0.25 | 0.05 | 0.30 | close to done late in the budget |
//! | damped | base × (0.6, 0.5, 1.5) | | | oscillating |

use serde::{Deserialize, Serialize};

use super::metrics::{PidMetrics, Trend};

// ============================================================================
// Profiles
// ============================================================================

/// Named gain profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Conservative,
    Standard,
    Aggressive,
    Recovery,
    Cautious,
    /// The base profile with damping applied.
    Damped,
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "conservative"),
            Self::Standard => write!(f, "standard"),
            Self::Aggressive => write!(f, "aggressive"),
            Self::Recovery => write!(f, "recovery"),
            Self::Cautious => write!(f, "cautious"),
            Self::Damped => write!(f, "damped"),
        }
    }
}

/// Largest per-gain gap at which a blend counts as arrived.
pub const CONVERGED_GAIN_DELTA: f64 = 1e-3;

/// A set of PID gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainProfile {
    pub kind: ProfileKind,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl GainProfile {
    /// Catalog gains for a static profile.
    ///
    /// `Damped` has no static gains; it resolves to standard here and is
    /// built with [`GainProfile::damped`] instead.
    #[must_use]
    pub fn preset(kind: ProfileKind) -> Self {
        let (kp, ki, kd) = match kind {
            ProfileKind::Conservative => (0.3, 0.05, 0.1),
            ProfileKind::Standard | ProfileKind::Damped => (0.5, 0.1, 0.2),
            ProfileKind::Aggressive => (0.8, 0.2, 0.3),
            ProfileKind::Recovery => (0.4, 0.02, 0.5),
            ProfileKind::Cautious => (0.25, 0.05, 0.3),
        };
        Self { kind, kp, ki, kd }
    }

    /// Damp a base profile: less proportional and integral action, more
    /// derivative action.
    #[must_use]
    pub fn damped(base: GainProfile) -> Self {
        Self {
            kind: ProfileKind::Damped,
            kp: base.kp * 0.6,
            ki: base.ki * 0.5,
            kd: base.kd * 1.5,
        }
    }

    /// Move `fraction` of the way toward `target`.
    ///
    /// The result keeps its current kind while in transit and takes the
    /// target's kind, with its exact gains, once every gain is within
    /// [`CONVERGED_GAIN_DELTA`] of the target.
    #[must_use]
    pub fn blend_toward(&self, target: &GainProfile, fraction: f64) -> Self {
        let step = |from: f64, to: f64| from + fraction * (to - from);
        let blended = Self {
            kind: self.kind,
            kp: step(self.kp, target.kp),
            ki: step(self.ki, target.ki),
            kd: step(self.kd, target.kd),
        };
        if blended.max_gain_delta(target) < CONVERGED_GAIN_DELTA {
            *target
        } else {
            blended
        }
    }

    fn max_gain_delta(&self, other: &GainProfile) -> f64 {
        (self.kp - other.kp)
            .abs()
            .max((self.ki - other.ki).abs())
            .max((self.kd - other.kd).abs())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Gain scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GainConfig {
    /// Fraction of the remaining distance to the target covered per update.
    pub smoothing: f64,
    /// P at or above which a flat derivative counts toward "stuck".
    pub stuck_error: f64,
    pub stuck_derivative: f64,
    /// Consecutive stuck updates before switching to recovery.
    pub stuck_iterations: u32,
    /// D above this switches to recovery.
    pub regression_rate: f64,
    /// I above this switches to recovery.
    pub windup_limit: f64,
    /// P below this late in the budget switches to cautious.
    pub cautious_error: f64,
    /// Budget fraction after which cautious applies.
    pub cautious_progress: f64,
    /// |u| at which urgency becomes medium.
    pub urgency_medium: f64,
    pub urgency_high: f64,
    pub urgency_critical: f64,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            stuck_error: 0.3,
            stuck_derivative: 0.02,
            stuck_iterations: 3,
            regression_rate: 0.1,
            windup_limit: 4.0,
            cautious_error: 0.2,
            cautious_progress: 0.5,
            urgency_medium: 0.1,
            urgency_high: 0.3,
            urgency_critical: 0.6,
        }
    }
}

impl GainConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(format!(
                "control.gains.smoothing must be in (0, 1], got {}",
                self.smoothing
            ));
        }
        if !(self.urgency_medium <= self.urgency_high && self.urgency_high <= self.urgency_critical)
        {
            return Err("control.gains urgency thresholds must be ascending".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Complexity assessment
// ============================================================================

/// How hard the problem domain is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainComplexity {
    Low,
    #[default]
    Medium,
    High,
}

/// Task characteristics used to pick the initial profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityFactors {
    pub estimated_iterations: u32,
    pub affected_files: u32,
    pub security_sensitive: bool,
    pub breaking_change: bool,
    pub domain: DomainComplexity,
}

/// Result of [`assess_complexity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    pub score: u32,
    pub profile: ProfileKind,
}

/// Score a task and pick its starting profile.
///
/// # Example
///
/// ```
/// use ralph_fleet::control::gains::{assess_complexity, ComplexityFactors, ProfileKind};
///
/// let small = ComplexityFactors { estimated_iterations: 3, affected_files: 1, ..Default::default() };
/// assert_eq!(assess_complexity(&small).profile, ProfileKind::Aggressive);
///
/// let risky = ComplexityFactors { security_sensitive: true, ..small };
/// assert_eq!(assess_complexity(&risky).profile, ProfileKind::Conservative);
/// ```
#[must_use]
pub fn assess_complexity(factors: &ComplexityFactors) -> ComplexityAssessment {
    let iterations = match factors.estimated_iterations {
        n if n > 30 => 3,
        n if n > 15 => 2,
        n if n > 5 => 1,
        _ => 0,
    };
    let files = match factors.affected_files {
        n if n > 20 => 3,
        n if n > 10 => 2,
        n if n > 3 => 1,
        _ => 0,
    };
    let breaking = if factors.breaking_change { 2 } else { 0 };
    let domain = match factors.domain {
        DomainComplexity::Low => 0,
        DomainComplexity::Medium => 1,
        DomainComplexity::High => 2,
    };

    let score = iterations + files + breaking + domain;
    let profile = if factors.security_sensitive || score >= 6 {
        ProfileKind::Conservative
    } else if score >= 3 {
        ProfileKind::Standard
    } else {
        ProfileKind::Aggressive
    };

    ComplexityAssessment { score, profile }
}

// ============================================================================
// Control output
// ============================================================================

/// How soon the control signal asks for intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Control signal with its interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlOutput {
    /// `u = kp·P + ki·I + kd·D`
    pub signal: f64,
    pub urgency: Urgency,
    /// Grant or trim the remaining iteration budget.
    pub adjust_budget: bool,
    /// Progress is being made but slowly; allow more time.
    pub extend_timeout: bool,
    /// The current approach is not converging.
    pub change_strategy: bool,
    /// Hand over to a human.
    pub escalate: bool,
    pub profile: ProfileKind,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Inputs to a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemState {
    pub metrics: PidMetrics,
    pub trend: Trend,
    /// Fraction of the iteration budget consumed.
    pub progress: f64,
}

/// Serializable scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainState {
    pub base: ProfileKind,
    pub target: ProfileKind,
    pub effective: GainProfile,
    pub stuck_streak: u32,
}

/// Picks and smooths gains.
#[derive(Debug, Clone)]
pub struct GainScheduler {
    config: GainConfig,
    state: GainState,
}

impl GainScheduler {
    /// Start on `base` with its catalog gains.
    #[must_use]
    pub fn new(config: GainConfig, base: ProfileKind) -> Self {
        Self {
            config,
            state: GainState {
                base,
                target: base,
                effective: GainProfile::preset(base),
                stuck_streak: 0,
            },
        }
    }

    /// Start on the profile recommended for `factors`.
    #[must_use]
    pub fn for_task(config: GainConfig, factors: &ComplexityFactors) -> Self {
        Self::new(config, assess_complexity(factors).profile)
    }

    #[must_use]
    pub fn from_state(config: GainConfig, state: GainState) -> Self {
        Self { config, state }
    }

    #[must_use]
    pub fn state(&self) -> &GainState {
        &self.state
    }

    #[must_use]
    pub fn gains(&self) -> &GainProfile {
        &self.state.effective
    }

    /// Return to the base profile with no history.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone(), self.state.base);
    }

    /// Retarget from the current signals and step toward the target.
    pub fn update(&mut self, system: &SystemState) -> GainProfile {
        let m = &system.metrics;
        let flat = m.derivative.abs() < self.config.stuck_derivative;
        if m.proportional >= self.config.stuck_error && flat {
            self.state.stuck_streak += 1;
        } else {
            self.state.stuck_streak = 0;
        }

        let target = self.select_target(system);
        let target_gains = match target {
            ProfileKind::Damped => GainProfile::damped(GainProfile::preset(self.state.base)),
            other => GainProfile::preset(other),
        };

        self.state.target = target;
        self.state.effective = self
            .state
            .effective
            .blend_toward(&target_gains, self.config.smoothing);
        self.state.effective
    }

    fn select_target(&self, system: &SystemState) -> ProfileKind {
        let m = &system.metrics;
        let stuck = self.state.stuck_streak >= self.config.stuck_iterations;
        let regressing = m.derivative > self.config.regression_rate;
        let wound_up = m.integral > self.config.windup_limit;

        if stuck || regressing || wound_up {
            ProfileKind::Recovery
        } else if m.proportional < self.config.cautious_error
            && system.progress > self.config.cautious_progress
        {
            ProfileKind::Cautious
        } else if system.trend == Trend::Oscillating {
            ProfileKind::Damped
        } else {
            self.state.base
        }
    }

    /// Combine the signals with the effective gains.
    #[must_use]
    pub fn calculate_control_output(&self, metrics: &PidMetrics) -> ControlOutput {
        let g = &self.state.effective;
        let signal = g.kp * metrics.proportional + g.ki * metrics.integral + g.kd * metrics.derivative;
        let urgency = self.urgency(signal.abs());

        ControlOutput {
            signal,
            urgency,
            adjust_budget: urgency >= Urgency::Medium,
            extend_timeout: urgency >= Urgency::Medium && metrics.derivative <= 0.0,
            change_strategy: urgency >= Urgency::High && metrics.derivative >= 0.0,
            escalate: urgency == Urgency::Critical,
            profile: self.state.target,
        }
    }

    fn urgency(&self, magnitude: f64) -> Urgency {
        if magnitude < self.config.urgency_medium {
            Urgency::Low
        } else if magnitude < self.config.urgency_high {
            Urgency::Medium
        } else if magnitude < self.config.urgency_critical {
            Urgency::High
        } else {
            Urgency::Critical
        }
    }
}

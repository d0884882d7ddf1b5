//! Alarm detection over the control signals.
//!
//! Seven detectors watch a bounded window of recent samples. Each type has
//! at most one active alarm: a detector that keeps firing does not raise a
//! duplicate, one that escalates replaces the active alarm, one that calms
//! down is downgraded in place without re-firing, and one that stops firing
//! resolves it. Every raised alarm is also appended to a bounded history log.
//!
//! | Alarm | Fires when | Severity |
//! |-------|------------|----------|
//! | stuck_loop | error flat and nonzero for N samples | warning |
//! | oscillation | error deltas alternate sign | warning |
//! | regression | derivative above threshold | warning / critical |
//! | resource_burn | budget consumed with work left | warning / critical / emergency |
//! | quality_degradation | quality fell over the window | warning / critical |
//! | integral_windup | integral above limit | warning |
//! | derivative_spike | very large derivative | critical (worse) / info (better) |

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::metrics::{count_alternations, PidMetrics};

// ============================================================================
// Types
// ============================================================================

/// Kind of pathological behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmType {
    StuckLoop,
    Oscillation,
    Regression,
    ResourceBurn,
    QualityDegradation,
    IntegralWindup,
    DerivativeSpike,
}

impl AlarmType {
    pub const ALL: [AlarmType; 7] = [
        Self::StuckLoop,
        Self::Oscillation,
        Self::Regression,
        Self::ResourceBurn,
        Self::QualityDegradation,
        Self::IntegralWindup,
        Self::DerivativeSpike,
    ];

    /// Behavioral alarms describe what the agent does; the rest describe
    /// the control signal itself.
    #[must_use]
    pub fn is_behavioral(&self) -> bool {
        matches!(
            self,
            Self::StuckLoop | Self::Oscillation | Self::QualityDegradation
        )
    }
}

impl std::fmt::Display for AlarmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StuckLoop => "stuck_loop",
            Self::Oscillation => "oscillation",
            Self::Regression => "regression",
            Self::ResourceBurn => "resource_burn",
            Self::QualityDegradation => "quality_degradation",
            Self::IntegralWindup => "integral_windup",
            Self::DerivativeSpike => "derivative_spike",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// What the orchestrator should do about an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intervention {
    None,
    /// Retune budget or gains.
    Adjust,
    /// Inject guidance into the next prompt.
    Nudge,
    Pause,
    Abort,
}

impl Intervention {
    /// Deterministic severity → intervention mapping.
    #[must_use]
    pub fn for_alarm(alarm_type: AlarmType, severity: Severity) -> Self {
        match severity {
            Severity::Info => Self::None,
            Severity::Warning if alarm_type.is_behavioral() => Self::Nudge,
            Severity::Warning => Self::Adjust,
            Severity::Critical => Self::Pause,
            Severity::Emergency => Self::Abort,
        }
    }
}

impl std::fmt::Display for Intervention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Adjust => write!(f, "adjust"),
            Self::Nudge => write!(f, "nudge"),
            Self::Pause => write!(f, "pause"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// A raised alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub alarm_type: AlarmType,
    pub severity: Severity,
    pub message: String,
    /// Signal values that triggered the alarm.
    pub context: BTreeMap<String, f64>,
    /// Remediation hints for the next session.
    pub suggestions: Vec<String>,
    pub intervention: Intervention,
    pub raised_at: DateTime<Utc>,
}

/// Result of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmReport {
    /// Alarms newly raised or escalated by this evaluation.
    pub fired: Vec<Alarm>,
    /// All active alarms after this evaluation.
    pub active: Vec<Alarm>,
    pub resolved: Vec<AlarmType>,
    /// Interventions to apply. Empty unless auto-apply is enabled.
    pub interventions: Vec<(AlarmType, Intervention)>,
}

impl AlarmReport {
    /// Highest severity among the active alarms.
    #[must_use]
    pub fn max_severity(&self) -> Option<Severity> {
        self.active.iter().map(|a| a.severity).max()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlarmConfig {
    /// Samples kept for the detectors.
    pub history_window: usize,
    /// P at or below this never counts as stuck.
    pub deadband: f64,

    pub stuck_iterations: usize,
    /// Largest P change between samples that still counts as no progress.
    pub stuck_min_progress: f64,
    pub stuck_derivative: f64,

    pub oscillation_window: usize,
    pub oscillation_floor: f64,
    pub oscillation_count: usize,

    pub regression_warning: f64,
    pub regression_critical: f64,

    /// Budget fractions for resource burn.
    pub burn_warning: f64,
    pub burn_critical: f64,
    pub burn_emergency: f64,

    pub quality_window: usize,
    pub quality_drop_warning: f64,
    pub quality_drop_critical: f64,

    pub windup_limit: f64,
    pub spike_limit: f64,

    /// Bound on the alarm history log.
    pub max_history: usize,
    /// Report interventions for fired alarms.
    pub auto_apply_interventions: bool,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            deadband: 0.05,
            stuck_iterations: 3,
            stuck_min_progress: 0.02,
            stuck_derivative: 0.02,
            oscillation_window: 6,
            oscillation_floor: 0.05,
            oscillation_count: 3,
            regression_warning: 0.1,
            regression_critical: 0.25,
            burn_warning: 0.8,
            burn_critical: 0.9,
            burn_emergency: 1.0,
            quality_window: 3,
            quality_drop_warning: 0.2,
            quality_drop_critical: 0.4,
            windup_limit: 4.0,
            spike_limit: 0.3,
            max_history: 100,
            auto_apply_interventions: false,
        }
    }
}

impl AlarmConfig {
    pub fn validate(&self) -> Result<(), String> {
        let longest = self
            .stuck_iterations
            .max(self.oscillation_window)
            .max(self.quality_window + 1);
        if self.history_window < longest {
            return Err(format!(
                "control.alarms.historyWindow ({}) must cover the longest detector window ({longest})",
                self.history_window
            ));
        }
        if !(self.burn_warning <= self.burn_critical && self.burn_critical <= self.burn_emergency) {
            return Err("control.alarms burn thresholds must be ascending".to_string());
        }
        if self.regression_warning > self.regression_critical {
            return Err("control.alarms.regressionWarning exceeds regressionCritical".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// What the detectors look at for one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmInput {
    pub metrics: PidMetrics,
    pub quality: f64,
    /// Fraction of the iteration budget consumed.
    pub budget_used: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub quality: f64,
}

/// Serializable monitor state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmState {
    pub samples: VecDeque<Sample>,
    pub active: Vec<Alarm>,
    pub history: VecDeque<Alarm>,
}

struct Detection {
    severity: Severity,
    message: String,
    context: BTreeMap<String, f64>,
    suggestions: Vec<&'static str>,
}

/// Runs the detectors and tracks active alarms.
#[derive(Debug, Clone)]
pub struct AlarmMonitor {
    config: AlarmConfig,
    state: AlarmState,
}

impl AlarmMonitor {
    #[must_use]
    pub fn new(config: AlarmConfig) -> Self {
        Self {
            config,
            state: AlarmState::default(),
        }
    }

    #[must_use]
    pub fn from_state(config: AlarmConfig, state: AlarmState) -> Self {
        Self { config, state }
    }

    #[must_use]
    pub fn state(&self) -> &AlarmState {
        &self.state
    }

    #[must_use]
    pub fn active(&self) -> &[Alarm] {
        &self.state.active
    }

    /// Every alarm raised so far, oldest first, bounded.
    #[must_use]
    pub fn history(&self) -> &VecDeque<Alarm> {
        &self.state.history
    }

    pub fn reset(&mut self) {
        self.state = AlarmState::default();
    }

    /// Record a sample, run every detector and reconcile active alarms.
    pub fn evaluate(&mut self, input: &AlarmInput) -> AlarmReport {
        self.state.samples.push_back(Sample {
            proportional: input.metrics.proportional,
            integral: input.metrics.integral,
            derivative: input.metrics.derivative,
            quality: input.quality,
        });
        while self.state.samples.len() > self.config.history_window {
            self.state.samples.pop_front();
        }

        let mut report = AlarmReport::default();
        let now = Utc::now();

        for alarm_type in AlarmType::ALL {
            let detection = self.detect(alarm_type, input);
            let position = self
                .state
                .active
                .iter()
                .position(|a| a.alarm_type == alarm_type);

            match (detection, position) {
                (Some(detection), Some(idx)) => {
                    let current = self.state.active[idx].severity;
                    if detection.severity > current {
                        let alarm = self.raise(alarm_type, detection, now);
                        self.state.active[idx] = alarm.clone();
                        report.fired.push(alarm);
                    } else if detection.severity < current {
                        let active = &mut self.state.active[idx];
                        active.severity = detection.severity;
                        active.intervention = Intervention::for_alarm(alarm_type, detection.severity);
                        active.message = detection.message;
                        active.context = detection.context;
                        info!(
                            alarm = %alarm_type,
                            from = %current,
                            to = %detection.severity,
                            "Alarm de-escalated"
                        );
                    }
                }
                (Some(detection), None) => {
                    let alarm = self.raise(alarm_type, detection, now);
                    self.state.active.push(alarm.clone());
                    report.fired.push(alarm);
                }
                (None, Some(idx)) => {
                    self.state.active.remove(idx);
                    info!(alarm = %alarm_type, "Alarm resolved");
                    report.resolved.push(alarm_type);
                }
                (None, None) => {}
            }
        }

        if self.config.auto_apply_interventions {
            report.interventions = report
                .fired
                .iter()
                .filter(|a| a.intervention != Intervention::None)
                .map(|a| (a.alarm_type, a.intervention))
                .collect();
        }
        report.active = self.state.active.clone();
        report
    }

    fn raise(&mut self, alarm_type: AlarmType, detection: Detection, now: DateTime<Utc>) -> Alarm {
        let alarm = Alarm {
            alarm_type,
            severity: detection.severity,
            message: detection.message,
            context: detection.context,
            suggestions: detection.suggestions.into_iter().map(String::from).collect(),
            intervention: Intervention::for_alarm(alarm_type, detection.severity),
            raised_at: now,
        };
        warn!(
            alarm = %alarm_type,
            severity = %alarm.severity,
            intervention = %alarm.intervention,
            "{}",
            alarm.message
        );

        self.state.history.push_back(alarm.clone());
        while self.state.history.len() > self.config.max_history {
            self.state.history.pop_front();
        }
        alarm
    }

    fn detect(&self, alarm_type: AlarmType, input: &AlarmInput) -> Option<Detection> {
        match alarm_type {
            AlarmType::StuckLoop => self.detect_stuck(),
            AlarmType::Oscillation => self.detect_oscillation(),
            AlarmType::Regression => self.detect_regression(&input.metrics),
            AlarmType::ResourceBurn => self.detect_resource_burn(input),
            AlarmType::QualityDegradation => self.detect_quality_degradation(),
            AlarmType::IntegralWindup => self.detect_windup(&input.metrics),
            AlarmType::DerivativeSpike => self.detect_spike(&input.metrics),
        }
    }

    fn recent(&self, n: usize) -> Option<Vec<Sample>> {
        let len = self.state.samples.len();
        if n == 0 || len < n {
            return None;
        }
        Some(self.state.samples.iter().skip(len - n).copied().collect())
    }

    fn detect_stuck(&self) -> Option<Detection> {
        let n = self.config.stuck_iterations;
        let recent = self.recent(n)?;
        let last = recent.last()?;

        let above_deadband = recent.iter().all(|s| s.proportional > self.config.deadband);
        let flat = recent
            .windows(2)
            .all(|w| (w[1].proportional - w[0].proportional).abs() < self.config.stuck_min_progress);
        if !(above_deadband && flat && last.derivative.abs() < self.config.stuck_derivative) {
            return None;
        }

        Some(Detection {
            severity: Severity::Warning,
            message: format!(
                "No progress for {n} iterations (error {:.2})",
                last.proportional
            ),
            context: context(&[("error", last.proportional), ("iterations", n as f64)]),
            suggestions: vec![
                "Split the current subtask into smaller verifiable steps",
                "Re-read the last failure output before retrying",
            ],
        })
    }

    fn detect_oscillation(&self) -> Option<Detection> {
        let recent = self.recent(self.config.oscillation_window)?;
        let deltas: Vec<f64> = recent
            .windows(2)
            .map(|w| w[1].proportional - w[0].proportional)
            .collect();
        let alternations = count_alternations(&deltas, self.config.oscillation_floor);
        if alternations < self.config.oscillation_count {
            return None;
        }

        Some(Detection {
            severity: Severity::Warning,
            message: format!("Error alternated direction {alternations} times"),
            context: context(&[("alternations", alternations as f64)]),
            suggestions: vec![
                "Commit to one approach and stop reverting previous changes",
                "Record why the last attempt failed before trying again",
            ],
        })
    }

    fn detect_regression(&self, metrics: &PidMetrics) -> Option<Detection> {
        let d = metrics.derivative;
        let severity = if d >= self.config.regression_critical {
            Severity::Critical
        } else if d >= self.config.regression_warning {
            Severity::Warning
        } else {
            return None;
        };

        Some(Detection {
            severity,
            message: format!("Error increasing at {d:.2} per iteration"),
            context: context(&[("derivative", d), ("error", metrics.proportional)]),
            suggestions: vec![
                "Restore the last checkpoint that passed verification",
                "Review the most recent changes for unintended side effects",
            ],
        })
    }

    fn detect_resource_burn(&self, input: &AlarmInput) -> Option<Detection> {
        if input.metrics.proportional == 0.0 {
            return None;
        }
        let used = input.budget_used;
        let severity = if used >= self.config.burn_emergency {
            Severity::Emergency
        } else if used >= self.config.burn_critical {
            Severity::Critical
        } else if used >= self.config.burn_warning {
            Severity::Warning
        } else {
            return None;
        };

        Some(Detection {
            severity,
            message: format!(
                "{:.0}% of the iteration budget used with error {:.2} remaining",
                used * 100.0,
                input.metrics.proportional
            ),
            context: context(&[("budget_used", used), ("error", input.metrics.proportional)]),
            suggestions: vec![
                "Narrow the remaining scope to what can be verified in budget",
                "Raise the iteration budget if the remaining work is understood",
            ],
        })
    }

    fn detect_quality_degradation(&self) -> Option<Detection> {
        let recent = self.recent(self.config.quality_window + 1)?;
        let first = recent.first()?.quality;
        let last = recent.last()?.quality;
        let drop = first - last;

        let severity = if drop >= self.config.quality_drop_critical {
            Severity::Critical
        } else if drop >= self.config.quality_drop_warning {
            Severity::Warning
        } else {
            return None;
        };

        Some(Detection {
            severity,
            message: format!("Quality fell from {first:.2} to {last:.2}"),
            context: context(&[("from", first), ("to", last)]),
            suggestions: vec![
                "Run the full test suite before continuing",
                "Fix new warnings before adding features",
            ],
        })
    }

    fn detect_windup(&self, metrics: &PidMetrics) -> Option<Detection> {
        if metrics.integral <= self.config.windup_limit {
            return None;
        }
        Some(Detection {
            severity: Severity::Warning,
            message: format!(
                "Accumulated difficulty {:.2} exceeds {:.2}",
                metrics.integral, self.config.windup_limit
            ),
            context: context(&[("integral", metrics.integral)]),
            suggestions: vec![
                "Address recurring blockers before continuing",
                "Capture learnings from the blocked attempts",
            ],
        })
    }

    fn detect_spike(&self, metrics: &PidMetrics) -> Option<Detection> {
        let d = metrics.derivative;
        if d.abs() <= self.config.spike_limit {
            return None;
        }

        let (severity, message, suggestions) = if d > 0.0 {
            (
                Severity::Critical,
                format!("Error jumped by {d:.2} in one step"),
                vec!["Stop and inspect the last iteration's changes"],
            )
        } else {
            (
                Severity::Info,
                format!("Error dropped by {:.2} in one step", -d),
                vec!["Verify the jump in progress is real before relying on it"],
            )
        };

        Some(Detection {
            severity,
            message,
            context: context(&[("derivative", d)]),
            suggestions,
        })
    }
}

fn context(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

//! Adaptive per-loop control.
//!
//! Each iteration's outcome flows through three stages:
//!
//! ```text
//! IterationOutcome ──> MetricsCollector ──> PidMetrics + Trend
//!                                              │
//!                        ┌─────────────────────┴───────────────┐
//!                        v                                     v
//!                  GainScheduler                          AlarmMonitor
//!                  (gains, u, urgency)                    (fired / active)
//!                        └──────────────┬──────────────────────┘
//!                                       v
//!                               ControlDecision
//! ```
//!
//! Decisions are advisory: the orchestrator chooses whether to honor them.
//! The controller state can be snapshotted and restored so adaptation
//! survives a supervisor restart.

pub mod alarms;
pub mod gains;
pub mod metrics;

pub use alarms::{
    Alarm, AlarmConfig, AlarmInput, AlarmMonitor, AlarmReport, AlarmState, AlarmType,
    Intervention, Severity,
};
pub use gains::{
    assess_complexity, ComplexityAssessment, ComplexityFactors, ControlOutput, DomainComplexity,
    GainConfig, GainProfile, GainScheduler, GainState, ProfileKind, SystemState, Urgency,
};
pub use metrics::{
    IterationOutcome, MetricsCollector, MetricsConfig, MetricsState, PidMetrics, Trend,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::state::LoopRecord;

// ============================================================================
// Configuration
// ============================================================================

/// Control loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub gains: GainConfig,
    #[serde(default)]
    pub alarms: AlarmConfig,
    /// Budget fraction past which unfinished work pauses the loop.
    #[serde(default = "default_budget_pause_fraction")]
    pub budget_pause_fraction: f64,
}

fn default_budget_pause_fraction() -> f64 {
    0.95
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            metrics: MetricsConfig::default(),
            gains: GainConfig::default(),
            alarms: AlarmConfig::default(),
            budget_pause_fraction: default_budget_pause_fraction(),
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.metrics.validate()?;
        self.gains.validate()?;
        self.alarms.validate()?;
        if !(0.0..=1.0).contains(&self.budget_pause_fraction) {
            return Err(format!(
                "control.budgetPauseFraction must be in [0, 1], got {}",
                self.budget_pause_fraction
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Decision types
// ============================================================================

/// What the orchestrator should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Continue,
    Adjust,
    Pause,
    Abort,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Adjust => write!(f, "adjust"),
            Self::Pause => write!(f, "pause"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Controller mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    #[default]
    Running,
    Adjusting,
    Paused,
    /// Sticky until [`ControlLoop::reset`].
    Aborted,
}

/// Output of [`ControlLoop::process`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDecision {
    pub action: ControlAction,
    pub control_signal: f64,
    pub urgency: Urgency,
    pub trend: Trend,
    /// Remediation hints for the next session, deduplicated.
    pub recommendations: Vec<String>,
    pub metrics: PidMetrics,
    pub gains: GainProfile,
    pub alarms: AlarmReport,
    pub state: ControlState,
}

/// Serializable controller state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSnapshot {
    pub metrics: MetricsState,
    pub gains: GainState,
    pub alarms: AlarmState,
    pub state: ControlState,
}

// ============================================================================
// Control loop
// ============================================================================

/// Per-loop controller.
#[derive(Debug, Clone)]
pub struct ControlLoop {
    config: ControlConfig,
    metrics: MetricsCollector,
    gains: GainScheduler,
    alarms: AlarmMonitor,
    state: ControlState,
}

impl ControlLoop {
    #[must_use]
    pub fn new(config: ControlConfig, base: ProfileKind) -> Self {
        Self {
            metrics: MetricsCollector::new(config.metrics.clone()),
            gains: GainScheduler::new(config.gains.clone(), base),
            alarms: AlarmMonitor::new(config.alarms.clone()),
            state: ControlState::Running,
            config,
        }
    }

    /// Controller whose base profile comes from a complexity assessment.
    #[must_use]
    pub fn for_task(config: ControlConfig, factors: &ComplexityFactors) -> Self {
        let profile = assess_complexity(factors).profile;
        Self::new(config, profile)
    }

    /// Resume a controller from a snapshot.
    #[must_use]
    pub fn restore(config: ControlConfig, snapshot: ControlSnapshot) -> Self {
        Self {
            metrics: MetricsCollector::from_state(config.metrics.clone(), snapshot.metrics),
            gains: GainScheduler::from_state(config.gains.clone(), snapshot.gains),
            alarms: AlarmMonitor::from_state(config.alarms.clone(), snapshot.alarms),
            state: snapshot.state,
            config,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            metrics: self.metrics.state().clone(),
            gains: self.gains.state().clone(),
            alarms: self.alarms.state().clone(),
            state: self.state,
        }
    }

    #[must_use]
    pub fn state(&self) -> ControlState {
        self.state
    }

    #[must_use]
    pub fn alarm_monitor(&self) -> &AlarmMonitor {
        &self.alarms
    }

    /// Clear all history and leave the aborted state.
    pub fn reset(&mut self) {
        self.metrics.reset();
        self.gains.reset();
        self.alarms.reset();
        self.state = ControlState::Running;
    }

    /// Operator override: leave the paused state.
    ///
    /// Returns false if the controller was not paused.
    pub fn resume(&mut self) -> bool {
        if self.state == ControlState::Paused {
            self.state = ControlState::Running;
            true
        } else {
            false
        }
    }

    /// Decide what to do after one iteration.
    pub fn process(&mut self, outcome: &IterationOutcome, loop_state: &LoopRecord) -> ControlDecision {
        let metrics = self.metrics.update(outcome);
        let trend = self.metrics.trend();
        let progress = loop_state.progress();

        let gains = self.gains.update(&SystemState {
            metrics,
            trend,
            progress,
        });
        let output = self.gains.calculate_control_output(&metrics);
        let alarms = self.alarms.evaluate(&AlarmInput {
            metrics,
            quality: outcome.quality,
            budget_used: progress,
        });

        let action = if self.state == ControlState::Aborted {
            ControlAction::Abort
        } else {
            self.select_action(&alarms, &output, &metrics, progress)
        };
        self.transition(action, &alarms);

        let recommendations = recommendations(&alarms, &output);
        debug!(
            loop_id = %loop_state.id,
            iteration = loop_state.iteration,
            p = metrics.proportional,
            i = metrics.integral,
            d = metrics.derivative,
            signal = output.signal,
            urgency = %output.urgency,
            action = %action,
            "Control decision"
        );

        ControlDecision {
            action,
            control_signal: output.signal,
            urgency: output.urgency,
            trend,
            recommendations,
            metrics,
            gains,
            alarms,
            state: self.state,
        }
    }

    fn select_action(
        &self,
        alarms: &AlarmReport,
        output: &ControlOutput,
        metrics: &PidMetrics,
        progress: f64,
    ) -> ControlAction {
        match alarms.max_severity() {
            Some(Severity::Emergency) => ControlAction::Abort,
            Some(Severity::Critical) => ControlAction::Pause,
            _ if progress >= self.config.budget_pause_fraction && metrics.proportional > 0.0 => {
                ControlAction::Pause
            }
            Some(Severity::Warning) => ControlAction::Adjust,
            _ if output.urgency >= Urgency::High => ControlAction::Adjust,
            _ => ControlAction::Continue,
        }
    }

    fn transition(&mut self, action: ControlAction, alarms: &AlarmReport) {
        let next = match action {
            ControlAction::Abort => ControlState::Aborted,
            ControlAction::Pause => ControlState::Paused,
            ControlAction::Adjust => ControlState::Adjusting,
            ControlAction::Continue if alarms.active.is_empty() => ControlState::Running,
            ControlAction::Continue => self.state,
        };

        if next != self.state {
            info!(from = ?self.state, to = ?next, "Control state changed");
            self.state = next;
        }
    }
}

fn recommendations(alarms: &AlarmReport, output: &ControlOutput) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |s: String| {
        if !out.contains(&s) {
            out.push(s);
        }
    };

    for alarm in &alarms.fired {
        for suggestion in &alarm.suggestions {
            push(suggestion.clone());
        }
    }
    if output.change_strategy {
        push("Current approach is not converging; try a different strategy".to_string());
    }
    if output.extend_timeout {
        push("Progress is slow but steady; allow more time per iteration".to_string());
    }
    if output.escalate {
        push("Escalate to a human reviewer".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LoopConfig;

    fn record(iteration: u32, max: u32) -> LoopRecord {
        let mut record = LoopRecord::new("demo-abc123", &LoopConfig::new("demo").with_max_iterations(max));
        record.iteration = iteration;
        record
    }

    fn controller() -> ControlLoop {
        ControlLoop::new(ControlConfig::default(), ProfileKind::Standard)
    }

    #[test]
    fn test_healthy_progress_continues() {
        let mut control = controller();
        let mut last = None;
        for (i, completion) in [0.5, 0.65, 0.8, 0.9].into_iter().enumerate() {
            last = Some(control.process(&IterationOutcome::new(completion, 0.95), &record(i as u32 + 1, 50)));
        }
        let decision = last.unwrap();
        assert_eq!(decision.action, ControlAction::Continue);
        assert_eq!(decision.state, ControlState::Running);
        assert_eq!(decision.trend, Trend::Improving);
    }

    #[test]
    fn test_stuck_loop_adjusts_once() {
        let mut control = controller();
        let mut stuck_alarms = 0;
        let mut actions = Vec::new();
        for i in 1..=4 {
            let decision = control.process(&IterationOutcome::new(0.5, 0.9), &record(i, 50));
            stuck_alarms += decision
                .alarms
                .fired
                .iter()
                .filter(|a| a.alarm_type == AlarmType::StuckLoop)
                .count();
            actions.push(decision.action);
        }
        assert_eq!(stuck_alarms, 1);
        assert_eq!(actions[2], ControlAction::Adjust);
        assert_eq!(control.state(), ControlState::Adjusting);
    }

    #[test]
    fn test_budget_exhaustion_pauses() {
        let mut control = controller();
        let decision = control.process(&IterationOutcome::new(0.7, 0.9), &record(48, 50));
        assert_eq!(decision.action, ControlAction::Pause);
        assert_eq!(decision.state, ControlState::Paused);
        assert!(control.resume());
        assert_eq!(control.state(), ControlState::Running);
    }

    #[test]
    fn test_emergency_aborts_and_sticks() {
        let mut control = controller();
        let decision = control.process(&IterationOutcome::new(0.5, 0.9), &record(50, 50));
        assert_eq!(decision.action, ControlAction::Abort);

        let after = control.process(&IterationOutcome::new(1.0, 1.0), &record(1, 50));
        assert_eq!(after.action, ControlAction::Abort);
        assert_eq!(after.state, ControlState::Aborted);

        control.reset();
        let fresh = control.process(&IterationOutcome::new(0.5, 1.0), &record(1, 50));
        assert_ne!(fresh.action, ControlAction::Abort);
    }

    #[test]
    fn test_regression_spike_pauses() {
        let mut control = controller();
        control.process(&IterationOutcome::new(0.8, 1.0), &record(1, 50));
        let decision = control.process(&IterationOutcome::new(0.1, 1.0), &record(2, 50));
        assert!(decision.metrics.derivative > 0.3);
        assert_eq!(decision.action, ControlAction::Pause);
        assert!(!decision.recommendations.is_empty());
    }

    fn alarm_input(p: f64, d: f64) -> AlarmInput {
        AlarmInput {
            metrics: PidMetrics {
                proportional: p,
                integral: 0.5,
                derivative: d,
                timestamp: chrono::Utc::now(),
            },
            quality: 0.9,
            budget_used: 0.1,
        }
    }

    #[test]
    fn test_deescalated_regression_adjusts_instead_of_pausing() {
        let control = controller();
        let mut monitor = AlarmMonitor::new(AlarmConfig::default());

        let critical_input = alarm_input(0.6, 0.28);
        let critical = monitor.evaluate(&critical_input);
        let output = control.gains.calculate_control_output(&critical_input.metrics);
        assert_eq!(
            control.select_action(&critical, &output, &critical_input.metrics, 0.1),
            ControlAction::Pause
        );

        let calmer_input = alarm_input(0.75, 0.15);
        let calmer = monitor.evaluate(&calmer_input);
        let output = control.gains.calculate_control_output(&calmer_input.metrics);
        assert_eq!(
            control.select_action(&calmer, &output, &calmer_input.metrics, 0.1),
            ControlAction::Adjust
        );
    }

    #[test]
    fn test_info_alarm_holds_state_until_cleared() {
        let mut control = controller();
        control.state = ControlState::Adjusting;
        let mut monitor = AlarmMonitor::new(AlarmConfig::default());

        let info_only = monitor.evaluate(&alarm_input(0.2, -0.4));
        assert_eq!(info_only.max_severity(), Some(Severity::Info));
        control.transition(ControlAction::Continue, &info_only);
        assert_eq!(control.state(), ControlState::Adjusting);

        let cleared = monitor.evaluate(&alarm_input(0.15, -0.05));
        assert!(cleared.active.is_empty());
        control.transition(ControlAction::Continue, &cleared);
        assert_eq!(control.state(), ControlState::Running);
    }

    #[test]
    fn test_snapshot_restore_continues_identically() {
        let mut original = controller();
        original.process(&IterationOutcome::new(0.3, 0.9), &record(1, 50));
        original.process(&IterationOutcome::new(0.4, 0.9), &record(2, 50));

        let json = serde_json::to_string(&original.snapshot()).unwrap();
        let snapshot: ControlSnapshot = serde_json::from_str(&json).unwrap();
        let mut restored = ControlLoop::restore(ControlConfig::default(), snapshot);

        let a = original.process(&IterationOutcome::new(0.45, 0.9), &record(3, 50));
        let b = restored.process(&IterationOutcome::new(0.45, 0.9), &record(3, 50));
        assert_eq!(a.action, b.action);
        assert!((a.control_signal - b.control_signal).abs() < 1e-12);
    }

    #[test]
    fn test_for_task_uses_assessment() {
        let factors = ComplexityFactors {
            security_sensitive: true,
            ..ComplexityFactors::default()
        };
        let control = ControlLoop::for_task(ControlConfig::default(), &factors);
        assert_eq!(control.snapshot().gains.base, ProfileKind::Conservative);
    }

    #[test]
    fn test_config_validation() {
        assert!(ControlConfig::default().validate().is_ok());
        let bad = ControlConfig {
            budget_pause_fraction: 1.5,
            ..ControlConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}

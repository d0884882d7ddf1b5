//! Crash recovery for loops whose owner process died.
//!
//! Recovery runs in four steps:
//! 1. Confirm the crash: the loop should be running but its pid is gone
//! 2. Under the loop's lease, mark it recovering and count the attempt
//!    (abort past the limit)
//! 3. Pick a strategy from the record as the crash left it
//! 4. Restore the newest checkpoint, keeping learnings gathered since, and
//!    render the context handed to the next session
//!
//! Restoring is idempotent: the restored record carries the checkpoint's
//! timestamp, so restoring the same checkpoint twice yields identical state.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{FleetError, Result};
use crate::liveness::LivenessSignal;
use crate::state::{LoopRecord, LoopStateStore, LoopStatus};
use crate::testing::ProcessProbe;

/// Recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryConfig {
    /// Recoveries allowed per loop before it is aborted instead.
    pub max_recovery_attempts: u32,
    /// Restore the newest checkpoint as part of `recover`.
    pub restore_on_recover: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            restore_on_recover: true,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_restore(mut self, restore: bool) -> Self {
        self.restore_on_recover = restore;
        self
    }
}

/// A confirmed crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub loop_id: String,
    pub pid: u32,
    pub status: LoopStatus,
    pub iteration: u32,
}

/// How the next session should pick up the work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RecoveryStrategy {
    /// Finish the subtask that was in flight.
    ResumeSubtask { subtask: String },
    /// The last analysis said the approach is sound; keep going.
    ContinueExternal { summary: String },
    /// Start over, carrying forward what was learned.
    RestartWithLearnings { learnings: Vec<String> },
}

impl RecoveryStrategy {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResumeSubtask { .. } => "resume_subtask",
            Self::ContinueExternal { .. } => "continue_external",
            Self::RestartWithLearnings { .. } => "restart_with_learnings",
        }
    }
}

/// A restored checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub checkpoint_id: String,
    pub record: LoopRecord,
}

/// What to tell the next session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub loop_id: String,
    pub strategy: RecoveryStrategy,
    /// Checkpoint the state was restored from, if any.
    pub checkpoint: Option<String>,
    pub attempt: u32,
    /// Prompt-ready recovery context.
    pub context: String,
}

/// Outcome of recovering one loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryResult {
    Recovered(RecoveryPlan),
    /// Owner still alive or loop not expected to be running.
    NotCrashed { loop_id: String },
    /// Too many attempts; the loop was aborted.
    Aborted { loop_id: String, attempts: u32 },
    Failed { loop_id: String, error: String },
}

impl RecoveryResult {
    #[must_use]
    pub fn loop_id(&self) -> &str {
        match self {
            Self::Recovered(plan) => &plan.loop_id,
            Self::NotCrashed { loop_id }
            | Self::Aborted { loop_id, .. }
            | Self::Failed { loop_id, .. } => loop_id,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Recovered(_))
    }
}

/// Tally of a batch recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub recovered: usize,
    pub not_crashed: usize,
    pub aborted: usize,
    pub failed: usize,
    /// Stale-but-alive loops, which are reported and left alone.
    pub stale: usize,
}

impl RecoveryStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.recovered + self.not_crashed + self.aborted + self.failed
    }
}

/// Detects crashes and restores loops.
pub struct RecoveryEngine {
    config: RecoveryConfig,
    state: Arc<LoopStateStore>,
    checkpoints: Arc<CheckpointStore>,
    probe: Arc<dyn ProcessProbe>,
}

impl RecoveryEngine {
    pub fn new(
        config: RecoveryConfig,
        state: Arc<LoopStateStore>,
        checkpoints: Arc<CheckpointStore>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            config,
            state,
            checkpoints,
            probe,
        }
    }

    /// Returns a report if the loop should be running but its owner is gone.
    pub fn detect_crash(&self, loop_id: &str) -> Result<Option<CrashReport>> {
        let record = self.state.get_loop(loop_id)?;
        if !record.status.is_active() || self.probe.is_alive(record.pid) {
            return Ok(None);
        }

        Ok(Some(CrashReport {
            loop_id: record.id,
            pid: record.pid,
            status: record.status,
            iteration: record.iteration,
        }))
    }

    /// Choose how to resume, most specific first.
    #[must_use]
    pub fn determine_recovery_strategy(record: &LoopRecord) -> RecoveryStrategy {
        if let Some(subtask) = record.active_subtask.as_ref().filter(|s| !s.trim().is_empty()) {
            return RecoveryStrategy::ResumeSubtask {
                subtask: subtask.clone(),
            };
        }
        if let Some(analysis) = record.last_analysis.as_ref().filter(|a| a.viable) {
            return RecoveryStrategy::ContinueExternal {
                summary: analysis.summary.clone(),
            };
        }
        RecoveryStrategy::RestartWithLearnings {
            learnings: record.learnings.clone(),
        }
    }

    /// Overwrite the loop's state with a checkpoint (newest if `None`).
    ///
    /// The result has status recovering and the checkpoint's timestamp. The
    /// attempt counter and any learnings recorded after the checkpoint are
    /// kept.
    ///
    /// # Errors
    ///
    /// `CheckpointMissing` when the loop has no (such) checkpoint.
    pub fn restore_from_checkpoint(
        &self,
        loop_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Restored> {
        let checkpoint = match checkpoint_id {
            Some(id) => self.checkpoints.get(loop_id, id)?,
            None => self
                .checkpoints
                .latest(loop_id)?
                .ok_or_else(|| FleetError::CheckpointMissing {
                    loop_id: loop_id.to_string(),
                    checkpoint: "latest".to_string(),
                })?,
        };

        let current = self.state.get_loop(loop_id)?;
        let mut record = checkpoint.record.clone();
        record.id = current.id.clone();
        record.status = LoopStatus::Recovering;
        record.updated_at = checkpoint.created_at;
        record.recovery_attempts = current.recovery_attempts;
        for learning in current.learnings {
            record.add_learning(learning);
        }

        let record = self.state.replace_loop(loop_id, record)?;
        info!(
            loop_id,
            checkpoint = %checkpoint.id,
            iteration = record.iteration,
            "Restored loop from checkpoint"
        );
        Ok(Restored {
            checkpoint_id: checkpoint.id,
            record,
        })
    }

    /// Hand a recovering loop to a new owner process.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` unless the loop is recovering
    /// - `ProcessCrashed` if `pid` is not alive
    pub fn mark_recovered(&self, loop_id: &str, pid: u32) -> Result<LoopRecord> {
        if !self.probe.is_alive(pid) {
            return Err(FleetError::ProcessCrashed {
                loop_id: loop_id.to_string(),
                pid,
            });
        }

        let record = self.state.try_update_loop(loop_id, |r| {
            if r.status != LoopStatus::Recovering {
                return Err(FleetError::transition(loop_id, r.status, LoopStatus::Running));
            }
            r.status = LoopStatus::Running;
            r.pid = pid;
            Ok(())
        })?;
        info!(loop_id, pid, "Loop recovered");
        Ok(record)
    }

    /// Recover one loop if it crashed.
    ///
    /// The crash is claimed under the loop's lease: only a caller that still
    /// finds the loop active moves it to recovering and counts the attempt.
    /// The strategy is chosen from the record as it was at the crash, before
    /// any checkpoint is restored.
    pub fn recover(&self, loop_id: &str) -> Result<RecoveryResult> {
        let Some(crash) = self.detect_crash(loop_id)? else {
            return Ok(RecoveryResult::NotCrashed {
                loop_id: loop_id.to_string(),
            });
        };

        let max_attempts = self.config.max_recovery_attempts;
        let claimed = self.state.try_update_loop(loop_id, |r| {
            if !r.status.is_active() {
                return Err(FleetError::transition(loop_id, r.status, LoopStatus::Recovering));
            }
            if r.recovery_attempts >= max_attempts {
                r.status = LoopStatus::Aborted;
            } else {
                r.status = LoopStatus::Recovering;
                r.recovery_attempts += 1;
            }
            Ok(())
        });
        let crashed = match claimed {
            Ok(record) => record,
            Err(FleetError::InvalidTransition { .. }) => {
                info!(loop_id, "Loop already claimed by another recovery");
                return Ok(RecoveryResult::NotCrashed {
                    loop_id: loop_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        if crashed.status == LoopStatus::Aborted {
            warn!(
                loop_id,
                attempts = crashed.recovery_attempts,
                "Recovery attempts exhausted, loop aborted"
            );
            return Ok(RecoveryResult::Aborted {
                loop_id: loop_id.to_string(),
                attempts: crashed.recovery_attempts,
            });
        }
        info!(
            loop_id,
            pid = crash.pid,
            attempt = crashed.recovery_attempts,
            "Recovering crashed loop"
        );

        let strategy = Self::determine_recovery_strategy(&crashed);
        let mut record = crashed;
        let mut checkpoint = None;
        if self.config.restore_on_recover {
            match self.restore_from_checkpoint(loop_id, None) {
                Ok(restored) => {
                    checkpoint = Some(restored.checkpoint_id);
                    record = restored.record;
                }
                Err(FleetError::CheckpointMissing { .. }) => {
                    warn!(loop_id, "No checkpoint to restore, recovering from current state");
                }
                Err(e) => return Err(e),
            }
        }

        let context = self.render_context(&record, &strategy, checkpoint.as_deref());
        Ok(RecoveryResult::Recovered(RecoveryPlan {
            loop_id: loop_id.to_string(),
            strategy,
            checkpoint,
            attempt: record.recovery_attempts,
            context,
        }))
    }

    /// Recover every crashed loop among `signals`.
    pub fn recover_all(&self, signals: &[LivenessSignal]) -> (Vec<RecoveryResult>, RecoveryStats) {
        let mut results = Vec::new();
        let mut stats = RecoveryStats::default();

        for signal in signals {
            let loop_id = match signal {
                LivenessSignal::Crashed { loop_id, .. } => loop_id,
                LivenessSignal::Stale { loop_id, age, .. } => {
                    warn!(
                        loop_id = %loop_id,
                        age_secs = age.map(|a| a.as_secs()),
                        "Loop appears hung; owner still alive, not recovering"
                    );
                    stats.stale += 1;
                    continue;
                }
            };

            let result = self.recover(loop_id).unwrap_or_else(|e| RecoveryResult::Failed {
                loop_id: loop_id.clone(),
                error: e.to_string(),
            });
            match &result {
                RecoveryResult::Recovered(_) => stats.recovered += 1,
                RecoveryResult::NotCrashed { .. } => stats.not_crashed += 1,
                RecoveryResult::Aborted { .. } => stats.aborted += 1,
                RecoveryResult::Failed { error, .. } => {
                    warn!(loop_id = %loop_id, error = %error, "Recovery failed");
                    stats.failed += 1;
                }
            }
            results.push(result);
        }

        (results, stats)
    }

    fn render_context(
        &self,
        record: &LoopRecord,
        strategy: &RecoveryStrategy,
        checkpoint: Option<&str>,
    ) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Recovery Context");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Loop `{}` was interrupted at iteration {} of {} (recovery attempt {} of {}).",
            record.id,
            record.iteration,
            record.max_iterations,
            record.recovery_attempts,
            self.config.max_recovery_attempts
        );
        if !record.completion_criteria.is_empty() {
            let _ = writeln!(out, "Completion criteria: {}", record.completion_criteria);
        }
        match checkpoint {
            Some(id) => {
                let _ = writeln!(out, "State was restored from checkpoint `{id}`.");
            }
            None => {
                let _ = writeln!(out, "No checkpoint was available; state is as last written.");
            }
        }
        let _ = writeln!(out);

        match strategy {
            RecoveryStrategy::ResumeSubtask { subtask } => {
                let _ = writeln!(out, "### Next step");
                let _ = writeln!(out, "Resume the subtask that was in progress: {subtask}");
                let _ = writeln!(out, "Check which parts of it are already done before redoing work.");
            }
            RecoveryStrategy::ContinueExternal { summary } => {
                let _ = writeln!(out, "### Next step");
                let _ = writeln!(out, "The last analysis judged the approach viable: {summary}");
                let _ = writeln!(out, "Continue from where the previous session stopped.");
            }
            RecoveryStrategy::RestartWithLearnings { .. } => {
                let _ = writeln!(out, "### Next step");
                let _ = writeln!(
                    out,
                    "Restart the task. Avoid repeating approaches that already failed."
                );
            }
        }

        if !record.learnings.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "### Learnings so far");
            for learning in &record.learnings {
                let _ = writeln!(out, "- {learning}");
            }
        }
        out
    }
}

//! Fleet facade.
//!
//! Builds one instance of every component for a fleet root and wires them
//! together. There are no process-wide singletons: two `Fleet` values over
//! the same root coordinate exactly like two processes would, through the
//! lease lock and the files on disk.
//!
//! ```text
//!               ┌──────────────┐
//!               │ FileLeaseLock│
//!               └──────┬───────┘
//!          ┌───────────┼────────────┐
//!     ┌────▼───┐  ┌────▼─────┐      │
//!     │Registry│◄─┤StateStore│      │
//!     └────┬───┘  └────┬─────┘      │
//!          │      ┌────▼──────┐  ┌──▼──────────┐
//!          │      │Checkpoints│  │   Recovery  │
//!          │      └───────────┘  └─────────────┘
//!     ┌────▼─────┐
//!     │ Liveness │
//!     └──────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, RealGitOperations};
use crate::config::FleetConfig;
use crate::control::{ControlAction, ControlDecision, ControlLoop, IterationOutcome, ProfileKind};
use crate::error::{FleetError, Result};
use crate::liveness::{LivenessMonitor, LivenessSignal, SystemProbe};
use crate::lock::{FileLeaseLock, LeaseLock};
use crate::recovery::{RecoveryEngine, RecoveryResult, RecoveryStats};
use crate::registry::Registry;
use crate::state::{IterationRecord, LoopConfig, LoopRecord, LoopStateStore, LoopStatus};
use crate::storage::{FilePersistence, Persistence};
use crate::testing::{GitOperations, ProcessProbe};

/// All fleet components for one root directory.
pub struct Fleet {
    config: FleetConfig,
    root: PathBuf,
    registry: Arc<Registry>,
    state: Arc<LoopStateStore>,
    liveness: Arc<LivenessMonitor>,
    checkpoints: Arc<CheckpointStore>,
    recovery: RecoveryEngine,
}

impl Fleet {
    /// Open the fleet for a project using the real process table and git.
    pub fn open(project_dir: &Path, config: FleetConfig) -> Result<Self> {
        let root = config.resolve_state_dir(project_dir);
        Self::with_components(
            &root,
            config,
            Arc::new(SystemProbe::new()),
            Arc::new(RealGitOperations::new(project_dir.to_path_buf())),
        )
    }

    /// Open the fleet at `root` with explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` fails validation, or an I/O error
    /// if the root cannot be created.
    pub fn with_components(
        root: &Path,
        config: FleetConfig,
        probe: Arc<dyn ProcessProbe>,
        git: Arc<dyn GitOperations>,
    ) -> Result<Self> {
        config.validate().map_err(|reason| FleetError::InvalidConfig {
            field: "fleet".to_string(),
            reason,
        })?;
        std::fs::create_dir_all(root)?;

        let store: Arc<dyn Persistence> = Arc::new(FilePersistence::new());
        let lock: Arc<dyn LeaseLock> =
            Arc::new(FileLeaseLock::new(config.lock.clone(), Arc::clone(&probe)));
        let lease = config.lock.lease_duration();

        let registry = Arc::new(Registry::new(
            root,
            config.max_concurrent_loops,
            Arc::clone(&lock),
            Arc::clone(&store),
            lease,
        ));
        let state = Arc::new(LoopStateStore::new(
            root,
            Arc::clone(&registry),
            Arc::clone(&lock),
            Arc::clone(&store),
            lease,
        ));
        let liveness = Arc::new(LivenessMonitor::new(
            root,
            Arc::clone(&store),
            Arc::clone(&probe),
            Arc::clone(&registry),
        ));
        let checkpoints = Arc::new(CheckpointStore::new(
            root,
            config.checkpoints.clone(),
            Arc::clone(&store),
            git,
        ));
        let recovery = RecoveryEngine::new(
            config.recovery.clone(),
            Arc::clone(&state),
            Arc::clone(&checkpoints),
            probe,
        );

        debug!(root = %root.display(), "Fleet opened");
        Ok(Self {
            config,
            root: root.to_path_buf(),
            registry,
            state,
            liveness,
            checkpoints,
            recovery,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn state(&self) -> &Arc<LoopStateStore> {
        &self.state
    }

    #[must_use]
    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }

    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    // ------------------------------------------------------------------------
    // Orchestration
    // ------------------------------------------------------------------------

    /// Create a loop, write its first heartbeat and an initial checkpoint.
    pub fn create_loop(&self, config: &LoopConfig) -> Result<LoopRecord> {
        let record = self.state.create_loop(config)?;
        self.liveness
            .record_heartbeat(&record.id, record.iteration, record.status)?;
        self.checkpoints.create(&record)?;
        Ok(record)
    }

    /// Controller for a loop, resumed from its snapshot when one exists.
    pub fn control_loop(&self, loop_id: &str) -> Result<ControlLoop> {
        let config = self.config.control.clone();
        Ok(match self.state.load_control(loop_id)? {
            Some(snapshot) => ControlLoop::restore(config, snapshot),
            None => ControlLoop::new(config, ProfileKind::Standard),
        })
    }

    /// Run one iteration outcome through the loop's controller.
    ///
    /// Advances the iteration counter, records learnings, persists the
    /// iteration summary and controller snapshot, refreshes the heartbeat
    /// and takes a checkpoint. A pause or abort decision is reflected in the
    /// loop status.
    pub fn process_iteration(
        &self,
        loop_id: &str,
        outcome: &IterationOutcome,
    ) -> Result<ControlDecision> {
        let current = self.state.get_loop(loop_id)?;
        if current.status.is_terminal() {
            return Err(FleetError::transition(loop_id, current.status, LoopStatus::Running));
        }

        let mut controller = self.control_loop(loop_id)?;
        let decision = controller.process(outcome, &current);

        let record = self.state.update_loop(loop_id, |r| {
            r.iteration += 1;
            for learning in &outcome.learnings {
                r.add_learning(learning.clone());
            }
            if let Some(pid) = outcome.pid {
                r.pid = pid;
            }
            match decision.action {
                ControlAction::Abort => r.status = LoopStatus::Aborted,
                ControlAction::Pause => r.status = LoopStatus::Paused,
                ControlAction::Continue | ControlAction::Adjust => {}
            }
        })?;

        self.state.record_iteration(
            loop_id,
            &IterationRecord {
                iteration: record.iteration,
                timestamp: Utc::now(),
                completion: outcome.completion,
                quality: outcome.quality,
                errors: outcome.errors.len(),
                blockers: outcome.blockers.clone(),
                action: decision.action.to_string(),
                control_signal: decision.control_signal,
            },
        )?;
        self.state.save_control(loop_id, &controller.snapshot())?;
        self.liveness
            .record_heartbeat(loop_id, record.iteration, record.status)?;
        if let Err(e) = self.checkpoints.create(&record) {
            warn!(loop_id, error = %e, "Checkpoint after iteration failed");
        }

        info!(
            loop_id,
            iteration = record.iteration,
            action = %decision.action,
            signal = decision.control_signal,
            "Iteration processed"
        );
        Ok(decision)
    }

    /// Sweep all active loops using the configured stale threshold.
    pub fn sweep(&self) -> Result<Vec<LivenessSignal>> {
        self.liveness
            .sweep_registry(self.config.liveness.stale_threshold())
    }

    /// Sweep, then recover every crashed loop found.
    pub fn sweep_and_recover(&self) -> Result<(Vec<RecoveryResult>, RecoveryStats)> {
        let signals = self.sweep()?;
        Ok(self.recovery.recover_all(&signals))
    }

    /// Drop registry entries whose state directories no longer exist.
    pub fn reconcile(&self) -> Result<Vec<String>> {
        let known = self.state.loop_ids()?;
        self.registry.reconcile(&known)
    }

    /// Archive a finished loop and forget its heartbeat.
    pub fn archive_loop(&self, loop_id: &str) -> Result<PathBuf> {
        let dest = self.state.archive_loop(loop_id)?;
        self.liveness.remove_heartbeat(loop_id)?;
        Ok(dest)
    }
}

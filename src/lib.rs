//! Ralph Fleet - supervisory layer for concurrent autonomous loops
//!
//! Runs many long-lived Claude Code loops side by side on one machine and
//! keeps them honest: every loop is registered under a capacity limit, its
//! state is persisted through lease-guarded atomic writes, its owner process
//! is watched for crashes and hangs, and each iteration is fed through a PID
//! style controller that decides whether to continue, adjust, pause or abort.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`lock`] - Time-bounded file leases with stale-holder reclamation
//! - [`storage`] - Atomic persistence port and JSON helpers
//! - [`registry`] - Capacity-limited index of active loops
//! - [`state`] - Per-loop durable records, iterations and archiving
//! - [`liveness`] - Heartbeats, process probing and sweeps
//! - [`checkpoint`] - Compressed snapshots with VCS state
//! - [`control`] - Metrics, gain scheduling, alarms and the control loop
//! - [`recovery`] - Crash detection and checkpoint restore
//! - [`fleet`] - Facade wiring one instance of everything together
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Error types
//! - [`testing`] - Traits and mocks for the OS and git seams
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_fleet::{Fleet, FleetConfig, IterationOutcome, LoopConfig};
//!
//! let fleet = Fleet::open(project_dir, FleetConfig::load(project_dir)?)?;
//! let record = fleet.create_loop(&LoopConfig::new("auth refresh").with_max_iterations(30))?;
//!
//! let decision = fleet.process_iteration(&record.id, &IterationOutcome::new(0.4, 0.9))?;
//! println!("{}: {:.2}", decision.action, decision.control_signal);
//! ```

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod error;
pub mod fleet;
pub mod liveness;
pub mod lock;
pub mod recovery;
pub mod registry;
pub mod state;
pub mod storage;
pub mod testing;

// Re-export commonly used types
pub use error::{FleetError, Result};

pub use config::FleetConfig;
pub use fleet::Fleet;

pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore};
pub use control::{
    Alarm, AlarmType, ControlAction, ControlDecision, ControlLoop, ControlSnapshot,
    IterationOutcome, Severity,
};
pub use liveness::{Heartbeat, LivenessMonitor, LivenessSignal};
pub use lock::{FileLeaseLock, Holder, Lease, LeaseLock};
pub use recovery::{RecoveryEngine, RecoveryPlan, RecoveryResult, RecoveryStrategy};
pub use registry::{Registry, RegistryEntry};
pub use state::{LoopConfig, LoopRecord, LoopStateStore, LoopStatus, Priority};

// Re-export testing types for convenience
pub use testing::{GitOperations, MockGitOperations, MockProcessProbe, ProcessProbe};

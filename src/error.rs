//! Custom error types for ralph-fleet.
//!
//! This module provides structured error types that carry enough context
//! for the orchestrator to tell the operator what went wrong and what to do
//! about it (current vs. maximum loop count, the override flag, the loop id).
//!
//! Crash detection and alarms are *signals*, not errors: they are returned
//! as values by the liveness monitor and the control loop and never surface
//! through this type.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for fleet operations
#[derive(Error, Debug)]
pub enum FleetError {
    // =========================================================================
    // Coordination Errors
    // =========================================================================
    /// Lease could not be obtained within the bounded retry budget
    #[error(
        "Timed out acquiring lease on {resource} after {attempts} attempts (held by {holder})"
    )]
    LockTimeout {
        resource: PathBuf,
        holder: String,
        attempts: u32,
    },

    /// The lease was reclaimed by another holder before the write completed
    #[error("Lease on {resource} was lost (token {token} superseded)")]
    LeaseLost { resource: PathBuf, token: u64 },

    /// Registry is full and no override was requested
    #[error(
        "Capacity exceeded: {current}/{limit} loops active; a {attempted}th loop would need {coordination_paths} coordination paths. Re-run with --allow-over-capacity to override"
    )]
    CapacityExceeded {
        current: usize,
        limit: usize,
        attempted: usize,
        coordination_paths: usize,
    },

    // =========================================================================
    // Loop State Errors
    // =========================================================================
    /// No state record exists for the given loop id
    #[error("Loop not found: {loop_id}")]
    LoopNotFound { loop_id: String },

    /// A loop with this id is already registered
    #[error("Loop already registered: {loop_id}")]
    LoopAlreadyRegistered { loop_id: String },

    /// Primary record and its backup are both unreadable
    #[error("State for loop {loop_id} is corrupted ({path}): {reason}")]
    StateCorrupted {
        loop_id: String,
        path: PathBuf,
        reason: String,
    },

    /// Requested status change is not allowed from the current status
    #[error("Loop {loop_id}: cannot transition from {from} to {to}")]
    InvalidTransition {
        loop_id: String,
        from: String,
        to: String,
    },

    // =========================================================================
    // Recovery Errors
    // =========================================================================
    /// Liveness probe negative for a process expected to be running
    #[error("Process {pid} owning loop {loop_id} is not running")]
    ProcessCrashed { loop_id: String, pid: u32 },

    /// No checkpoint matched the request
    #[error("No checkpoint {checkpoint} for loop {loop_id}")]
    CheckpointMissing { loop_id: String, checkpoint: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FleetError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a loop-not-found error
    pub fn not_found(loop_id: impl Into<String>) -> Self {
        Self::LoopNotFound {
            loop_id: loop_id.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a capacity error for the given active count and limit.
    ///
    /// The coordination path estimate is `n * (n - 1) / 2` for the attempted
    /// loop count `n`.
    pub fn capacity(current: usize, limit: usize) -> Self {
        let attempted = current + 1;
        Self::CapacityExceeded {
            current,
            limit,
            attempted,
            coordination_paths: coordination_paths(attempted),
        }
    }

    /// Create an invalid transition error
    pub fn transition(
        loop_id: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            loop_id: loop_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if retrying the same call later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::LeaseLost { .. } | Self::CapacityExceeded { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LockTimeout { .. } | Self::LeaseLost { .. } => 2,
            Self::CapacityExceeded { .. } => 3,
            Self::LoopNotFound { .. } | Self::CheckpointMissing { .. } => 4,
            Self::StateCorrupted { .. } => 5,
            Self::ProcessCrashed { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Number of pairwise coordination paths among `n` concurrent loops.
#[must_use]
pub fn coordination_paths(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Type alias for fleet results
pub type Result<T> = std::result::Result<T, FleetError>;

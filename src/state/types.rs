//! Loop record types.
//!
//! A [`LoopRecord`] is the durable state of one supervised loop. It is
//! written only by the process that owns the loop and mirrored in summary
//! form into the registry.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a loop.
///
/// # Example
///
/// ```
/// use ralph_fleet::state::LoopStatus;
///
/// assert!(LoopStatus::Completed.is_terminal());
/// assert!(LoopStatus::Running.is_active());
/// assert_eq!(LoopStatus::Recovering.to_string(), "recovering");
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Paused,
    /// Blocked on something outside the loop (review, CI, a human).
    Waiting,
    /// Final verification in progress.
    Completing,
    /// Restored from a checkpoint, waiting for a new owner process.
    Recovering,
    Aborted,
    Completed,
}

impl LoopStatus {
    /// Returns true for statuses that end a loop's life.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Completed)
    }

    /// Returns true if an owner process is expected to be driving the loop.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Completing)
    }

    /// Returns true if the loop may move from `self` to `next`.
    ///
    /// Terminal statuses are final.
    #[must_use]
    pub fn can_transition_to(&self, next: LoopStatus) -> bool {
        *self == next || !self.is_terminal()
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Waiting => "waiting",
            Self::Completing => "completing",
            Self::Recovering => "recovering",
            Self::Aborted => "aborted",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Scheduling priority of a loop.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    ValueEnum,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Outcome of the most recent analysis of a loop's work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    /// Whether the analysed approach can be continued as-is.
    pub viable: bool,
    pub summary: String,
}

/// Durable state of one loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopRecord {
    pub id: String,
    pub status: LoopStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Pid of the process currently driving the loop.
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Human-readable definition of done.
    pub completion_criteria: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: BTreeSet<String>,

    // Recovery context
    #[serde(default)]
    pub active_subtask: Option<String>,
    #[serde(default)]
    pub last_analysis: Option<Analysis>,
    #[serde(default)]
    pub learnings: Vec<String>,
    #[serde(default)]
    pub recovery_attempts: u32,
}

impl LoopRecord {
    /// Fraction of the iteration budget consumed, in `[0, 1]`.
    ///
    /// # Example
    ///
    /// ```
    /// use ralph_fleet::state::{LoopConfig, LoopRecord};
    ///
    /// let mut record = LoopRecord::new("demo-abc123", &LoopConfig::new("demo").with_max_iterations(40));
    /// record.iteration = 10;
    /// assert!((record.progress() - 0.25).abs() < f64::EPSILON);
    /// ```
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.max_iterations == 0 {
            return 1.0;
        }
        (f64::from(self.iteration) / f64::from(self.max_iterations)).min(1.0)
    }

    /// Create a fresh running record from a creation request.
    #[must_use]
    pub fn new(id: impl Into<String>, config: &LoopConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: LoopStatus::Running,
            iteration: 0,
            max_iterations: config.max_iterations,
            pid: config.pid,
            started_at: now,
            updated_at: now,
            completion_criteria: config.completion_criteria.clone(),
            priority: config.priority,
            tags: config.tags.clone(),
            active_subtask: None,
            last_analysis: None,
            learnings: Vec::new(),
            recovery_attempts: 0,
        }
    }

    /// Append a learning unless an identical one is already recorded.
    pub fn add_learning(&mut self, learning: impl Into<String>) {
        let learning = learning.into();
        if !self.learnings.contains(&learning) {
            self.learnings.push(learning);
        }
    }
}

/// Request to create a loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Human-readable name; slugified into the loop id.
    pub name: String,
    pub max_iterations: u32,
    pub completion_criteria: String,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
    /// Owner pid. Defaults to the calling process.
    pub pid: u32,
    /// Register even when the registry is at capacity.
    pub allow_over_capacity: bool,
}

impl LoopConfig {
    /// Default iteration budget for a new loop.
    pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            completion_criteria: String::new(),
            priority: Priority::Normal,
            tags: BTreeSet::new(),
            pid: std::process::id(),
            allow_over_capacity: false,
        }
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    #[must_use]
    pub fn with_completion_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.completion_criteria = criteria.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    #[must_use]
    pub fn allow_over_capacity(mut self, allow: bool) -> Self {
        self.allow_over_capacity = allow;
        self
    }
}

/// Summary of one completed iteration, stored under `iterations/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub completion: f64,
    pub quality: f64,
    pub errors: usize,
    pub blockers: Vec<String>,
    /// Control action chosen for this iteration, e.g. `continue`.
    pub action: String,
    pub control_signal: f64,
}

/// Turn a display name into an id-safe slug.
///
/// Lowercases ASCII alphanumerics and collapses every other run of
/// characters into a single `-`.
///
/// # Example
///
/// ```
/// use ralph_fleet::state::slugify;
///
/// assert_eq!(slugify("Fix Auth: token refresh!"), "fix-auth-token-refresh");
/// assert_eq!(slugify("***"), "loop");
/// ```
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug: String = slug.chars().take(40).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "loop".to_string()
    } else {
        slug.to_string()
    }
}

/// Generate a loop id: slug plus six random hex characters.
#[must_use]
pub fn generate_loop_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", slugify(name), &suffix[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(LoopStatus::Aborted.is_terminal());
        assert!(LoopStatus::Completed.is_terminal());
        assert!(!LoopStatus::Recovering.is_terminal());
        assert!(!LoopStatus::Paused.is_active());
    }

    #[test]
    fn test_terminal_status_is_final() {
        assert!(!LoopStatus::Completed.can_transition_to(LoopStatus::Running));
        assert!(LoopStatus::Completed.can_transition_to(LoopStatus::Completed));
        assert!(LoopStatus::Paused.can_transition_to(LoopStatus::Running));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&LoopStatus::Recovering).unwrap();
        assert_eq!(json, "\"recovering\"");
    }

    #[test]
    fn test_generate_loop_id_format() {
        let id = generate_loop_id("Fix flaky CI");
        let (slug, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(slug, "fix-flaky-ci");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_loop_id("same");
        let b = generate_loop_id("same");
        assert_ne!(a, b);
    }

    #[test]
    fn test_progress_handles_zero_budget() {
        let record = LoopRecord::new("x-000000", &LoopConfig::new("x").with_max_iterations(0));
        assert!((record.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_add_learning_dedups() {
        let mut record = LoopRecord::new("x-000000", &LoopConfig::new("x"));
        record.add_learning("run migrations first");
        record.add_learning("run migrations first");
        assert_eq!(record.learnings.len(), 1);
    }

    #[test]
    fn test_old_records_without_recovery_fields_parse() {
        let json = r#"{
            "id": "a-123456",
            "status": "running",
            "iteration": 3,
            "max_iterations": 10,
            "pid": 42,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "completion_criteria": "tests pass"
        }"#;
        let record: LoopRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.priority, Priority::Normal);
        assert_eq!(record.recovery_attempts, 0);
    }
}

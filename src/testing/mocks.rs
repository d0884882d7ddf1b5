//! Mock implementations of testing traits.
//!
//! These mocks provide controllable test doubles for external dependencies,
//! enabling deterministic unit tests.

use super::traits::{GitOperations, ProcessProbe};
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Mock implementation of git operations.
///
/// # Example
///
/// ```rust,ignore
/// let git = MockGitOperations::new()
///     .with_commit_hash("abc123")
///     .with_modified_files(vec!["src/lib.rs".into()]);
///
/// assert_eq!(git.get_commit_hash().unwrap(), "abc123");
/// ```
#[derive(Debug, Clone)]
pub struct MockGitOperations {
    commit_hash: String,
    branch: String,
    modified_files: Vec<String>,
    fail_with: Option<String>,
}

impl Default for MockGitOperations {
    fn default() -> Self {
        Self {
            commit_hash: String::new(),
            branch: "main".to_string(),
            modified_files: Vec::new(),
            fail_with: None,
        }
    }
}

impl MockGitOperations {
    /// Create a new mock with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the commit hash to return.
    #[must_use]
    pub fn with_commit_hash(mut self, hash: &str) -> Self {
        self.commit_hash = hash.to_string();
        self
    }

    /// Set the current branch name.
    #[must_use]
    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = branch.to_string();
        self
    }

    /// Set the list of modified files.
    #[must_use]
    pub fn with_modified_files(mut self, files: Vec<String>) -> Self {
        self.modified_files = files;
        self
    }

    /// Make every call fail, as if git were missing.
    #[must_use]
    pub fn failing(mut self, error: &str) -> Self {
        self.fail_with = Some(error.to_string());
        self
    }
}

impl GitOperations for MockGitOperations {
    fn get_commit_hash(&self) -> Result<String> {
        if let Some(error) = &self.fail_with {
            bail!("{error}");
        }
        Ok(self.commit_hash.clone())
    }

    fn get_branch(&self) -> Result<String> {
        if let Some(error) = &self.fail_with {
            bail!("{error}");
        }
        Ok(self.branch.clone())
    }

    fn get_modified_files(&self) -> Result<Vec<String>> {
        if let Some(error) = &self.fail_with {
            bail!("{error}");
        }
        Ok(self.modified_files.clone())
    }
}

/// Mock process probe with an explicit set of live pids.
///
/// Clones share the same pid set, so a test can hand one clone to the
/// fleet and kill "processes" through another.
///
/// # Example
///
/// ```rust,ignore
/// let probe = MockProcessProbe::new().with_alive(&[100, 200]);
/// assert!(probe.is_alive(100));
/// probe.kill(100);
/// assert!(!probe.is_alive(100));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockProcessProbe {
    alive: Arc<RwLock<HashSet<u32>>>,
    probe_count: Arc<AtomicU32>,
}

impl MockProcessProbe {
    /// Create a probe where no process is alive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the given pids as alive.
    #[must_use]
    pub fn with_alive(self, pids: &[u32]) -> Self {
        for pid in pids {
            self.spawn(*pid);
        }
        self
    }

    /// Mark a pid as alive.
    pub fn spawn(&self, pid: u32) {
        if let Ok(mut alive) = self.alive.write() {
            alive.insert(pid);
        }
    }

    /// Mark a pid as dead.
    pub fn kill(&self, pid: u32) {
        if let Ok(mut alive) = self.alive.write() {
            alive.remove(&pid);
        }
    }

    /// Number of probes performed so far.
    pub fn probe_count(&self) -> u32 {
        self.probe_count.load(Ordering::SeqCst)
    }
}

impl ProcessProbe for MockProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        self.alive
            .read()
            .map(|alive| alive.contains(&pid))
            .unwrap_or(false)
    }
}

//! Trait definitions for testable abstractions.
//!
//! These traits abstract the operating system and version control so the
//! lease lock, liveness monitor and checkpoint store can be unit tested
//! without real processes or git repositories.

use anyhow::Result;

/// Abstraction for OS process-existence probing.
///
/// # Example
///
/// ```rust,ignore
/// use ralph_fleet::testing::ProcessProbe;
///
/// fn owner_gone(probe: &dyn ProcessProbe, pid: u32) -> bool {
///     !probe.is_alive(pid)
/// }
/// ```
pub trait ProcessProbe: Send + Sync {
    /// Returns true if a process with this pid exists.
    ///
    /// Implementations must not affect the target process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Abstraction for git operations.
///
/// Enables checkpoint capture without real git repositories.
///
/// # Example
///
/// ```rust,ignore
/// use ralph_fleet::testing::GitOperations;
///
/// fn head(git: &impl GitOperations) -> String {
///     git.get_commit_hash().unwrap_or_default()
/// }
/// ```
pub trait GitOperations: Send + Sync {
    /// Get the current HEAD commit hash.
    ///
    /// # Errors
    ///
    /// Returns an error if git is not available or not in a repository.
    fn get_commit_hash(&self) -> Result<String>;

    /// Get the current branch name.
    ///
    /// # Errors
    ///
    /// Returns an error if not in a git repository.
    fn get_branch(&self) -> Result<String>;

    /// Get list of modified files in the working tree.
    fn get_modified_files(&self) -> Result<Vec<String>>;
}

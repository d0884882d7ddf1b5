//! Testing infrastructure for ralph-fleet.
//!
//! This module provides traits, mocks and fixtures for testing the
//! supervisory layer without real processes or git repositories.
//!
//! # Architecture
//!
//! - **Traits**: Abstractions for external dependencies (process table, git)
//! - **Mocks**: Test doubles that implement the traits with controllable behavior
//! - **Fixtures**: A temporary fleet root with a mock probe (test-only)
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_fleet::testing::{MockGitOperations, MockProcessProbe};
//!
//! let git = MockGitOperations::new().with_commit_hash("abc123");
//! let probe = MockProcessProbe::new().with_alive(&[4242]);
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;
pub mod traits;

// Re-export commonly used types
#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_git_operations_default() {
        let git = MockGitOperations::default();
        assert!(git.get_commit_hash().unwrap().is_empty());
        assert_eq!(git.get_branch().unwrap(), "main");
        assert!(git.get_modified_files().unwrap().is_empty());
    }

    #[test]
    fn test_mock_git_operations_failing() {
        let git = MockGitOperations::new().failing("git not installed");
        let err = git.get_commit_hash().unwrap_err();
        assert!(err.to_string().contains("git not installed"));
    }

    #[test]
    fn test_mock_probe_shared_between_clones() {
        let probe = MockProcessProbe::new().with_alive(&[10, 20]);
        let handle = probe.clone();

        assert!(probe.is_alive(10));
        handle.kill(10);
        assert!(!probe.is_alive(10));
        assert!(probe.is_alive(20));
        assert_eq!(probe.probe_count(), 3);
    }

    #[test]
    fn test_mock_probe_defaults_to_dead() {
        let probe = MockProcessProbe::new();
        assert!(!probe.is_alive(1));
    }
}

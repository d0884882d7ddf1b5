//! Test fixtures for creating reproducible fleet environments.
//!
//! A [`TestFleet`] is a complete fleet over a temporary root, wired to a
//! mock process table and a mock git repository.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::FleetConfig;
use crate::fleet::Fleet;
use crate::state::{LoopConfig, LoopRecord};
use crate::testing::{MockGitOperations, MockProcessProbe};

/// Pid the fixture treats as a live loop owner unless killed.
pub const LIVE_PID: u32 = 4242;

/// A fleet over a temporary directory.
///
/// Automatically cleans up when dropped.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = TestFleet::new();
/// let record = fixture.create("demo");
/// fixture.probe.kill(LIVE_PID);
/// ```
pub struct TestFleet {
    pub fleet: Fleet,
    pub probe: MockProcessProbe,
    temp_dir: TempDir,
}

impl TestFleet {
    /// Fleet with default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(FleetConfig::default())
    }

    /// Fleet with a custom configuration.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created or the config is
    /// invalid.
    #[must_use]
    pub fn with_config(config: FleetConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        // Leases are held by this process, so it must read as alive too.
        let probe = MockProcessProbe::new().with_alive(&[LIVE_PID, std::process::id()]);
        let git = MockGitOperations::new()
            .with_commit_hash("0123456789abcdef")
            .with_modified_files(vec!["src/lib.rs".to_string()]);
        let fleet = Fleet::with_components(
            temp_dir.path(),
            config,
            Arc::new(probe.clone()),
            Arc::new(git),
        )
        .expect("Failed to open test fleet");

        Self {
            fleet,
            probe,
            temp_dir,
        }
    }

    /// Root of the fleet.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Create a loop owned by [`LIVE_PID`].
    ///
    /// # Panics
    ///
    /// Panics if creation fails.
    pub fn create(&self, name: &str) -> LoopRecord {
        self.fleet
            .create_loop(&LoopConfig::new(name).with_pid(LIVE_PID))
            .expect("Failed to create loop")
    }
}

impl Default for TestFleet {
    fn default() -> Self {
        Self::new()
    }
}

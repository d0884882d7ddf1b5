//! Fleet configuration.
//!
//! Configuration is read from `.ralph/fleet.json` in the project directory.
//! Every field has a serde default, so an absent file or a partial file both
//! produce a usable configuration. Component-level settings live next to the
//! component they tune and are aggregated here.
//!
//! # Example
//!
//! ```json
//! {
//!   "maxConcurrentLoops": 6,
//!   "lock": { "leaseDurationMs": 10000 },
//!   "control": { "alarms": { "autoApplyInterventions": true } }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checkpoint::CheckpointConfig;
use crate::control::ControlConfig;
use crate::error::{FleetError, Result};
use crate::liveness::LivenessConfig;
use crate::lock::LockConfig;
use crate::recovery::RecoveryConfig;

/// Default maximum number of concurrently active loops.
pub const DEFAULT_MAX_CONCURRENT_LOOPS: usize = 4;

/// Config file name inside the `.ralph` directory.
pub const CONFIG_FILENAME: &str = "fleet.json";

/// Top-level fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// Maximum active loops before `register` refuses without an override.
    #[serde(default = "default_max_concurrent_loops")]
    pub max_concurrent_loops: usize,

    /// Root directory for fleet state. Defaults to `<project>/.ralph/fleet`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub checkpoints: CheckpointConfig,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_max_concurrent_loops() -> usize {
    DEFAULT_MAX_CONCURRENT_LOOPS
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loops: default_max_concurrent_loops(),
            state_dir: None,
            lock: LockConfig::default(),
            liveness: LivenessConfig::default(),
            checkpoints: CheckpointConfig::default(),
            control: ControlConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from a project directory.
    ///
    /// A missing file yields the defaults. A present but malformed file is
    /// an error, as is a file that parses but fails validation.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::config_path(project_dir);

        if !path.exists() {
            debug!(path = %path.display(), "No fleet config, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: FleetConfig = serde_json::from_str(&content)
            .map_err(|e| FleetError::config_with_path(e.to_string(), path.clone()))?;

        config.validate().map_err(|reason| FleetError::InvalidConfig {
            field: path.display().to_string(),
            reason,
        })?;

        Ok(config)
    }

    /// Get the config file path for a project.
    pub fn config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".ralph").join(CONFIG_FILENAME)
    }

    /// Resolve the fleet root directory for a project.
    pub fn resolve_state_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_dir.join(dir),
            None => project_dir.join(".ralph").join("fleet"),
        }
    }

    /// Shared fleet root under the user's home directory.
    ///
    /// Used when loops from several projects must see one registry.
    pub fn global_state_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ralph").join("fleet"))
    }

    /// Override the capacity limit.
    #[must_use]
    pub fn with_max_concurrent_loops(mut self, max: usize) -> Self {
        self.max_concurrent_loops = max;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_concurrent_loops == 0 {
            return Err("maxConcurrentLoops must be at least 1".to_string());
        }
        self.lock.validate()?;
        self.liveness.validate()?;
        self.checkpoints.validate()?;
        self.control.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        assert_eq!(config.max_concurrent_loops, 4);
        assert!(config.validate().is_ok());
        assert!(!config.control.alarms.auto_apply_interventions);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = FleetConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_concurrent_loops, DEFAULT_MAX_CONCURRENT_LOOPS);
    }

    #[test]
    fn test_load_partial_file() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".ralph")).unwrap();
        std::fs::write(
            FleetConfig::config_path(temp.path()),
            r#"{ "maxConcurrentLoops": 7, "lock": { "leaseDurationMs": 1234 } }"#,
        )
        .unwrap();

        let config = FleetConfig::load(temp.path()).unwrap();
        assert_eq!(config.max_concurrent_loops, 7);
        assert_eq!(config.lock.lease_duration_ms, 1234);
        assert_eq!(config.lock.max_attempts, LockConfig::default().max_attempts);
    }

    #[test]
    fn test_load_malformed_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".ralph")).unwrap();
        std::fs::write(FleetConfig::config_path(temp.path()), "{ nope").unwrap();

        let err = FleetConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, FleetError::Config { path: Some(_), .. }));
    }

    #[test]
    fn test_load_rejects_zero_capacity() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".ralph")).unwrap();
        std::fs::write(
            FleetConfig::config_path(temp.path()),
            r#"{ "maxConcurrentLoops": 0 }"#,
        )
        .unwrap();

        let err = FleetConfig::load(temp.path()).unwrap_err();
        assert!(matches!(err, FleetError::InvalidConfig { .. }));
    }

    #[test]
    fn test_resolve_state_dir() {
        let project = Path::new("/work/project");
        let config = FleetConfig::default();
        assert_eq!(
            config.resolve_state_dir(project),
            PathBuf::from("/work/project/.ralph/fleet")
        );

        let relative = FleetConfig {
            state_dir: Some(PathBuf::from("state")),
            ..FleetConfig::default()
        };
        assert_eq!(
            relative.resolve_state_dir(project),
            PathBuf::from("/work/project/state")
        );

        let absolute = FleetConfig {
            state_dir: Some(PathBuf::from("/var/fleet")),
            ..FleetConfig::default()
        };
        assert_eq!(absolute.resolve_state_dir(project), PathBuf::from("/var/fleet"));
    }
}

//! Compressed loop checkpoints.
//!
//! A checkpoint freezes a loop record together with the version-control
//! state of the working tree at that moment. Checkpoints are append-only
//! files under `loops/<id>/checkpoints/`, named `<millis>-iter<NNNN>.ckpt.zst`
//! and stored as zstd-compressed JSON. The file stem doubles as the
//! checkpoint id, so listing needs no separate index.
//!
//! ```text
//! create ──> capture VCS ──> union modified files ──> compress ──> save
//!                                  ▲                                 │
//!                                  └──────── previous latest <───────┘
//! ```

mod vcs;

pub use vcs::RealGitOperations;

use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::state::LoopRecord;
use crate::storage::Persistence;
use crate::testing::GitOperations;

/// Checkpoint file extension, after the id.
const CHECKPOINT_EXT: &str = "ckpt.zst";

// ============================================================================
// Configuration
// ============================================================================

/// Checkpoint retention and compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfig {
    /// Checkpoints kept per loop; older ones are pruned after each create.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,

    /// zstd compression level.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_max_checkpoints() -> usize {
    20
}

fn default_compression_level() -> i32 {
    3
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: default_max_checkpoints(),
            compression_level: default_compression_level(),
        }
    }
}

impl CheckpointConfig {
    #[must_use]
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_checkpoints == 0 {
            return Err("checkpoints.maxCheckpoints must be at least 1".to_string());
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(format!(
                "checkpoints.compressionLevel must be between 1 and 22, got {}",
                self.compression_level
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Checkpoint types
// ============================================================================

/// Version-control state captured with a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsState {
    /// HEAD commit, empty when unavailable.
    pub commit_hash: String,
    pub branch: String,
    /// Uncommitted files at capture time.
    pub dirty_files: Vec<String>,
}

impl VcsState {
    /// Capture the current state. Git failures yield an empty state.
    pub fn capture(git: &dyn GitOperations) -> Self {
        let commit_hash = git.get_commit_hash().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read commit hash for checkpoint");
            String::new()
        });
        let branch = git.get_branch().unwrap_or_default();
        let dirty_files = git.get_modified_files().unwrap_or_default();
        Self {
            commit_hash,
            branch,
            dirty_files,
        }
    }
}

/// A point-in-time snapshot of a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub loop_id: String,
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    pub vcs: VcsState,
    /// Every file modified since the loop's first checkpoint.
    pub modified_files: BTreeSet<String>,
    pub record: LoopRecord,
}

impl Checkpoint {
    /// One-line description for listings.
    #[must_use]
    pub fn summary(&self) -> String {
        let commit = if self.vcs.commit_hash.is_empty() {
            "no-commit"
        } else {
            &self.vcs.commit_hash[..self.vcs.commit_hash.len().min(8)]
        };
        format!(
            "{} iteration {} @ {} ({} files)",
            self.id,
            self.iteration,
            commit,
            self.modified_files.len()
        )
    }
}

// ============================================================================
// Checkpoint store
// ============================================================================

/// Creates, reads and prunes checkpoints.
pub struct CheckpointStore {
    loops_dir: PathBuf,
    store: Arc<dyn Persistence>,
    git: Arc<dyn GitOperations>,
    config: CheckpointConfig,
}

impl CheckpointStore {
    /// Create a store for loops under `<root>/loops`.
    pub fn new(
        root: &Path,
        config: CheckpointConfig,
        store: Arc<dyn Persistence>,
        git: Arc<dyn GitOperations>,
    ) -> Self {
        Self {
            loops_dir: root.join("loops"),
            store,
            git,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    fn dir(&self, loop_id: &str) -> PathBuf {
        self.loops_dir.join(loop_id).join("checkpoints")
    }

    fn path(&self, loop_id: &str, checkpoint_id: &str) -> PathBuf {
        self.dir(loop_id)
            .join(format!("{checkpoint_id}.{CHECKPOINT_EXT}"))
    }

    /// Snapshot `record` together with the current VCS state.
    ///
    /// Prunes down to `max_checkpoints` afterwards.
    pub fn create(&self, record: &LoopRecord) -> Result<Checkpoint> {
        let vcs = VcsState::capture(self.git.as_ref());

        let mut modified_files: BTreeSet<String> = match self.latest(&record.id)? {
            Some(previous) => previous.modified_files,
            None => BTreeSet::new(),
        };
        modified_files.extend(vcs.dirty_files.iter().cloned());

        let created_at = Utc::now();
        let mut millis = created_at.timestamp_millis();
        let mut id = checkpoint_id(millis, record.iteration);
        while self.store.exists(&self.path(&record.id, &id)) {
            millis += 1;
            id = checkpoint_id(millis, record.iteration);
        }

        let checkpoint = Checkpoint {
            id,
            loop_id: record.id.clone(),
            iteration: record.iteration,
            created_at,
            vcs,
            modified_files,
            record: record.clone(),
        };

        let bytes = compress(&serde_json::to_vec(&checkpoint)?, self.config.compression_level)?;
        self.store
            .save(&self.path(&record.id, &checkpoint.id), &bytes)?;
        info!(
            loop_id = %record.id,
            checkpoint = %checkpoint.id,
            iteration = record.iteration,
            bytes = bytes.len(),
            "Created checkpoint"
        );

        self.prune(&record.id, self.config.max_checkpoints)?;
        Ok(checkpoint)
    }

    /// Checkpoint ids for a loop, oldest first.
    pub fn list_ids(&self, loop_id: &str) -> Result<Vec<String>> {
        let dir = self.dir(loop_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let suffix = format!(".{CHECKPOINT_EXT}");
        let mut ids: Vec<(i64, String)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(&suffix) {
                match parse_millis(id) {
                    Some(millis) => ids.push((millis, id.to_string())),
                    None => debug!(file = %name, "Ignoring unrecognized checkpoint file"),
                }
            }
        }

        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    /// All checkpoints for a loop, oldest first. Unreadable ones are skipped.
    pub fn list(&self, loop_id: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for id in self.list_ids(loop_id)? {
            match self.get(loop_id, &id) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(loop_id, checkpoint = %id, error = %e, "Skipping checkpoint"),
            }
        }
        Ok(checkpoints)
    }

    /// Load one checkpoint.
    ///
    /// # Errors
    ///
    /// `CheckpointMissing` if no checkpoint has this id.
    pub fn get(&self, loop_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let bytes = self
            .store
            .load(&self.path(loop_id, checkpoint_id))?
            .ok_or_else(|| FleetError::CheckpointMissing {
                loop_id: loop_id.to_string(),
                checkpoint: checkpoint_id.to_string(),
            })?;
        Ok(serde_json::from_slice(&decompress(&bytes)?)?)
    }

    /// The most recent readable checkpoint, if any.
    pub fn latest(&self, loop_id: &str) -> Result<Option<Checkpoint>> {
        for id in self.list_ids(loop_id)?.iter().rev() {
            match self.get(loop_id, id) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(loop_id, checkpoint = %id, error = %e, "Unreadable checkpoint"),
            }
        }
        Ok(None)
    }

    /// Delete all but the newest `keep` checkpoints. Returns how many went.
    pub fn prune(&self, loop_id: &str, keep: usize) -> Result<usize> {
        let ids = self.list_ids(loop_id)?;
        if ids.len() <= keep {
            return Ok(0);
        }

        let excess = ids.len() - keep;
        for id in &ids[..excess] {
            self.store.remove(&self.path(loop_id, id))?;
        }
        debug!(loop_id, removed = excess, kept = keep, "Pruned checkpoints");
        Ok(excess)
    }
}

fn checkpoint_id(millis: i64, iteration: u32) -> String {
    format!("{millis}-iter{iteration:04}")
}

fn parse_millis(id: &str) -> Option<i64> {
    id.split_once("-iter")?.0.parse().ok()
}

fn compress(bytes: &[u8], level: i32) -> Result<Vec<u8>> {
    let mut compressed = Vec::new();
    let mut encoder = zstd::Encoder::new(&mut compressed, level)?;
    encoder.write_all(bytes)?;
    encoder.finish()?;
    Ok(compressed)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = zstd::Decoder::new(bytes)?;
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LoopConfig;
    use crate::storage::FilePersistence;
    use crate::testing::MockGitOperations;
    use tempfile::TempDir;

    fn test_store(git: MockGitOperations, max: usize) -> (CheckpointStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(
            temp.path(),
            CheckpointConfig::default().with_max_checkpoints(max),
            Arc::new(FilePersistence::new()),
            Arc::new(git),
        );
        (store, temp)
    }

    fn record(iteration: u32) -> LoopRecord {
        let mut record = LoopRecord::new("demo-abc123", &LoopConfig::new("demo"));
        record.iteration = iteration;
        record
    }

    #[test]
    fn test_create_and_get() {
        let git = MockGitOperations::new()
            .with_commit_hash("deadbeefcafe")
            .with_branch("feature/x")
            .with_modified_files(vec!["src/lib.rs".into()]);
        let (store, temp) = test_store(git, 20);

        let checkpoint = store.create(&record(4)).unwrap();
        assert!(checkpoint.id.ends_with("-iter0004"));
        assert_eq!(checkpoint.vcs.branch, "feature/x");

        let path = temp
            .path()
            .join("loops/demo-abc123/checkpoints")
            .join(format!("{}.ckpt.zst", checkpoint.id));
        let raw = fs::read(&path).unwrap();
        assert!(serde_json::from_slice::<Checkpoint>(&raw).is_err());

        let loaded = store.get("demo-abc123", &checkpoint.id).unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn test_modified_files_accumulate() {
        let (first_store, temp) = test_store(
            MockGitOperations::new().with_modified_files(vec!["a.rs".into()]),
            20,
        );
        first_store.create(&record(1)).unwrap();

        let second_store = CheckpointStore::new(
            temp.path(),
            CheckpointConfig::default(),
            Arc::new(FilePersistence::new()),
            Arc::new(MockGitOperations::new().with_modified_files(vec!["b.rs".into()])),
        );
        let second = second_store.create(&record(2)).unwrap();

        let files: Vec<_> = second.modified_files.iter().cloned().collect();
        assert_eq!(files, vec!["a.rs".to_string(), "b.rs".to_string()]);
    }

    #[test]
    fn test_latest_and_list_order() {
        let (store, _temp) = test_store(MockGitOperations::new(), 20);
        for i in 1..=3 {
            store.create(&record(i)).unwrap();
        }

        let iterations: Vec<u32> = store
            .list("demo-abc123")
            .unwrap()
            .iter()
            .map(|c| c.iteration)
            .collect();
        assert_eq!(iterations, vec![1, 2, 3]);
        assert_eq!(store.latest("demo-abc123").unwrap().unwrap().iteration, 3);
    }

    #[test]
    fn test_auto_prune_keeps_newest() {
        let (store, _temp) = test_store(MockGitOperations::new(), 2);
        for i in 1..=4 {
            store.create(&record(i)).unwrap();
        }

        let iterations: Vec<u32> = store
            .list("demo-abc123")
            .unwrap()
            .iter()
            .map(|c| c.iteration)
            .collect();
        assert_eq!(iterations, vec![3, 4]);
    }

    #[test]
    fn test_missing_checkpoint() {
        let (store, _temp) = test_store(MockGitOperations::new(), 20);
        let err = store.get("demo-abc123", "123-iter0001").unwrap_err();
        assert!(matches!(err, FleetError::CheckpointMissing { .. }));
        assert!(store.latest("demo-abc123").unwrap().is_none());
    }

    #[test]
    fn test_git_failure_yields_empty_vcs_state() {
        let (store, _temp) = test_store(MockGitOperations::new().failing("no git"), 20);
        let checkpoint = store.create(&record(1)).unwrap();
        assert_eq!(checkpoint.vcs, VcsState::default());
    }

    #[test]
    fn test_config_validation() {
        assert!(CheckpointConfig::default().validate().is_ok());
        let bad = CheckpointConfig {
            compression_level: 40,
            ..CheckpointConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}

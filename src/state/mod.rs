//! Per-loop durable state.
//!
//! Each loop owns a directory under `loops/<id>/`:
//!
//! ```text
//! loops/<id>/
//! ├── state.json        current LoopRecord
//! ├── state.json.bak    previous LoopRecord, used when state.json is corrupt
//! ├── state.json.lock   lease record while an update is in flight
//! ├── control.json      controller snapshot
//! ├── checkpoints/      compressed snapshots
//! └── iterations/       one summary per iteration
//! ```
//!
//! Writes go through the lease lock and the atomic persistence port. After a
//! write the summary fields are mirrored into the registry on a best-effort
//! basis; a failed mirror is logged and caught up by the next update.

mod types;

pub use types::*;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::control::ControlSnapshot;
use crate::error::{FleetError, Result};
use crate::lock::{with_lease, Holder, LeaseLock};
use crate::registry::{Registry, RegistryEntry};
use crate::storage::{load_json, save_json, Persistence};

const LOOPS_DIR: &str = "loops";
const ARCHIVE_DIR: &str = "archive";
const STATE_FILE: &str = "state.json";
const BACKUP_FILE: &str = "state.json.bak";
const CONTROL_FILE: &str = "control.json";
const CHECKPOINTS_DIR: &str = "checkpoints";
const ITERATIONS_DIR: &str = "iterations";

/// Store for loop records.
pub struct LoopStateStore {
    root: PathBuf,
    registry: Arc<Registry>,
    lock: Arc<dyn LeaseLock>,
    store: Arc<dyn Persistence>,
    lease_duration: Duration,
}

impl LoopStateStore {
    /// Create a store rooted at the fleet directory.
    pub fn new(
        root: &Path,
        registry: Arc<Registry>,
        lock: Arc<dyn LeaseLock>,
        store: Arc<dyn Persistence>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            registry,
            lock,
            store,
            lease_duration,
        }
    }

    // ------------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------------

    /// Directory holding a loop's files.
    #[must_use]
    pub fn loop_dir(&self, loop_id: &str) -> PathBuf {
        self.root.join(LOOPS_DIR).join(loop_id)
    }

    #[must_use]
    pub fn state_path(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join(STATE_FILE)
    }

    #[must_use]
    pub fn backup_path(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join(BACKUP_FILE)
    }

    #[must_use]
    pub fn checkpoints_dir(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join(CHECKPOINTS_DIR)
    }

    #[must_use]
    pub fn iterations_dir(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join(ITERATIONS_DIR)
    }

    /// Root of archived loop directories.
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    /// Returns true if a state record exists for the loop.
    #[must_use]
    pub fn exists(&self, loop_id: &str) -> bool {
        self.store.exists(&self.state_path(loop_id))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create a loop and register it.
    ///
    /// # Errors
    ///
    /// Registry errors (`CapacityExceeded`, lock errors) are returned after
    /// the freshly created directory has been removed again.
    pub fn create_loop(&self, config: &LoopConfig) -> Result<LoopRecord> {
        let id = generate_loop_id(&config.name);
        let dir = self.loop_dir(&id);

        fs::create_dir_all(dir.join(CHECKPOINTS_DIR))?;
        fs::create_dir_all(dir.join(ITERATIONS_DIR))?;

        let record = LoopRecord::new(&id, config);
        let registered = save_json(self.store.as_ref(), &self.state_path(&id), &record).and_then(
            |()| {
                self.registry.register(
                    RegistryEntry::from_record(&record),
                    config.allow_over_capacity,
                )
            },
        );

        if let Err(e) = registered {
            if let Err(cleanup) = fs::remove_dir_all(&dir) {
                warn!(loop_id = %id, error = %cleanup, "Failed to remove loop directory");
            }
            return Err(e);
        }

        info!(loop_id = %id, pid = record.pid, "Created loop");
        Ok(record)
    }

    /// Read a loop record.
    ///
    /// A corrupt primary record is replaced from the backup.
    ///
    /// # Errors
    ///
    /// - `LoopNotFound` if no record exists
    /// - `StateCorrupted` if both primary and backup are unreadable
    pub fn get_loop(&self, loop_id: &str) -> Result<LoopRecord> {
        let path = self.state_path(loop_id);
        let bytes = self
            .store
            .load(&path)?
            .ok_or_else(|| FleetError::not_found(loop_id))?;

        match serde_json::from_slice::<LoopRecord>(&bytes) {
            Ok(record) => Ok(record),
            Err(e) => self.recover_from_backup(loop_id, &path, &e.to_string()),
        }
    }

    fn recover_from_backup(&self, loop_id: &str, path: &Path, reason: &str) -> Result<LoopRecord> {
        let corrupted = || FleetError::StateCorrupted {
            loop_id: loop_id.to_string(),
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let backup: LoopRecord = match load_json(self.store.as_ref(), &self.backup_path(loop_id)) {
            Ok(Some(record)) => record,
            Ok(None) | Err(_) => return Err(corrupted()),
        };

        warn!(loop_id, reason, "Loop state corrupted, restored from backup");
        save_json(self.store.as_ref(), path, &backup)?;
        Ok(backup)
    }

    /// Apply `f` to a loop record under the loop's lease.
    ///
    /// The previous record is kept as the backup, `updated_at` is stamped and
    /// the registry entry is refreshed afterwards.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `f` moves a terminal loop to another status.
    pub fn update_loop(&self, loop_id: &str, f: impl FnOnce(&mut LoopRecord)) -> Result<LoopRecord> {
        self.try_update_loop(loop_id, |record| {
            f(record);
            Ok(())
        })
    }

    /// Like [`update_loop`](Self::update_loop), but `f` may refuse the change.
    ///
    /// `f` sees the record as read under the lease, so a check made inside it
    /// cannot be raced by another writer. An error from `f` leaves the record
    /// untouched and is returned as is.
    pub fn try_update_loop(
        &self,
        loop_id: &str,
        f: impl FnOnce(&mut LoopRecord) -> Result<()>,
    ) -> Result<LoopRecord> {
        self.write_record(loop_id, |record| {
            f(record)?;
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Replace a loop record wholesale, keeping the given timestamps.
    ///
    /// Used when restoring from a checkpoint, where the result must not
    /// depend on when the restore ran.
    pub fn replace_loop(&self, loop_id: &str, replacement: LoopRecord) -> Result<LoopRecord> {
        self.write_record(loop_id, move |record| {
            *record = replacement;
            Ok(())
        })
    }

    fn write_record(
        &self,
        loop_id: &str,
        f: impl FnOnce(&mut LoopRecord) -> Result<()>,
    ) -> Result<LoopRecord> {
        let path = self.state_path(loop_id);
        let holder = Holder::current(format!("loop:{loop_id}"));

        let record = with_lease(
            self.lock.as_ref(),
            &path,
            &holder,
            self.lease_duration,
            |lease| {
                let current = self.get_loop(loop_id)?;
                let mut next = current.clone();
                f(&mut next)?;
                next.id = current.id.clone();

                if !current.status.can_transition_to(next.status) {
                    return Err(FleetError::transition(loop_id, current.status, next.status));
                }

                save_json(self.store.as_ref(), &self.backup_path(loop_id), &current)?;
                self.lock.validate(lease)?;
                save_json(self.store.as_ref(), &path, &next)?;
                Ok(next)
            },
        )?;

        self.mirror_to_registry(&record);
        Ok(record)
    }

    fn mirror_to_registry(&self, record: &LoopRecord) {
        if let Err(e) = self.registry.update(&record.id, |entry| entry.mirror(record)) {
            warn!(loop_id = %record.id, error = %e, "Registry mirror failed");
        }
    }

    /// Move a finished loop to `archive/<id>` and retire it in the registry.
    ///
    /// Returns the archive location.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the loop is completed or aborted.
    pub fn archive_loop(&self, loop_id: &str) -> Result<PathBuf> {
        let record = self.get_loop(loop_id)?;
        if !record.status.is_terminal() {
            return Err(FleetError::transition(loop_id, record.status, "archived"));
        }

        let archive_root = self.archive_dir();
        fs::create_dir_all(&archive_root)?;
        let mut dest = archive_root.join(loop_id);
        if dest.exists() {
            dest = archive_root.join(format!("{loop_id}-{}", Utc::now().timestamp_millis()));
        }

        let src = self.loop_dir(loop_id);
        if let Err(e) = fs::rename(&src, &dest) {
            debug!(loop_id, error = %e, "Rename failed, copying loop directory");
            copy_dir_all(&src, &dest)?;
            fs::remove_dir_all(&src)?;
        }

        self.registry.archive(loop_id, record.status)?;
        info!(loop_id, status = %record.status, dest = %dest.display(), "Archived loop");
        Ok(dest)
    }

    /// All readable loop records, ordered by id.
    pub fn list_loops(&self) -> Result<Vec<LoopRecord>> {
        let loops_dir = self.root.join(LOOPS_DIR);
        if !loops_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&loops_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let loop_id = entry.file_name().to_string_lossy().into_owned();
            match self.get_loop(&loop_id) {
                Ok(record) => records.push(record),
                Err(e) => warn!(loop_id, error = %e, "Skipping unreadable loop"),
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// Ids of every loop directory with a state record.
    pub fn loop_ids(&self) -> Result<HashSet<String>> {
        let loops_dir = self.root.join(LOOPS_DIR);
        if !loops_dir.exists() {
            return Ok(HashSet::new());
        }
        let mut ids = HashSet::new();
        for entry in fs::read_dir(&loops_dir)? {
            let loop_id = entry?.file_name().to_string_lossy().into_owned();
            if self.exists(&loop_id) {
                ids.insert(loop_id);
            }
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------------
    // Iterations and controller state
    // ------------------------------------------------------------------------

    /// Persist the summary of one iteration.
    pub fn record_iteration(&self, loop_id: &str, record: &IterationRecord) -> Result<()> {
        if !self.exists(loop_id) {
            return Err(FleetError::not_found(loop_id));
        }
        let path = self
            .iterations_dir(loop_id)
            .join(format!("iteration-{:04}.json", record.iteration));
        save_json(self.store.as_ref(), &path, record)
    }

    /// Iteration summaries in iteration order.
    pub fn list_iterations(&self, loop_id: &str) -> Result<Vec<IterationRecord>> {
        let dir = self.iterations_dir(loop_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match load_json::<IterationRecord>(self.store.as_ref(), &path) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping iteration record"),
                }
            }
        }
        records.sort_by_key(|r| r.iteration);
        Ok(records)
    }

    /// Persist the controller snapshot for a loop.
    pub fn save_control(&self, loop_id: &str, snapshot: &ControlSnapshot) -> Result<()> {
        save_json(
            self.store.as_ref(),
            &self.loop_dir(loop_id).join(CONTROL_FILE),
            snapshot,
        )
    }

    /// Load the controller snapshot for a loop, if one was saved.
    pub fn load_control(&self, loop_id: &str) -> Result<Option<ControlSnapshot>> {
        load_json(self.store.as_ref(), &self.loop_dir(loop_id).join(CONTROL_FILE))
    }
}

/// Recursively copy a directory tree.
fn copy_dir_all(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| FleetError::Other(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| FleetError::Other(e.into()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{FileLeaseLock, LockConfig};
    use crate::storage::FilePersistence;
    use crate::testing::MockProcessProbe;
    use tempfile::TempDir;

    fn test_store(max: usize) -> (LoopStateStore, Arc<Registry>, TempDir) {
        let temp = TempDir::new().expect("temp dir");
        let probe = MockProcessProbe::new().with_alive(&[std::process::id()]);
        let lock: Arc<dyn LeaseLock> =
            Arc::new(FileLeaseLock::new(LockConfig::default(), Arc::new(probe)));
        let persistence: Arc<dyn Persistence> = Arc::new(FilePersistence::new());
        let lease = Duration::from_secs(30);
        let registry = Arc::new(Registry::new(
            temp.path(),
            max,
            Arc::clone(&lock),
            Arc::clone(&persistence),
            lease,
        ));
        let store = LoopStateStore::new(temp.path(), Arc::clone(&registry), lock, persistence, lease);
        (store, registry, temp)
    }

    #[test]
    fn test_create_loop_layout() {
        let (store, registry, _temp) = test_store(4);
        let record = store
            .create_loop(&LoopConfig::new("Fix auth").with_max_iterations(20))
            .expect("create");

        assert!(record.id.starts_with("fix-auth-"));
        assert!(store.state_path(&record.id).exists());
        assert!(store.checkpoints_dir(&record.id).is_dir());
        assert!(store.iterations_dir(&record.id).is_dir());
        assert!(registry.get(&record.id).expect("get").is_some());
    }

    #[test]
    fn test_create_over_capacity_cleans_up() {
        let (store, _registry, temp) = test_store(1);
        store.create_loop(&LoopConfig::new("first")).expect("create");

        let err = store.create_loop(&LoopConfig::new("second")).unwrap_err();
        assert!(matches!(err, FleetError::CapacityExceeded { .. }));

        let dirs = fs::read_dir(temp.path().join(LOOPS_DIR)).expect("read").count();
        assert_eq!(dirs, 1);
    }

    #[test]
    fn test_get_missing_loop() {
        let (store, _registry, _temp) = test_store(4);
        let err = store.get_loop("nope-000000").unwrap_err();
        assert!(matches!(err, FleetError::LoopNotFound { .. }));
    }

    #[test]
    fn test_update_loop_mirrors_registry() {
        let (store, registry, _temp) = test_store(4);
        let record = store.create_loop(&LoopConfig::new("demo")).expect("create");

        let updated = store
            .update_loop(&record.id, |r| {
                r.iteration = 5;
                r.status = LoopStatus::Paused;
            })
            .expect("update");
        assert!(updated.updated_at >= record.updated_at);

        let entry = registry.get(&record.id).expect("get").expect("present");
        assert_eq!(entry.iteration, 5);
        assert_eq!(entry.status, LoopStatus::Paused);
        assert!(store.backup_path(&record.id).exists());
    }

    #[test]
    fn test_update_cannot_leave_terminal_status() {
        let (store, _registry, _temp) = test_store(4);
        let record = store.create_loop(&LoopConfig::new("demo")).expect("create");
        store
            .update_loop(&record.id, |r| r.status = LoopStatus::Completed)
            .expect("complete");

        let err = store
            .update_loop(&record.id, |r| r.status = LoopStatus::Running)
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
    }

    #[test]
    fn test_try_update_refusal_leaves_record() {
        let (store, _registry, _temp) = test_store(4);
        let record = store.create_loop(&LoopConfig::new("demo")).expect("create");

        let err = store
            .try_update_loop(&record.id, |r| {
                r.iteration = 9;
                Err(FleetError::transition(&r.id, r.status, LoopStatus::Recovering))
            })
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
        let stored = store.get_loop(&record.id).expect("get");
        assert_eq!(stored.iteration, 0);
        assert_eq!(stored.status, LoopStatus::Running);
    }

    #[test]
    fn test_corrupt_primary_recovers_from_backup() {
        let (store, _registry, _temp) = test_store(4);
        let record = store.create_loop(&LoopConfig::new("demo")).expect("create");
        store
            .update_loop(&record.id, |r| r.iteration = 3)
            .expect("update");

        fs::write(store.state_path(&record.id), "{ truncated").expect("corrupt");

        let recovered = store.get_loop(&record.id).expect("recover");
        assert_eq!(recovered.iteration, 0);
        let reread = store.get_loop(&record.id).expect("primary rewritten");
        assert_eq!(reread, recovered);
    }

    #[test]
    fn test_corrupt_primary_and_backup() {
        let (store, _registry, _temp) = test_store(4);
        let record = store.create_loop(&LoopConfig::new("demo")).expect("create");
        fs::write(store.state_path(&record.id), "garbage").expect("corrupt");
        fs::write(store.backup_path(&record.id), "garbage").expect("corrupt");

        let err = store.get_loop(&record.id).unwrap_err();
        assert!(matches!(err, FleetError::StateCorrupted { .. }));
    }

    #[test]
    fn test_archive_requires_terminal_status() {
        let (store, registry, _temp) = test_store(4);
        let record = store.create_loop(&LoopConfig::new("demo")).expect("create");

        let err = store.archive_loop(&record.id).unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));

        store
            .update_loop(&record.id, |r| r.status = LoopStatus::Completed)
            .expect("complete");
        let dest = store.archive_loop(&record.id).expect("archive");

        assert!(dest.join(STATE_FILE).exists());
        assert!(!store.loop_dir(&record.id).exists());
        let snapshot = registry.snapshot().expect("snapshot");
        assert_eq!(snapshot.active_count(), 0);
        assert_eq!(snapshot.counters.completed, 1);
    }

    #[test]
    fn test_list_loops_skips_unreadable() {
        let (store, _registry, _temp) = test_store(4);
        let a = store.create_loop(&LoopConfig::new("a")).expect("create");
        let b = store.create_loop(&LoopConfig::new("b")).expect("create");
        fs::write(store.state_path(&b.id), "garbage").expect("corrupt");

        let loops = store.list_loops().expect("list");
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].id, a.id);
    }

    #[test]
    fn test_iterations_round_trip_in_order() {
        let (store, _registry, _temp) = test_store(4);
        let record = store.create_loop(&LoopConfig::new("demo")).expect("create");

        for i in [2, 1, 3] {
            store
                .record_iteration(
                    &record.id,
                    &IterationRecord {
                        iteration: i,
                        timestamp: Utc::now(),
                        completion: 0.1 * f64::from(i),
                        quality: 0.9,
                        errors: 0,
                        blockers: Vec::new(),
                        action: "continue".into(),
                        control_signal: 0.2,
                    },
                )
                .expect("record");
        }

        let iterations: Vec<u32> = store
            .list_iterations(&record.id)
            .expect("list")
            .iter()
            .map(|r| r.iteration)
            .collect();
        assert_eq!(iterations, vec![1, 2, 3]);
    }

    #[test]
    fn test_load_control_absent() {
        let (store, _registry, _temp) = test_store(4);
        let record = store.create_loop(&LoopConfig::new("demo")).expect("create");
        assert!(store.load_control(&record.id).expect("load").is_none());
    }
}

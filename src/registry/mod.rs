//! Shared index of active loops.
//!
//! The registry is a single JSON document (`registry.json`) listing every
//! active loop in summary form, plus lifetime counters. It is the sole source
//! of truth for which loops exist. Every access runs as one lease-guarded
//! cycle: acquire the registry lease, read, mutate, validate the lease
//! (fencing), write atomically, release.
//!
//! Capacity is enforced at registration: with `n` loops active each new loop
//! adds `n` pairwise coordination paths, so the registry refuses past the
//! configured limit unless the caller explicitly overrides.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{coordination_paths, FleetError, Result};
use crate::lock::{with_lease, Holder, LeaseLock};
use crate::state::{LoopRecord, LoopStatus, Priority};
use crate::storage::{load_json, save_json, Persistence};

/// Registry document file name.
pub const REGISTRY_FILENAME: &str = "registry.json";

/// Current registry document version.
pub const REGISTRY_VERSION: u32 = 1;

/// Summary of one active loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub loop_id: String,
    pub status: LoopStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub pid: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Registered past the capacity limit via an explicit override.
    #[serde(default)]
    pub over_capacity: bool,
}

impl RegistryEntry {
    /// Project a loop record into its registry summary.
    #[must_use]
    pub fn from_record(record: &LoopRecord) -> Self {
        Self {
            loop_id: record.id.clone(),
            status: record.status,
            iteration: record.iteration,
            max_iterations: record.max_iterations,
            pid: record.pid,
            priority: record.priority,
            tags: record.tags.iter().cloned().collect(),
            started_at: record.started_at,
            updated_at: record.updated_at,
            over_capacity: false,
        }
    }

    /// Copy the mirrored fields from a newer loop record.
    pub fn mirror(&mut self, record: &LoopRecord) {
        self.status = record.status;
        self.iteration = record.iteration;
        self.pid = record.pid;
        self.updated_at = record.updated_at;
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounters {
    pub created: u64,
    pub completed: u64,
    pub aborted: u64,
}

/// The persisted registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryFile {
    pub version: u32,
    pub active: BTreeMap<String, RegistryEntry>,
    #[serde(default)]
    pub counters: RegistryCounters,
    pub updated_at: DateTime<Utc>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            active: BTreeMap::new(),
            counters: RegistryCounters::default(),
            updated_at: Utc::now(),
        }
    }
}

impl RegistryFile {
    /// Number of active loops.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Pairwise coordination paths among the active loops.
    #[must_use]
    pub fn coordination_paths(&self) -> usize {
        coordination_paths(self.active.len())
    }
}

/// Lease-guarded registry store.
pub struct Registry {
    path: PathBuf,
    max_concurrent_loops: usize,
    lock: Arc<dyn LeaseLock>,
    store: Arc<dyn Persistence>,
    holder: Holder,
    lease_duration: Duration,
}

impl Registry {
    /// Create a registry rooted at `root`.
    pub fn new(
        root: &Path,
        max_concurrent_loops: usize,
        lock: Arc<dyn LeaseLock>,
        store: Arc<dyn Persistence>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            path: root.join(REGISTRY_FILENAME),
            max_concurrent_loops,
            lock,
            store,
            holder: Holder::current("registry"),
            lease_duration,
        }
    }

    /// Set the identity used for registry leases.
    #[must_use]
    pub fn with_holder(mut self, holder: Holder) -> Self {
        self.holder = holder;
        self
    }

    /// Path of the registry document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured capacity limit.
    #[must_use]
    pub fn max_concurrent_loops(&self) -> usize {
        self.max_concurrent_loops
    }

    fn load(&self) -> Result<RegistryFile> {
        Ok(load_json(self.store.as_ref(), &self.path)?.unwrap_or_default())
    }

    /// Run one read-modify-write cycle under the registry lease.
    fn modify<T>(&self, f: impl FnOnce(&mut RegistryFile) -> Result<T>) -> Result<T> {
        with_lease(
            self.lock.as_ref(),
            &self.path,
            &self.holder,
            self.lease_duration,
            |lease| {
                let mut file = self.load()?;
                let out = f(&mut file)?;
                file.updated_at = Utc::now();
                self.lock.validate(lease)?;
                save_json(self.store.as_ref(), &self.path, &file)?;
                Ok(out)
            },
        )
    }

    fn read(&self) -> Result<RegistryFile> {
        with_lease(
            self.lock.as_ref(),
            &self.path,
            &self.holder,
            self.lease_duration,
            |_| self.load(),
        )
    }

    /// Register a loop.
    ///
    /// # Errors
    ///
    /// - `LoopAlreadyRegistered` if the id is present
    /// - `CapacityExceeded` if the registry is full and `allow_over_capacity`
    ///   is false
    pub fn register(
        &self,
        mut entry: RegistryEntry,
        allow_over_capacity: bool,
    ) -> Result<RegistryEntry> {
        let limit = self.max_concurrent_loops;
        self.modify(|file| {
            if file.active.contains_key(&entry.loop_id) {
                return Err(FleetError::LoopAlreadyRegistered {
                    loop_id: entry.loop_id.clone(),
                });
            }

            let current = file.active_count();
            if current >= limit {
                if !allow_over_capacity {
                    return Err(FleetError::capacity(current, limit));
                }
                warn!(
                    loop_id = %entry.loop_id,
                    active = current + 1,
                    limit,
                    coordination_paths = coordination_paths(current + 1),
                    "Registering loop over capacity"
                );
                entry.over_capacity = true;
            }

            file.active.insert(entry.loop_id.clone(), entry.clone());
            file.counters.created += 1;
            info!(loop_id = %entry.loop_id, active = current + 1, "Registered loop");
            Ok(entry)
        })
    }

    /// Remove a loop without touching the counters.
    ///
    /// Returns whether an entry was removed.
    pub fn unregister(&self, loop_id: &str) -> Result<bool> {
        self.modify(|file| {
            let removed = file.active.remove(loop_id).is_some();
            if removed {
                debug!(loop_id, "Unregistered loop");
            }
            Ok(removed)
        })
    }

    /// Apply `f` to an entry.
    ///
    /// # Errors
    ///
    /// `LoopNotFound` if the id is not registered.
    pub fn update(
        &self,
        loop_id: &str,
        f: impl FnOnce(&mut RegistryEntry),
    ) -> Result<RegistryEntry> {
        self.modify(|file| {
            let entry = file
                .active
                .get_mut(loop_id)
                .ok_or_else(|| FleetError::not_found(loop_id))?;
            f(entry);
            Ok(entry.clone())
        })
    }

    /// Active entries ordered by id.
    pub fn list_active(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.read()?.active.into_values().collect())
    }

    /// Look up a single entry.
    pub fn get(&self, loop_id: &str) -> Result<Option<RegistryEntry>> {
        Ok(self.read()?.active.remove(loop_id))
    }

    /// Remove an entry and count its final status.
    ///
    /// Returns whether the entry was present. Counters only move when it was,
    /// so a retried archive does not count twice.
    pub fn archive(&self, loop_id: &str, final_status: LoopStatus) -> Result<bool> {
        self.modify(|file| {
            if file.active.remove(loop_id).is_none() {
                return Ok(false);
            }
            match final_status {
                LoopStatus::Completed => file.counters.completed += 1,
                LoopStatus::Aborted => file.counters.aborted += 1,
                other => {
                    warn!(loop_id, status = %other, "Archived loop with non-terminal status");
                }
            }
            info!(loop_id, status = %final_status, "Archived loop in registry");
            Ok(true)
        })
    }

    /// Drop entries whose loop record no longer exists.
    ///
    /// Returns the removed ids.
    pub fn reconcile(&self, known_ids: &HashSet<String>) -> Result<Vec<String>> {
        self.modify(|file| {
            let orphans: Vec<String> = file
                .active
                .keys()
                .filter(|id| !known_ids.contains(*id))
                .cloned()
                .collect();
            for id in &orphans {
                file.active.remove(id);
                warn!(loop_id = %id, "Removed orphaned registry entry");
            }
            Ok(orphans)
        })
    }

    /// The full registry document.
    pub fn snapshot(&self) -> Result<RegistryFile> {
        self.read()
    }
}

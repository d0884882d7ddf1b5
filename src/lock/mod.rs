//! Lease locks over shared fleet resources.
//!
//! A lease is a time-bounded, revocable claim on a resource. The file
//! backend stores the lease record next to the resource it guards
//! (`registry.json` → `registry.json.lock`) and creates it atomically, so at
//! most one process holds a valid lease per resource at any instant.
//!
//! A lease becomes reclaimable once it has expired **or** its holder process
//! is gone, whichever is detected first. Reclamation itself is serialized
//! through an advisory `fs2` lock on a guard file so two contenders that both
//! see the same stale record cannot both win.
//!
//! ```text
//! try_acquire ──create_new──> acquired
//!      │
//!      └─ exists ─> read lease ─┬─ stale ──> reclaim (guarded) ──> retry now
//!                               └─ valid ──> back off ──> retry (bounded)
//! ```
//!
//! Fencing tokens are derived from wall-clock milliseconds, bumped past the
//! previous token seen on the resource. Under clock skew between processes
//! they do not give a strict ordering.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{FleetError, Result};
use crate::testing::ProcessProbe;

/// Lock file suffix, appended to the guarded resource's file name.
const LOCK_SUFFIX: &str = "lock";

/// Guard file suffix used while reclaiming a stale lease.
const GUARD_SUFFIX: &str = "guard";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for lease acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConfig {
    /// How long an acquired lease stays valid.
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Maximum acquisition attempts before `LockTimeout`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_lease_duration_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    50
}

fn default_backoff_base_ms() -> u64 {
    10
}

fn default_backoff_max_ms() -> u64 {
    250
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: default_lease_duration_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl LockConfig {
    /// Lease duration as a [`Duration`].
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Set the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    /// Set the lease duration.
    #[must_use]
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration_ms = duration.as_millis() as u64;
        self
    }

    /// Backoff delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(1 << shift);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.lease_duration_ms == 0 {
            return Err("lock.leaseDurationMs must be positive".to_string());
        }
        if self.max_attempts == 0 {
            return Err("lock.maxAttempts must be at least 1".to_string());
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(format!(
                "lock.backoffBaseMs ({}) exceeds lock.backoffMaxMs ({})",
                self.backoff_base_ms, self.backoff_max_ms
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Lease types
// ============================================================================

/// Identity of a lease holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Holder {
    /// Process id used for liveness checks.
    pub pid: u32,
    /// Human-readable role, e.g. `loop:fix-auth-1a2b3c` or `supervisor`.
    pub name: String,
}

impl Holder {
    /// Create a holder identity for an explicit pid.
    #[must_use]
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }

    /// Create a holder identity for the calling process.
    #[must_use]
    pub fn current(name: impl Into<String>) -> Self {
        Self::new(std::process::id(), name)
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.name, self.pid)
    }
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// The guarded resource.
    pub resource: PathBuf,
    /// Who holds the lease.
    pub holder: Holder,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless released earlier.
    pub expires_at: DateTime<Utc>,
    /// Fencing token compared before guarded writes.
    pub token: u64,
}

impl Lease {
    /// Returns true if the lease has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Mutual exclusion over fleet resources.
///
/// Callers depend on this trait rather than the file backend so a real
/// lock service can be substituted later.
pub trait LeaseLock: Send + Sync {
    /// Acquire a lease, retrying with backoff up to the configured budget.
    ///
    /// # Errors
    ///
    /// `FleetError::LockTimeout` when the lease stays held by a live holder.
    fn try_acquire(&self, resource: &Path, holder: &Holder, lease_duration: Duration)
        -> Result<Lease>;

    /// Release a lease. A no-op returning `false` unless `holder` holds it.
    fn release(&self, resource: &Path, holder: &Holder) -> Result<bool>;

    /// Returns true if the lease expired or its holder process is gone.
    fn is_stale(&self, lease: &Lease) -> bool;

    /// Check that `lease` is still the current lease on its resource.
    ///
    /// # Errors
    ///
    /// `FleetError::LeaseLost` when another holder has taken over.
    fn validate(&self, lease: &Lease) -> Result<()>;
}

/// Run `f` while holding a lease on `resource`.
///
/// The lease is released whether `f` succeeds or fails.
pub fn with_lease<T>(
    lock: &dyn LeaseLock,
    resource: &Path,
    holder: &Holder,
    lease_duration: Duration,
    f: impl FnOnce(&Lease) -> Result<T>,
) -> Result<T> {
    let lease = lock.try_acquire(resource, holder, lease_duration)?;
    let result = f(&lease);
    if let Err(e) = lock.release(resource, holder) {
        warn!(resource = %resource.display(), error = %e, "Failed to release lease");
    }
    result
}

/// Path of the lock record guarding `resource`.
#[must_use]
pub fn lock_path(resource: &Path) -> PathBuf {
    append_suffix(resource, LOCK_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{suffix}"))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

// ============================================================================
// File backend
// ============================================================================

/// Outcome of reading a lock record.
enum LeaseRead {
    Missing,
    Valid(Lease),
    /// Present but unparsable, with its age. Usually a record caught
    /// between `create_new` and the write of its contents.
    Unreadable(Duration),
}

/// Which record `reclaim` may remove.
enum StaleRecord {
    /// A parsed lease judged stale, identified by its token.
    Lease(u64),
    /// An unparsable record, removable once it is at least this old.
    Unreadable(Duration),
}

/// File-based lease lock.
pub struct FileLeaseLock {
    config: LockConfig,
    probe: Arc<dyn ProcessProbe>,
}

impl FileLeaseLock {
    /// Create a file lease lock using `probe` for holder liveness.
    #[must_use]
    pub fn new(config: LockConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { config, probe }
    }

    /// Get the lock configuration.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Read the current lease on `resource`, if any.
    pub fn current_lease(&self, resource: &Path) -> Option<Lease> {
        match read_lease(&lock_path(resource)) {
            LeaseRead::Valid(lease) => Some(lease),
            _ => None,
        }
    }

    fn create_lease(
        &self,
        lock_path: &Path,
        resource: &Path,
        holder: &Holder,
        lease_duration: Duration,
        previous_token: u64,
    ) -> std::io::Result<Lease> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)?;

        let acquired_at = Utc::now();
        let expires_at = acquired_at
            + chrono::Duration::from_std(lease_duration).unwrap_or(chrono::Duration::MAX);
        let lease = Lease {
            resource: resource.to_path_buf(),
            holder: holder.clone(),
            acquired_at,
            expires_at,
            token: now_millis().max(previous_token.saturating_add(1)),
        };

        let json = serde_json::to_vec(&lease).map_err(std::io::Error::other)?;
        if let Err(e) = file.write_all(&json).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(lock_path);
            return Err(e);
        }
        Ok(lease)
    }

    /// Create the lease file, or `None` if another holder has one.
    fn create_or_contend(
        &self,
        lock_path: &Path,
        resource: &Path,
        holder: &Holder,
        lease_duration: Duration,
        previous_token: u64,
    ) -> Result<Option<Lease>> {
        match self.create_lease(lock_path, resource, holder, lease_duration, previous_token) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a stale record under the guard lock.
    ///
    /// Returns true if the record is gone afterwards. Staleness is judged
    /// again under the guard: a lease is removed only if it carries the same
    /// token, and an unreadable record only if it is still old enough. A
    /// fresh lease or a record mid-write survives.
    fn reclaim(&self, lock_path: &Path, stale: StaleRecord) -> Result<bool> {
        let guard_path = append_suffix(lock_path, GUARD_SUFFIX);
        let guard = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)?;
        guard.lock_exclusive()?;

        let reclaimed = match (read_lease(lock_path), stale) {
            (LeaseRead::Missing, _) => true,
            (LeaseRead::Valid(current), StaleRecord::Lease(token)) if current.token == token => {
                fs::remove_file(lock_path).or_else(ignore_not_found)?;
                info!(
                    resource = %current.resource.display(),
                    holder = %current.holder,
                    token,
                    "Reclaimed stale lease"
                );
                true
            }
            (LeaseRead::Unreadable(age), StaleRecord::Unreadable(min_age)) if age >= min_age => {
                fs::remove_file(lock_path).or_else(ignore_not_found)?;
                warn!(path = %lock_path.display(), "Removed unreadable lease record");
                true
            }
            _ => false,
        };

        FileExt::unlock(&guard)?;
        Ok(reclaimed)
    }
}

fn ignore_not_found(e: std::io::Error) -> std::io::Result<()> {
    if e.kind() == ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

fn read_lease(lock_path: &Path) -> LeaseRead {
    let bytes = match fs::read(lock_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return LeaseRead::Missing,
        Err(_) => return LeaseRead::Unreadable(Duration::ZERO),
    };

    match serde_json::from_slice::<Lease>(&bytes) {
        Ok(lease) => LeaseRead::Valid(lease),
        Err(_) => {
            let age = File::open(lock_path)
                .and_then(|f| f.metadata())
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or(Duration::ZERO);
            LeaseRead::Unreadable(age)
        }
    }
}

impl LeaseLock for FileLeaseLock {
    fn try_acquire(
        &self,
        resource: &Path,
        holder: &Holder,
        lease_duration: Duration,
    ) -> Result<Lease> {
        let lock_path = lock_path(resource);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut last_holder = String::from("unknown");
        let mut last_token = 0;

        for attempt in 1..=self.config.max_attempts {
            let mut lease =
                self.create_or_contend(&lock_path, resource, holder, lease_duration, last_token)?;

            if lease.is_none() {
                let reclaimed = match read_lease(&lock_path) {
                    LeaseRead::Missing => true,
                    LeaseRead::Valid(existing) => {
                        last_token = last_token.max(existing.token);
                        if self.is_stale(&existing) {
                            self.reclaim(&lock_path, StaleRecord::Lease(existing.token))?
                        } else {
                            last_holder = existing.holder.to_string();
                            false
                        }
                    }
                    LeaseRead::Unreadable(age) => {
                        age >= lease_duration
                            && self.reclaim(&lock_path, StaleRecord::Unreadable(lease_duration))?
                    }
                };
                // A freed slot is retried within the same attempt.
                if reclaimed {
                    lease = self.create_or_contend(
                        &lock_path,
                        resource,
                        holder,
                        lease_duration,
                        last_token,
                    )?;
                }
            }

            if let Some(lease) = lease {
                trace!(
                    resource = %resource.display(),
                    holder = %holder,
                    token = lease.token,
                    attempt,
                    "Acquired lease"
                );
                return Ok(lease);
            }

            if attempt < self.config.max_attempts {
                let delay = self.config.backoff(attempt);
                debug!(
                    resource = %resource.display(),
                    held_by = %last_holder,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Lease contended, backing off"
                );
                std::thread::sleep(delay);
            }
        }

        Err(FleetError::LockTimeout {
            resource: resource.to_path_buf(),
            holder: last_holder,
            attempts: self.config.max_attempts,
        })
    }

    fn release(&self, resource: &Path, holder: &Holder) -> Result<bool> {
        let lock_path = lock_path(resource);
        match read_lease(&lock_path) {
            LeaseRead::Valid(current) if &current.holder == holder => {
                fs::remove_file(&lock_path).or_else(ignore_not_found)?;
                trace!(resource = %resource.display(), holder = %holder, "Released lease");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_stale(&self, lease: &Lease) -> bool {
        lease.is_expired_at(Utc::now()) || !self.probe.is_alive(lease.holder.pid)
    }

    fn validate(&self, lease: &Lease) -> Result<()> {
        match read_lease(&lock_path(&lease.resource)) {
            LeaseRead::Valid(current)
                if current.token == lease.token && current.holder == lease.holder =>
            {
                Ok(())
            }
            _ => Err(FleetError::LeaseLost {
                resource: lease.resource.clone(),
                token: lease.token,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProcessProbe;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn fast_config() -> LockConfig {
        LockConfig::default()
            .with_max_attempts(3)
            .with_backoff(1, 2)
    }

    fn lock_with(probe: &MockProcessProbe) -> FileLeaseLock {
        FileLeaseLock::new(fast_config(), Arc::new(probe.clone()))
    }

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let probe = MockProcessProbe::new().with_alive(&[100]);
        let lock = lock_with(&probe);
        let holder = Holder::new(100, "supervisor");

        let lease = lock
            .try_acquire(&resource, &holder, Duration::from_secs(30))
            .unwrap();
        assert_eq!(lease.holder, holder);
        assert!(lock_path(&resource).exists());

        assert!(lock.release(&resource, &holder).unwrap());
        assert!(!lock_path(&resource).exists());
    }

    #[test]
    fn test_contended_lease_times_out() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let probe = MockProcessProbe::new().with_alive(&[100, 200]);
        let lock = lock_with(&probe);

        lock.try_acquire(&resource, &Holder::new(100, "a"), Duration::from_secs(30))
            .unwrap();
        let err = lock
            .try_acquire(&resource, &Holder::new(200, "b"), Duration::from_secs(30))
            .unwrap_err();

        match err {
            FleetError::LockTimeout {
                holder, attempts, ..
            } => {
                assert!(holder.contains("pid 100"));
                assert_eq!(attempts, 3);
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let probe = MockProcessProbe::new().with_alive(&[100, 200]);
        let lock = lock_with(&probe);

        let first = lock
            .try_acquire(&resource, &Holder::new(100, "a"), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let second = lock
            .try_acquire(&resource, &Holder::new(200, "b"), Duration::from_secs(30))
            .unwrap();
        assert_eq!(second.holder.pid, 200);
        assert!(second.token > first.token);
    }

    #[test]
    fn test_dead_holder_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let probe = MockProcessProbe::new().with_alive(&[100, 200]);
        let lock = lock_with(&probe);

        lock.try_acquire(&resource, &Holder::new(100, "a"), Duration::from_secs(3600))
            .unwrap();
        probe.kill(100);

        let lease = lock
            .try_acquire(&resource, &Holder::new(200, "b"), Duration::from_secs(30))
            .unwrap();
        assert_eq!(lease.holder.pid, 200);
    }

    #[test]
    fn test_release_by_non_holder_is_noop() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let probe = MockProcessProbe::new().with_alive(&[100, 200]);
        let lock = lock_with(&probe);

        lock.try_acquire(&resource, &Holder::new(100, "a"), Duration::from_secs(30))
            .unwrap();

        assert!(!lock.release(&resource, &Holder::new(200, "b")).unwrap());
        assert!(!lock.release(&resource, &Holder::new(100, "other-name")).unwrap());
        assert!(lock_path(&resource).exists());

        let other = temp.path().join("never-locked.json");
        assert!(!lock.release(&other, &Holder::new(100, "a")).unwrap());
    }

    #[test]
    fn test_validate_detects_lost_lease() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let probe = MockProcessProbe::new().with_alive(&[100, 200]);
        let lock = lock_with(&probe);

        let stale = lock
            .try_acquire(&resource, &Holder::new(100, "a"), Duration::from_millis(1))
            .unwrap();
        assert!(lock.validate(&stale).is_ok());

        std::thread::sleep(Duration::from_millis(5));
        lock.try_acquire(&resource, &Holder::new(200, "b"), Duration::from_secs(30))
            .unwrap();

        let err = lock.validate(&stale).unwrap_err();
        assert!(matches!(err, FleetError::LeaseLost { .. }));
    }

    #[test]
    fn test_unreadable_record_blocks_until_old() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        fs::write(lock_path(&resource), "").unwrap();
        let probe = MockProcessProbe::new().with_alive(&[100]);
        let lock = lock_with(&probe);

        let err = lock
            .try_acquire(&resource, &Holder::new(100, "a"), Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, FleetError::LockTimeout { .. }));

        std::thread::sleep(Duration::from_millis(5));
        let lease = lock
            .try_acquire(&resource, &Holder::new(100, "a"), Duration::from_millis(1))
            .unwrap();
        assert_eq!(lease.holder.pid, 100);
    }

    #[test]
    fn test_single_attempt_acquires_after_reclaim() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let probe = MockProcessProbe::new().with_alive(&[100, 200]);
        let lock = FileLeaseLock::new(
            LockConfig::default().with_max_attempts(1),
            Arc::new(probe.clone()),
        );

        lock.try_acquire(&resource, &Holder::new(100, "a"), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let expired = lock
            .try_acquire(&resource, &Holder::new(200, "b"), Duration::from_secs(30))
            .unwrap();
        assert_eq!(expired.holder.pid, 200);

        probe.kill(200);
        let dead = lock
            .try_acquire(&resource, &Holder::new(100, "a"), Duration::from_secs(30))
            .unwrap();
        assert_eq!(dead.holder.pid, 100);
        assert!(dead.token > expired.token);
    }

    #[test]
    fn test_reclaim_keeps_young_unreadable_record() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let path = lock_path(&resource);
        fs::write(&path, "").unwrap();
        let probe = MockProcessProbe::new().with_alive(&[100]);
        let lock = lock_with(&probe);

        // Judged old by a caller, but fresh when re-checked under the guard.
        assert!(!lock
            .reclaim(&path, StaleRecord::Unreadable(Duration::from_secs(30)))
            .unwrap());
        assert!(path.exists());

        std::thread::sleep(Duration::from_millis(5));
        assert!(lock
            .reclaim(&path, StaleRecord::Unreadable(Duration::from_millis(1)))
            .unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_exactly_one_concurrent_acquirer_wins() {
        let temp = TempDir::new().unwrap();
        let resource = Arc::new(temp.path().join("registry.json"));
        let pids: Vec<u32> = (1000..1008).collect();
        let probe = MockProcessProbe::new().with_alive(&pids);
        let lock = Arc::new(FileLeaseLock::new(
            LockConfig::default().with_max_attempts(1),
            Arc::new(probe),
        ));
        let barrier = Arc::new(Barrier::new(pids.len()));

        let handles: Vec<_> = pids
            .iter()
            .map(|&pid| {
                let lock = Arc::clone(&lock);
                let resource = Arc::clone(&resource);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    lock.try_acquire(&resource, &Holder::new(pid, "racer"), Duration::from_secs(30))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_with_lease_releases_on_error() {
        let temp = TempDir::new().unwrap();
        let resource = temp.path().join("registry.json");
        let probe = MockProcessProbe::new().with_alive(&[100]);
        let lock = lock_with(&probe);
        let holder = Holder::new(100, "a");

        let result: Result<()> = with_lease(&lock, &resource, &holder, Duration::from_secs(30), |_| {
            Err(FleetError::not_found("x"))
        });
        assert!(result.is_err());
        assert!(!lock_path(&resource).exists());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = LockConfig::default().with_backoff(10, 50);
        assert_eq!(config.backoff(1), Duration::from_millis(10));
        assert_eq!(config.backoff(2), Duration::from_millis(20));
        assert_eq!(config.backoff(3), Duration::from_millis(40));
        assert_eq!(config.backoff(4), Duration::from_millis(50));
        assert_eq!(config.backoff(40), Duration::from_millis(50));
    }

    #[test]
    fn test_config_validation() {
        assert!(LockConfig::default().validate().is_ok());
        assert!(LockConfig::default().with_max_attempts(0).validate().is_err());
        assert!(LockConfig::default().with_backoff(100, 10).validate().is_err());
    }
}

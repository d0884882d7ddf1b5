//! Process liveness monitoring.
//!
//! Every loop writes a heartbeat (`heartbeats/<id>.json`) once per
//! iteration. A sweep compares each running loop against two independent
//! facts:
//!
//! - is its owner pid still in the process table? If not, the loop crashed.
//! - is its heartbeat younger than the threshold? If not while the process
//!   lives, the loop is hung.
//!
//! Sweeps return [`LivenessSignal`] values; acting on them is the recovery
//! engine's job. [`LivenessMonitor::spawn_monitor`] runs sweeps on a tokio
//! interval and streams signals over a channel.

mod probe;

pub use probe::SystemProbe;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::Registry;
use crate::state::LoopStatus;
use crate::storage::{load_json, save_json, Persistence};
use crate::testing::ProcessProbe;

const HEARTBEATS_DIR: &str = "heartbeats";

/// Liveness monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessConfig {
    /// Heartbeat age after which a live loop is reported as stale.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    /// Interval between background sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_stale_threshold_ms() -> u64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: default_stale_threshold_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl LivenessConfig {
    #[must_use]
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.stale_threshold_ms == 0 {
            return Err("liveness.staleThresholdMs must be positive".to_string());
        }
        if self.sweep_interval_ms == 0 {
            return Err("liveness.sweepIntervalMs must be positive".to_string());
        }
        Ok(())
    }
}

/// Last sign of life from a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub loop_id: String,
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub status: LoopStatus,
    pub pid: u32,
}

impl Heartbeat {
    /// Age of the heartbeat at `now`. Future timestamps count as zero.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Something a sweep noticed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessSignal {
    /// The owner process is gone.
    Crashed { loop_id: String, pid: u32 },
    /// The owner process lives but has not beaten within the threshold.
    /// `age` is `None` when no heartbeat was ever written.
    Stale {
        loop_id: String,
        pid: u32,
        age: Option<Duration>,
    },
}

impl LivenessSignal {
    #[must_use]
    pub fn loop_id(&self) -> &str {
        match self {
            Self::Crashed { loop_id, .. } | Self::Stale { loop_id, .. } => loop_id,
        }
    }
}

/// A loop to check during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepTarget {
    pub loop_id: String,
    pub pid: u32,
}

/// Heartbeat store and sweeper.
pub struct LivenessMonitor {
    dir: PathBuf,
    store: Arc<dyn Persistence>,
    probe: Arc<dyn ProcessProbe>,
    registry: Arc<Registry>,
}

impl LivenessMonitor {
    pub fn new(
        root: &Path,
        store: Arc<dyn Persistence>,
        probe: Arc<dyn ProcessProbe>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            dir: root.join(HEARTBEATS_DIR),
            store,
            probe,
            registry,
        }
    }

    fn heartbeat_path(&self, loop_id: &str) -> PathBuf {
        self.dir.join(format!("{loop_id}.json"))
    }

    /// Overwrite the loop's heartbeat with one stamped now by this process.
    pub fn record_heartbeat(
        &self,
        loop_id: &str,
        iteration: u32,
        status: LoopStatus,
    ) -> Result<Heartbeat> {
        let heartbeat = Heartbeat {
            loop_id: loop_id.to_string(),
            timestamp: Utc::now(),
            iteration,
            status,
            pid: std::process::id(),
        };
        save_json(self.store.as_ref(), &self.heartbeat_path(loop_id), &heartbeat)?;
        debug!(loop_id, iteration, "Recorded heartbeat");
        Ok(heartbeat)
    }

    pub fn read_heartbeat(&self, loop_id: &str) -> Result<Option<Heartbeat>> {
        load_json(self.store.as_ref(), &self.heartbeat_path(loop_id))
    }

    pub fn remove_heartbeat(&self, loop_id: &str) -> Result<()> {
        self.store.remove(&self.heartbeat_path(loop_id))
    }

    /// Returns true if the loop has no heartbeat or it is older than
    /// `threshold`.
    pub fn is_stale(&self, loop_id: &str, threshold: Duration) -> Result<bool> {
        self.is_stale_at(loop_id, threshold, Utc::now())
    }

    /// [`Self::is_stale`] evaluated at an explicit instant.
    pub fn is_stale_at(
        &self,
        loop_id: &str,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(match self.read_heartbeat(loop_id)? {
            Some(heartbeat) => heartbeat.age_at(now) > threshold,
            None => true,
        })
    }

    #[must_use]
    pub fn is_process_alive(&self, pid: u32) -> bool {
        self.probe.is_alive(pid)
    }

    /// Check each target once.
    ///
    /// Unreadable heartbeats are logged and treated as absent.
    pub fn sweep(&self, targets: &[SweepTarget], threshold: Duration) -> Vec<LivenessSignal> {
        let now = Utc::now();
        let mut signals = Vec::new();

        for target in targets {
            if !self.probe.is_alive(target.pid) {
                warn!(loop_id = %target.loop_id, pid = target.pid, "Loop owner process is gone");
                signals.push(LivenessSignal::Crashed {
                    loop_id: target.loop_id.clone(),
                    pid: target.pid,
                });
                continue;
            }

            let heartbeat = self.read_heartbeat(&target.loop_id).unwrap_or_else(|e| {
                warn!(loop_id = %target.loop_id, error = %e, "Unreadable heartbeat");
                None
            });
            let age = heartbeat.map(|hb| hb.age_at(now));
            if age.map_or(true, |age| age > threshold) {
                info!(
                    loop_id = %target.loop_id,
                    age_secs = age.map(|a| a.as_secs()),
                    "Loop heartbeat is stale"
                );
                signals.push(LivenessSignal::Stale {
                    loop_id: target.loop_id.clone(),
                    pid: target.pid,
                    age,
                });
            }
        }

        signals
    }

    /// Sweep every registry entry whose status expects a live owner.
    pub fn sweep_registry(&self, threshold: Duration) -> Result<Vec<LivenessSignal>> {
        let targets: Vec<SweepTarget> = self
            .registry
            .list_active()?
            .into_iter()
            .filter(|entry| entry.status.is_active())
            .map(|entry| SweepTarget {
                loop_id: entry.loop_id,
                pid: entry.pid,
            })
            .collect();
        Ok(self.sweep(&targets, threshold))
    }

    /// Sweep the registry every `interval`, sending signals to `tx`.
    ///
    /// The task ends when the receiver is dropped.
    pub fn spawn_monitor(
        self: Arc<Self>,
        interval: Duration,
        threshold: Duration,
        tx: mpsc::Sender<LivenessSignal>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                let monitor = Arc::clone(&self);
                let swept =
                    tokio::task::spawn_blocking(move || monitor.sweep_registry(threshold)).await;
                let signals = match swept {
                    Ok(Ok(signals)) => signals,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Liveness sweep failed");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Liveness sweep task panicked");
                        continue;
                    }
                };

                for signal in signals {
                    if tx.send(signal).await.is_err() {
                        debug!("Liveness receiver dropped, stopping monitor");
                        return;
                    }
                }
            }
        })
    }
}

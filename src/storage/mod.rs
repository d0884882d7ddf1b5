//! Persistence port with atomic write semantics.
//!
//! Every durable artifact in the fleet (registry, loop records, heartbeats,
//! checkpoints) goes through [`Persistence`]. The flat-file backend
//! [`FilePersistence`] writes to a temporary sibling, syncs it and renames it
//! over the target, so a concurrent reader observes either the old or the new
//! document, never a partial one.
//!
//! The control logic only depends on the trait; swapping the backing store
//! does not touch it.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::Result;

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = "tmp";

/// Per-process sequence making every temp name unique.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Storage backend for fleet documents.
///
/// Keys are paths; backends other than the filesystem are free to treat
/// them as opaque identifiers.
pub trait Persistence: Send + Sync {
    /// Load a document. Returns `Ok(None)` when it does not exist.
    fn load(&self, key: &Path) -> Result<Option<Vec<u8>>>;

    /// Atomically replace a document, creating parent containers as needed.
    fn save(&self, key: &Path, bytes: &[u8]) -> Result<()>;

    /// Remove a document. Removing a missing document is not an error.
    fn remove(&self, key: &Path) -> Result<()>;

    /// Check whether a document exists.
    fn exists(&self, key: &Path) -> bool;
}

/// Flat-file persistence using write-to-temp-then-rename.
#[derive(Debug, Clone, Default)]
pub struct FilePersistence;

impl FilePersistence {
    /// Creates a new file persistence backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Returns a fresh temporary path for one write of `key`.
    ///
    /// The name carries the process id and a per-process sequence number, so
    /// no two writers (threads or processes) share a temp file.
    #[must_use]
    pub fn tmp_path(key: &Path) -> PathBuf {
        let name = key
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        key.with_file_name(format!(
            "{name}.{}.{seq}.{TMP_SUFFIX}",
            std::process::id()
        ))
    }
}

impl Persistence for FilePersistence {
    fn load(&self, key: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(key) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = key.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = Self::tmp_path(key);
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(bytes)?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        if let Err(e) = fs::rename(&tmp_path, key) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        trace!(path = %key.display(), bytes = bytes.len(), "Saved document");
        Ok(())
    }

    fn remove(&self, key: &Path) -> Result<()> {
        match fs::remove_file(key) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &Path) -> bool {
        key.exists()
    }
}

/// Load and deserialize a JSON document.
///
/// # Errors
///
/// Returns `FleetError::Json` when the document exists but does not parse.
pub fn load_json<T: DeserializeOwned>(store: &dyn Persistence, key: &Path) -> Result<Option<T>> {
    match store.load(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize a value as pretty JSON and save it atomically.
pub fn save_json<T: Serialize>(store: &dyn Persistence, key: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    store.save(key, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn test_load_missing_returns_none() {
        let temp = TempDir::new().expect("temp dir");
        let store = FilePersistence::new();
        let loaded = store.load(&temp.path().join("missing.json")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let temp = TempDir::new().expect("temp dir");
        let store = FilePersistence::new();
        let key = temp.path().join("deep").join("nested").join("doc.json");

        store.save(&key, b"{}").expect("save");
        assert!(key.exists());
    }

    fn tmp_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .expect("read dir")
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(TMP_SUFFIX))
                    .unwrap_or(false)
            })
            .count()
    }

    #[test]
    fn test_save_leaves_no_tmp_file() {
        let temp = TempDir::new().expect("temp dir");
        let store = FilePersistence::new();
        let key = temp.path().join("doc.json");

        store.save(&key, b"first").expect("save");
        store.save(&key, b"second").expect("save again");

        assert_eq!(tmp_files(temp.path()), 0);
        assert_eq!(fs::read(&key).expect("read"), b"second");
    }

    #[test]
    fn test_tmp_paths_are_unique_per_write() {
        let key = Path::new("/fleet/registry.json");
        assert_ne!(FilePersistence::tmp_path(key), FilePersistence::tmp_path(key));
    }

    #[test]
    fn test_concurrent_saves_in_one_process() {
        let temp = TempDir::new().expect("temp dir");
        let key = temp.path().join("doc.json");
        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![b'a' + i; 64 * 1024]).collect();

        std::thread::scope(|scope| {
            for payload in &payloads {
                let key = &key;
                scope.spawn(move || {
                    let store = FilePersistence::new();
                    for _ in 0..10 {
                        store.save(key, payload).expect("save");
                    }
                });
            }
        });

        let stored = fs::read(&key).expect("read");
        assert!(payloads.contains(&stored));
        assert_eq!(tmp_files(temp.path()), 0);
    }

    #[test]
    fn test_json_helpers() {
        let temp = TempDir::new().expect("temp dir");
        let store = FilePersistence::new();
        let key = temp.path().join("doc.json");
        let doc = Doc {
            name: "registry".into(),
            count: 3,
        };

        save_json(&store, &key, &doc).expect("save");
        let loaded: Option<Doc> = load_json(&store, &key).expect("load");
        assert_eq!(loaded, Some(doc));
    }

    #[test]
    fn test_load_json_reports_corruption() {
        let temp = TempDir::new().expect("temp dir");
        let store = FilePersistence::new();
        let key = temp.path().join("doc.json");
        fs::write(&key, "not valid json {{{").expect("write");

        let result: Result<Option<Doc>> = load_json(&store, &key);
        assert!(matches!(result, Err(crate::error::FleetError::Json(_))));
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let temp = TempDir::new().expect("temp dir");
        let store = FilePersistence::new();
        store.remove(&temp.path().join("gone.json")).expect("remove");
    }
}

//! Byte-oriented key/value storage used for job bodies, the job registry and
//! remote replication of provenance entries.
//!
//! Keys are opaque `/`-separated strings. Backends enforce their own limits;
//! [`LocalBackend`] rejects keys that could escape its root.

use crate::fsutil::{atomic_write_bytes, ensure_dir};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use walkdir::WalkDir;

pub type StorageResult<T> = Result<T, StorageError>;
pub type DynBackend = Arc<dyn StorageBackend>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key not found: {key}")]
    NotFound { key: String },
    #[error("storage backend unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("I/O error for key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("JSON error for key '{key}': {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }

    /// Worth retrying: the backend may recover without the caller changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. } | StorageError::Io { .. })
    }
}

pub trait StorageBackend: Send + Sync + fmt::Debug {
    fn exists(&self, key: &str) -> StorageResult<bool>;
    /// Fails with [`StorageError::NotFound`] when `key` is absent.
    fn load(&self, key: &str) -> StorageResult<Vec<u8>>;
    /// Overwrites any existing value.
    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()>;
    /// Fails with [`StorageError::NotFound`] when `key` is absent.
    fn delete(&self, key: &str) -> StorageResult<()>;
    /// Keys starting with `prefix`, sorted.
    fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// JSON helpers available on every backend, including `dyn StorageBackend`.
pub trait StorageBackendExt: StorageBackend {
    fn save_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
            key: key.to_string(),
            source,
        })?;
        self.save(key, &bytes)
    }

    fn load_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<T> {
        let bytes = self.load(key)?;
        serde_json::from_slice(&bytes).map_err(|source| StorageError::Json {
            key: key.to_string(),
            source,
        })
    }
}

impl<B: StorageBackend + ?Sized> StorageBackendExt for B {}

fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = |reason| {
        Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    if key.is_empty() {
        return invalid("key is empty");
    }
    if key.starts_with('/') {
        return invalid("key must be relative");
    }
    if key.contains('\\') {
        return invalid("key must use '/' separators");
    }
    for segment in key.split('/') {
        match segment {
            "" => return invalid("key has an empty segment"),
            "." | ".." => return invalid("key has a relative segment"),
            _ => {}
        }
    }
    Ok(())
}

/// Filesystem backend rooted at a directory; every save is an atomic rename.
#[derive(Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("root", &self.root)
            .finish()
    }
}

impl LocalBackend {
    /// Opens (and creates) a backend rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        ensure_dir(&root).map_err(|err| StorageError::Unavailable {
            reason: format!("cannot create {}: {}", root.display(), err),
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_root(&self) -> StorageResult<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                reason: format!("storage root {} is missing", self.root.display()),
            })
        }
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        self.check_root()?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    fn map_io(key: &str, err: io::Error) -> StorageError {
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound {
                key: key.to_string(),
            },
            ErrorKind::PermissionDenied => StorageError::Unavailable {
                reason: format!("permission denied for '{}': {}", key, err),
            },
            _ => StorageError::Io {
                key: key.to_string(),
                source: err,
            },
        }
    }
}

impl StorageBackend for LocalBackend {
    fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        path.try_exists()
            .map(|found| found && path.is_file())
            .map_err(|err| Self::map_io(key, err))
    }

    fn load(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_path(key)?;
        fs::read(&path).map_err(|err| Self::map_io(key, err))
    }

    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.key_path(key)?;
        atomic_write_bytes(&path, data).map_err(|err| Self::map_io(key, err))
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        fs::remove_file(&path).map_err(|err| Self::map_io(key, err))
    }

    fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check_root()?;
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|err| StorageError::Unavailable {
                reason: format!("cannot walk {}: {}", self.root.display(), err),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            // In-flight atomic writes are dot-prefixed temp files.
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process backend. `set_offline(true)` makes every call fail as
/// unavailable, which is how tests exercise outage handling.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    offline: Arc<AtomicBool>,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.read().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("MemoryBackend")
            .field("entries", &len)
            .field("offline", &self.offline.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "memory backend is offline".to_string(),
            });
        }
        Ok(())
    }

    fn poisoned() -> StorageError {
        StorageError::Unavailable {
            reason: "memory backend lock poisoned".to_string(),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        self.check_online()?;
        let guard = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(guard.contains_key(key))
    }

    fn load(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        self.check_online()?;
        let guard = self.entries.read().map_err(|_| Self::poisoned())?;
        guard.get(key).cloned().ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    fn save(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.check_online()?;
        let mut guard = self.entries.write().map_err(|_| Self::poisoned())?;
        guard.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.check_online()?;
        let mut guard = self.entries.write().map_err(|_| Self::poisoned())?;
        guard
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.check_online()?;
        let guard = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(guard
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn exercise_backend(backend: &dyn StorageBackend) {
        assert!(!backend.exists("jobs/a.json").expect("exists"));
        backend.save("jobs/a.json", b"one").expect("save");
        backend.save("jobs/nested/b.json", b"two").expect("save");
        backend.save("other/c.json", b"three").expect("save");
        assert!(backend.exists("jobs/a.json").expect("exists"));
        assert_eq!(backend.load("jobs/a.json").expect("load"), b"one");

        backend.save("jobs/a.json", b"uno").expect("overwrite");
        assert_eq!(backend.load("jobs/a.json").expect("load"), b"uno");

        assert_eq!(
            backend.list_keys("jobs/").expect("list"),
            vec!["jobs/a.json".to_string(), "jobs/nested/b.json".to_string()]
        );

        backend.delete("jobs/a.json").expect("delete");
        assert!(backend.load("jobs/a.json").expect_err("gone").is_not_found());
        assert!(backend
            .delete("jobs/a.json")
            .expect_err("delete twice")
            .is_not_found());
    }

    #[test]
    fn local_backend_contract() {
        let dir = TempDir::new().expect("tmp");
        let backend = LocalBackend::open(dir.path().join("store")).expect("open");
        exercise_backend(&backend);
    }

    #[test]
    fn memory_backend_contract() {
        exercise_backend(&MemoryBackend::new());
    }

    #[test]
    fn json_helpers_work_through_dyn_backend() {
        let backend: DynBackend = Arc::new(MemoryBackend::new());
        backend
            .save_json("jobs/x.json", &json!({"job_id": "x"}))
            .expect("save");
        let value: serde_json::Value = backend.load_json("jobs/x.json").expect("load");
        assert_eq!(value["job_id"], "x");

        backend.save("jobs/bad.json", b"{not json").expect("save");
        let err = backend
            .load_json::<serde_json::Value>("jobs/bad.json")
            .expect_err("malformed");
        assert!(matches!(err, StorageError::Json { .. }));
    }

    #[test]
    fn local_backend_rejects_escaping_keys() {
        let dir = TempDir::new().expect("tmp");
        let backend = LocalBackend::open(dir.path()).expect("open");
        for key in ["", "/abs", "a/../b", "a//b", "a\\b"] {
            let err = backend.save(key, b"x").expect_err("invalid key");
            assert!(matches!(err, StorageError::InvalidKey { .. }), "{key}: {err}");
        }
    }

    #[test]
    fn local_backend_reports_missing_root_as_unavailable() {
        let dir = TempDir::new().expect("tmp");
        let root = dir.path().join("gone");
        let backend = LocalBackend::open(&root).expect("open");
        fs::remove_dir_all(&root).expect("remove root");
        assert!(backend.load("jobs/a.json").expect_err("down").is_unavailable());
        assert!(backend.list_keys("").expect_err("down").is_unavailable());
    }

    #[test]
    fn offline_memory_backend_is_unavailable_not_missing() {
        let backend = MemoryBackend::new();
        backend.save("k", b"v").expect("save");
        backend.set_offline(true);
        let err = backend.load("k").expect_err("offline");
        assert!(err.is_unavailable());
        assert!(!err.is_not_found());
        backend.set_offline(false);
        assert_eq!(backend.load("k").expect("back online"), b"v");
    }
}

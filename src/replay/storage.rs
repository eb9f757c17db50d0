//! Raw tick storage backends.
//!
//! Raw files are addressed by a relative, `/`-separated key
//! (`trades/2024-01-25/BTCUSDT-BINANCE.csv`). The same key resolves against a
//! local directory tree or an object-storage bucket/prefix.

use crate::replay::error::{ReplayError, ReplayResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Read-only access to the raw tick tree.
pub trait RawStorage: Send + Sync {
    /// Whether an object exists at `key`.
    fn exists(&self, key: &str) -> ReplayResult<bool>;

    /// Full contents of the object at `key`.
    fn read(&self, key: &str) -> ReplayResult<Vec<u8>>;

    /// All keys under `prefix`, sorted.
    fn list(&self, prefix: &str) -> ReplayResult<Vec<String>>;

    /// Human-readable location for logs and errors.
    fn describe(&self) -> String;
}

/// Where raw tick files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageLocation {
    Local {
        root: PathBuf,
    },
    Object {
        bucket: String,
        prefix: String,
        /// Local tree copied into the bucket when the backend is opened.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mirror_from: Option<PathBuf>,
    },
}

impl Default for StorageLocation {
    fn default() -> Self {
        Self::Local {
            root: PathBuf::from("data/raw"),
        }
    }
}

impl StorageLocation {
    /// Open a backend for this location.
    pub fn open(&self) -> ReplayResult<Arc<dyn RawStorage>> {
        match self {
            Self::Local { root } => Ok(Arc::new(LocalStorage::new(root))),
            Self::Object {
                bucket,
                prefix,
                mirror_from,
            } => {
                let storage = ObjectStorage::new(bucket, prefix);
                if let Some(dir) = mirror_from {
                    let copied = storage.mirror_directory(dir)?;
                    debug!(bucket = %bucket, objects = copied, "Mirrored local tree into bucket");
                }
                Ok(Arc::new(storage))
            }
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.trim_matches('/').to_string()
}

// =============================================================================
// LOCAL
// =============================================================================

/// Raw files under a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> PathBuf {
        normalize_key(key)
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> ReplayResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl RawStorage for LocalStorage {
    fn exists(&self, key: &str) -> ReplayResult<bool> {
        Ok(self.resolve(key).is_file())
    }

    fn read(&self, key: &str) -> ReplayResult<Vec<u8>> {
        let path = self.resolve(key);
        std::fs::read(&path)
            .map_err(|e| ReplayError::Storage(format!("read {}: {}", path.display(), e)))
    }

    fn list(&self, prefix: &str) -> ReplayResult<Vec<String>> {
        let dir = self.resolve(prefix);
        let mut keys = Vec::new();
        if dir.is_dir() {
            self.walk(&dir, &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

// =============================================================================
// OBJECT
// =============================================================================

/// Bucket/prefix-addressed object store held in process.
///
/// Objects are put by key; the network transport for a real bucket sits
/// outside this crate.
#[derive(Debug, Default)]
pub struct ObjectStorage {
    bucket: String,
    prefix: String,
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl ObjectStorage {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: normalize_key(&prefix.into()),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    fn object_path(&self, key: &str) -> String {
        let key = normalize_key(key);
        if self.prefix.is_empty() {
            key
        } else if key.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// Store an object under `key` (relative to the prefix).
    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        let path = self.object_path(key);
        debug!(bucket = %self.bucket, path = %path, bytes = bytes.len(), "Put object");
        self.objects.write().insert(path, bytes);
    }

    /// Copy every file under a local directory into the bucket.
    pub fn mirror_directory<P: AsRef<Path>>(&self, dir: P) -> ReplayResult<usize> {
        let local = LocalStorage::new(dir);
        let keys = local.list("")?;
        for key in &keys {
            self.put(key, local.read(key)?);
        }
        Ok(keys.len())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl RawStorage for ObjectStorage {
    fn exists(&self, key: &str) -> ReplayResult<bool> {
        Ok(self.objects.read().contains_key(&self.object_path(key)))
    }

    fn read(&self, key: &str) -> ReplayResult<Vec<u8>> {
        let path = self.object_path(key);
        self.objects.read().get(&path).cloned().ok_or_else(|| {
            ReplayError::Storage(format!("object s3://{}/{} not found", self.bucket, path))
        })
    }

    fn list(&self, prefix: &str) -> ReplayResult<Vec<String>> {
        let full = self.object_path(prefix);
        let strip = if self.prefix.is_empty() {
            0
        } else {
            self.prefix.len() + 1
        };
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|k| full.is_empty() || *k == &full || k.starts_with(&format!("{}/", full)))
            .map(|k| k[strip..].to_string())
            .collect())
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

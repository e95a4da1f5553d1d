//! Persistent key-value store
//!
//! The vault treats the store as at-least-as-durable-as-the-device storage
//! and never implements durability itself. Keys are `/`-separated paths.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Opaque `get/set/delete` storage used for envelopes, records, salt, counters and history.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Keys starting with `prefix`, in lexical order.
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Nazwy kluczy per profil
pub mod keys {
    pub const SALT: &str = "salt";
    pub const FIRST_SEEN: &str = "first_seen";
    pub const HASH_RECORD: &str = "hash_record";
    pub const ENVELOPE: &str = "master_envelope";
    pub const PEPPER_KEY: &str = "pepper_key";
    pub const PEPPER_TAG: &str = "pepper_tag";
    pub const FAILED_ATTEMPTS: &str = "failed_attempts";
    pub const WIPE_HISTORY: &str = "wipe_history";
    pub const WIPED_MARKER: &str = "wiped";
    pub const APP_SECRETS: &str = "secrets/";

    /// `<profile>/<name>`
    pub fn scoped(profile: &str, name: &str) -> String {
        format!("{}/{}", profile, name)
    }
}

/// Segments starting with `.` are reserved for the file store's own files
fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|seg| !seg.is_empty() && !seg.starts_with('.'))
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY STORE
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory store for tests and ephemeral profiles
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let mut entries = self.entries.write();
        if let Some(mut old) = entries.insert(key.to_string(), value.to_vec()) {
            old.zeroize();
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        if let Some(mut old) = self.entries.write().remove(key) {
            old.zeroize();
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FILE STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Writes are staged here, outside the key namespace
const STAGING_DIR: &str = ".staging";

/// One file per key under a root directory
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: &Path) -> StoreResult<Self> {
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> StoreResult<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.full_path(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a staged temp file, fsync, then rename over the target
    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let path = self.full_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging)?;
        let mut temp = NamedTempFile::new_in(&staging)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        temp.write_all(value)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    /// Overwrite with zeros before unlinking
    fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.full_path(key)?;
        if !path.exists() {
            return Ok(());
        }

        let size = fs::metadata(&path)?.len() as usize;
        if size > 0 {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            let zeros = vec![0u8; size.min(1024 * 1024)];
            let mut remaining = size;
            while remaining > 0 {
                let chunk = remaining.min(zeros.len());
                file.write_all(&zeros[..chunk])?;
                remaining -= chunk;
            }
            file.sync_all()?;
        }

        fs::remove_file(&path)?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

//! Named slots of local durable storage, the equivalent of a browser's local storage.
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CacheError;

/// Slot holding the JSON-encoded pending queue.
pub const QUEUE_SLOT: &str = "lce_monitor_cache";
/// Slot holding the last unique-visit time, in epoch milliseconds.
pub const UV_SLOT: &str = "lce_monitor_uv";

pub trait CacheStore: Send + Sync {
    fn load(&self, slot: &str) -> Result<Option<String>, CacheError>;
    /// Overwrite the slot.
    fn save(&self, slot: &str, value: &str) -> Result<(), CacheError>;
    /// Erase the slot. Erasing a missing slot is not an error.
    fn remove(&self, slot: &str) -> Result<(), CacheError>;
}

/// One file per slot inside a directory.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self { dir })
    }

    fn path(&self, slot: &str) -> PathBuf {
        self.dir.join(format!("{}.json", slot))
    }
}

impl CacheStore for FileCache {
    fn load(&self, slot: &str) -> Result<Option<String>, CacheError> {
        match fs::read_to_string(self.path(slot)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, slot: &str, value: &str) -> Result<(), CacheError> {
        // Write then rename, so a crash never leaves a half written slot behind
        let tmp = self.dir.join(format!("{}.json.tmp", slot));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, self.path(slot))?;
        Ok(())
    }

    fn remove(&self, slot: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path(slot)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local cache. Clones share their slots; writes can be made to fail to
/// simulate an exhausted storage quota.
#[derive(Clone, Default)]
pub struct MemoryCache {
    slots: Arc<Mutex<HashMap<String, String>>>,
    reject_writes: Arc<AtomicBool>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, CacheError> {
        self.slots
            .lock()
            .map_err(|_| CacheError::Unavailable("poisoned cache lock".to_owned()))
    }

    fn check_writable(&self) -> Result<(), CacheError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("quota exceeded".to_owned()));
        }
        Ok(())
    }
}

impl CacheStore for MemoryCache {
    fn load(&self, slot: &str) -> Result<Option<String>, CacheError> {
        Ok(self.slots()?.get(slot).cloned())
    }

    fn save(&self, slot: &str, value: &str) -> Result<(), CacheError> {
        self.check_writable()?;
        self.slots()?.insert(slot.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, slot: &str) -> Result<(), CacheError> {
        self.check_writable()?;
        self.slots()?.remove(slot);
        Ok(())
    }
}

//! Device-local string key-value caches.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{EngineError, ResultEngine};

/// A string-keyed persistent store scoped to the device.
pub trait LocalCache: Send + Sync {
    fn get(&self, key: &str) -> ResultEngine<Option<String>>;
    fn set(&self, key: &str, value: &str) -> ResultEngine<()>;
}

impl<C: LocalCache + ?Sized> LocalCache for Arc<C> {
    fn get(&self, key: &str) -> ResultEngine<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> ResultEngine<()> {
        (**self).set(key, value)
    }
}

/// Process-local cache, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    fn get(&self, key: &str) -> ResultEngine<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::LocalCache("cache lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ResultEngine<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::LocalCache("cache lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Cache persisted as a single JSON object on disk.
///
/// The file is read on every access so several processes on the same
/// device observe each other's writes.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> ResultEngine<BTreeMap<String, String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> ResultEngine<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

impl LocalCache for FileCache {
    fn get(&self, key: &str) -> ResultEngine<Option<String>> {
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ResultEngine<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| EngineError::LocalCache("cache lock poisoned".to_string()))?;
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join("engine_local_cache")
            .join(format!("{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let cache = FileCache::new(temp_path());
        assert_eq!(cache.get("anything").unwrap(), None);
    }

    #[test]
    fn file_cache_persists_between_instances() {
        let path = temp_path();
        FileCache::new(&path).set("k", "v").unwrap();
        FileCache::new(&path).set("other", "w").unwrap();

        let cache = FileCache::new(&path);
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(cache.get("other").unwrap().as_deref(), Some("w"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();
        assert!(FileCache::new(&path).get("k").is_err());
        let _ = fs::remove_file(path);
    }
}

//! Durable JSON document storage
//!
//! Each document is rewritten whole on every save: the new content goes to
//! `<file>.tmp` and is renamed over the old file, so a crash mid-write
//! leaves the previous document intact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A single JSON document on disk (or nowhere, for memory-only runs)
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: Option<PathBuf>,
}

impl JsonStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Store that never touches disk
    pub fn memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the document, falling back to its default when absent
    pub async fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        let Some(path) = &self.path else {
            return Ok(T::default());
        };

        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(Error::Persistence(format!("read {}: {}", path.display(), e)))
            }
        };

        let value = serde_json::from_str(&data)
            .map_err(|e| Error::Persistence(format!("corrupted {}: {}", path.display(), e)))?;

        info!("Loaded state from {}", path.display());
        Ok(value)
    }

    /// Atomically replace the document
    pub async fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Persistence(format!("mkdir {}: {}", parent.display(), e)))?;
            }
        }

        let data = serde_json::to_string_pretty(value)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Persistence(format!("rename {}: {}", path.display(), e)))?;

        debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Delete the document if present
    pub async fn remove(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence(format!("remove {}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        counter: u32,
        names: Vec<String>,
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(Some(dir.path().join("nested").join("doc.json")));

        let doc = Doc {
            counter: 7,
            names: vec!["a".into()],
        };
        store.save(&doc).await.unwrap();

        let loaded: Doc = store.load().await.unwrap();
        assert_eq!(loaded, doc);
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_default() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(Some(dir.path().join("absent.json")));
        let loaded: Doc = store.load().await.unwrap();
        assert_eq!(loaded, Doc::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_racing_remove_never_errors() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(Some(dir.path().join("doc.json")));
        let remover = store.clone();

        for i in 0..100 {
            store.save(&Doc { counter: i, names: vec![] }).await.unwrap();
            let (loaded, removed) = tokio::join!(store.load::<Doc>(), remover.remove());
            removed.unwrap();
            let loaded = loaded.unwrap();
            assert!(loaded.counter == i || loaded == Doc::default());
        }
    }

    #[tokio::test]
    async fn test_corrupted_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonStore::new(Some(path));
        let result: Result<Doc> = store.load().await;
        assert!(matches!(result, Err(Error::Persistence(_))));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = JsonStore::new(Some(dir.path().join("doc.json")));
        store.save(&Doc::default()).await.unwrap();

        store.remove().await.unwrap();
        store.remove().await.unwrap();
        assert!(!dir.path().join("doc.json").exists());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = JsonStore::memory();
        store.save(&Doc { counter: 1, names: vec![] }).await.unwrap();
        let loaded: Doc = store.load().await.unwrap();
        assert_eq!(loaded.counter, 0);
    }
}

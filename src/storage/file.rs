//! File-backed storage engine.
//!
//! Persists each key as `<base_dir>/<key>.json`, so `role/deployer` lands in
//! `<base_dir>/role/deployer.json`. Files are written with owner-only
//! permissions since the config record holds the master credential.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{Storage, validate_key};
use crate::{Error, Result};

const EXTENSION: &str = "json";

/// Storage engine writing one JSON file per key
pub struct FileStorage {
    /// Base directory for all entries
    base_dir: PathBuf,
}

impl FileStorage {
    /// Create a file store rooted at `base_dir`, creating the directory if needed
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        if !base_dir.exists() {
            std::fs::create_dir_all(&base_dir)
                .map_err(|e| Error::Storage(format!("Failed to create storage dir: {e}")))?;
        }

        Ok(Self { base_dir })
    }

    /// Base directory of this store
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_dir.join(format!("{key}.{EXTENSION}")))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read '{key}': {e}"))),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.entry_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create '{}': {e}", parent.display())))?;
        }

        // Write to a sibling temp file then rename, so readers never see a torn entry
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write '{key}': {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = tokio::fs::set_permissions(&tmp, perms).await;
        }

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit '{key}': {e}")))?;

        debug!(key = %key, "Stored entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Deleted entry");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete '{key}': {e}"))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.base_dir.join(prefix.trim_end_matches('/'));
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Storage(format!("Failed to list '{prefix}': {e}"))),
        };

        let mut keys = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to list '{prefix}': {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        Ok(keys)
    }
}

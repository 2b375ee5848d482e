//! Persistence for the backend configuration and roles.
//!
//! The [`Storage`] trait is the narrow key-value interface the broker needs:
//! per-key atomic `get`/`put`/`delete` plus prefix listing. No cross-key
//! transactions are assumed, so role writes and config writes are independent.
//!
//! Values are opaque bytes; [`get_json`] and [`put_json`] layer JSON
//! (de)serialization on top, which is how every record in this crate is stored.
//!
//! # Keys
//!
//! | Key | Record |
//! |-----|--------|
//! | `config` | backend-wide balena configuration (singleton) |
//! | `role/<name>` | one role record per name |

mod file;
mod memory;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Trait abstracting the storage engine.
///
/// Implementations must be `Send + Sync` because one storage handle is shared
/// by every request handler.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Read the value stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List the keys directly under `prefix`, with the prefix stripped.
    ///
    /// Order is the engine's enumeration order; callers must not assume it
    /// is alphabetical.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and decode a JSON record.
pub async fn get_json<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
    match storage.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Storage(format!("corrupt entry at '{key}': {e}")))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Encode and write a JSON record.
pub async fn put_json<T: Serialize + ?Sized>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    storage.put(key, bytes).await
}

/// Reject keys that could escape a prefix or a base directory.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(Error::Storage(format!("invalid storage key '{key}'")));
    }
    Ok(())
}

//! Backend configuration store (the `config` singleton).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::storage::{self, Storage};
use crate::upstream::DEFAULT_API_URL;

/// Storage key of the configuration singleton
pub const CONFIG_KEY: &str = "config";

/// Backend-wide balena configuration as persisted.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// balena API base URL
    #[serde(default)]
    pub url: String,
    /// Backend-wide master credential, used when a role has no `api_key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl BackendConfig {
    /// Apply a partial update on top of `existing` (or a fresh record).
    ///
    /// A fresh record gets the public balena API URL unless the update names one.
    #[must_use]
    pub fn merged(existing: Option<Self>, update: ConfigUpdate) -> Self {
        let mut config = existing.unwrap_or_else(|| Self {
            url: DEFAULT_API_URL.to_string(),
            token: None,
        });
        if let Some(url) = update.url {
            config.url = url.trim().to_string();
        }
        if let Some(token) = update.token {
            config.token = (!token.is_empty()).then_some(token);
        }
        config
    }

    /// Public view: never includes the master credential
    #[must_use]
    pub fn view(&self) -> ConfigView {
        ConfigView {
            url: self.url.clone(),
        }
    }
}

/// Body of a configuration write. Omitted fields keep their stored value.
#[derive(Default, Deserialize)]
pub struct ConfigUpdate {
    /// balena API base URL
    #[serde(default)]
    pub url: Option<String>,
    /// Backend-wide master credential (an empty string clears it)
    #[serde(default)]
    pub token: Option<String>,
}

impl fmt::Debug for ConfigUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigUpdate")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Configuration as returned by reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigView {
    /// balena API base URL
    pub url: String,
}

/// Persists the configuration singleton.
///
/// Cache invalidation on change is the [`Broker`](super::Broker)'s job; this
/// type only moves records in and out of storage.
#[derive(Clone)]
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
}

impl ConfigStore {
    /// Create a store over `storage`
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Read the configuration, `None` if never written or deleted
    pub async fn get(&self) -> Result<Option<BackendConfig>> {
        storage::get_json(self.storage.as_ref(), CONFIG_KEY).await
    }

    /// Replace the configuration
    pub async fn put(&self, config: &BackendConfig) -> Result<()> {
        storage::put_json(self.storage.as_ref(), CONFIG_KEY, config).await
    }

    /// Remove the configuration
    pub async fn delete(&self) -> Result<()> {
        self.storage.delete(CONFIG_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn fresh_config_defaults_to_public_api() {
        let config = BackendConfig::merged(None, ConfigUpdate::default());
        assert_eq!(config.url, DEFAULT_API_URL);
        assert!(config.token.is_none());
    }

    #[test]
    fn partial_update_keeps_token() {
        // GIVEN: a stored config with a token
        let existing = BackendConfig {
            url: "https://a.example.com/".to_string(),
            token: Some("master".to_string()),
        };

        // WHEN: only the URL is updated
        let update = ConfigUpdate {
            url: Some("https://b.example.com/".to_string()),
            token: None,
        };
        let merged = BackendConfig::merged(Some(existing), update);

        // THEN: the token survives
        assert_eq!(merged.url, "https://b.example.com/");
        assert_eq!(merged.token.as_deref(), Some("master"));
    }

    #[test]
    fn empty_token_clears_it() {
        let existing = BackendConfig {
            url: "https://a.example.com/".to_string(),
            token: Some("master".to_string()),
        };
        let update = ConfigUpdate {
            url: None,
            token: Some(String::new()),
        };
        assert!(BackendConfig::merged(Some(existing), update).token.is_none());
    }

    #[test]
    fn debug_and_view_hide_token() {
        let config = BackendConfig {
            url: "https://a.example.com/".to_string(),
            token: Some("master-secret".to_string()),
        };
        assert!(!format!("{config:?}").contains("master-secret"));
        let view = serde_json::to_value(config.view()).unwrap();
        assert_eq!(view, serde_json::json!({"url": "https://a.example.com/"}));
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = ConfigStore::new(Arc::new(MemoryStorage::new()));
        assert!(store.get().await.unwrap().is_none());

        let config = BackendConfig {
            url: "https://api.example.com/".to_string(),
            token: Some("t".to_string()),
        };
        store.put(&config).await.unwrap();
        assert_eq!(store.get().await.unwrap(), Some(config));

        store.delete().await.unwrap();
        assert!(store.get().await.unwrap().is_none());
    }
}

//! Client cache: at most one live [`BalenaClient`] per broker.
//!
//! Every [`ClientCache::get_client`] call re-reads the configuration and
//! rebuilds the client under the write lock, so a configuration change can
//! never be observed half-applied and a stale client is never reused.
//! Building a client performs no network I/O, so the lock is held only for
//! one storage read plus construction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use super::config_store::ConfigStore;
use super::roles::Role;
use crate::upstream::BalenaClient;
use crate::{Error, Result};

/// Per-call overrides of the configured URL and master credential.
///
/// Blank values fall through to the backend configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientBinding<'a> {
    /// URL override (a role's `url`)
    pub url: Option<&'a str>,
    /// Master credential override (a role's `api_key`)
    pub credential: Option<&'a str>,
}

impl<'a> ClientBinding<'a> {
    /// Binding carrying a role's URL and credential
    #[must_use]
    pub fn for_role(role: &'a Role) -> Self {
        Self {
            url: Some(role.url.as_str()),
            credential: role.api_key.as_deref(),
        }
    }
}

/// Single-slot holder of the authenticated upstream client
pub struct ClientCache {
    slot: RwLock<Option<Arc<BalenaClient>>>,
    timeout: Duration,
}

impl ClientCache {
    /// Create an empty cache; built clients use `timeout` per request
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            slot: RwLock::new(None),
            timeout,
        }
    }

    /// Resolve configuration and return a freshly built client.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when no URL or no master credential can be resolved.
    pub async fn get_client(
        &self,
        config: &ConfigStore,
        binding: ClientBinding<'_>,
    ) -> Result<Arc<BalenaClient>> {
        let mut slot = self.slot.write().await;

        let stored = config.get().await?;
        let url = non_blank(binding.url)
            .or_else(|| stored.as_ref().and_then(|c| non_blank(Some(c.url.as_str()))))
            .ok_or_else(|| Error::Config("balena API URL is not configured".to_string()))?;
        let credential = non_blank(binding.credential)
            .or_else(|| stored.as_ref().and_then(|c| non_blank(c.token.as_deref())))
            .ok_or_else(|| {
                Error::Config(
                    "no master credential: set the role api_key or the configuration token"
                        .to_string(),
                )
            })?;

        let client = Arc::new(BalenaClient::new(url, credential, self.timeout)?);
        *slot = Some(Arc::clone(&client));
        debug!(url = %client.base_url(), "Rebuilt balena client");
        Ok(client)
    }

    /// Drop the cached client; the next [`get_client`](Self::get_client) rebuilds
    pub async fn invalidate(&self) {
        let mut slot = self.slot.write().await;
        if slot.take().is_some() {
            debug!("Invalidated cached balena client");
        }
    }

    /// The currently cached client, if any
    pub async fn current(&self) -> Option<Arc<BalenaClient>> {
        self.slot.read().await.clone()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::config_store::BackendConfig;
    use crate::storage::MemoryStorage;

    fn config_store() -> ConfigStore {
        ConfigStore::new(Arc::new(MemoryStorage::new()))
    }

    async fn configured(url: &str, token: Option<&str>) -> ConfigStore {
        let store = config_store();
        store
            .put(&BackendConfig {
                url: url.to_string(),
                token: token.map(str::to_string),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn missing_configuration_is_config_error() {
        // GIVEN: no configuration at all
        let cache = ClientCache::new(Duration::from_secs(5));

        // WHEN: a client is requested with only a credential
        let binding = ClientBinding {
            url: None,
            credential: Some("k"),
        };
        let err = cache.get_client(&config_store(), binding).await.unwrap_err();

        // THEN: configuration error, nothing cached
        assert!(matches!(err, Error::Config(_)));
        assert!(cache.current().await.is_none());
    }

    #[tokio::test]
    async fn missing_credential_is_config_error() {
        let cache = ClientCache::new(Duration::from_secs(5));
        let store = configured("https://api.example.com/", None).await;

        let err = cache
            .get_client(&store, ClientBinding::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("credential")));
    }

    #[tokio::test]
    async fn role_binding_overrides_configuration() {
        // GIVEN: a configuration and a role with its own URL
        let cache = ClientCache::new(Duration::from_secs(5));
        let store = configured("https://api.example.com/", Some("master")).await;
        let role = Role {
            name: "r".to_string(),
            url: "https://role.example.com/".to_string(),
            ..Role::default()
        };

        // WHEN: resolving a client for the role
        let client = cache
            .get_client(&store, ClientBinding::for_role(&role))
            .await
            .unwrap();

        // THEN: the role URL wins, the config token fills the credential
        assert_eq!(client.base_url().as_str(), "https://role.example.com/");
    }

    #[tokio::test]
    async fn every_call_rebuilds_from_current_configuration() {
        // GIVEN: a client built against the first URL
        let cache = ClientCache::new(Duration::from_secs(5));
        let store = configured("https://one.example.com/", Some("t")).await;
        let first = cache.get_client(&store, ClientBinding::default()).await.unwrap();

        // WHEN: the configuration changes underneath the cache
        store
            .put(&BackendConfig {
                url: "https://two.example.com/".to_string(),
                token: Some("t".to_string()),
            })
            .await
            .unwrap();
        let second = cache.get_client(&store, ClientBinding::default()).await.unwrap();

        // THEN: the new URL is observed and the cached slot was replaced
        assert_eq!(first.base_url().as_str(), "https://one.example.com/");
        assert_eq!(second.base_url().as_str(), "https://two.example.com/");
        let current = cache.current().await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
    }

    #[tokio::test]
    async fn invalidate_clears_slot() {
        let cache = ClientCache::new(Duration::from_secs(5));
        let store = configured("https://api.example.com/", Some("t")).await;
        cache.get_client(&store, ClientBinding::default()).await.unwrap();
        assert!(cache.current().await.is_some());

        cache.invalidate().await;
        assert!(cache.current().await.is_none());
    }
}

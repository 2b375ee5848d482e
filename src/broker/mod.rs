//! Credential lifecycle engine.
//!
//! The [`Broker`] owns the pieces of the lifecycle and wires them together:
//!
//! 1. **Configuration store** ([`ConfigStore`]): the backend-wide balena URL
//!    and optional master credential. Every mutation invalidates the client
//!    cache.
//! 2. **Role store** ([`RoleStore`]): named issuance policies (URL override,
//!    TTL, max TTL, optional role-scoped credential).
//! 3. **Client cache** ([`ClientCache`]): one authenticated balena client,
//!    rebuilt under a write lock on every use.
//! 4. **Issuance** ([`Broker::issue`]): mints one upstream key per call and
//!    returns it with a lease ([`Secret`]).
//! 5. **Lease callbacks** ([`Broker::handle_lease`]): revoke and renew, driven
//!    by an external lease scheduler.
//!
//! Every transition is recorded in the audit trail ([`audit`]).
//!
//! # Data flow
//!
//! ```text
//! creds/<role>
//!   -> RoleStore::get            role or NotFound
//!   -> ClientCache::get_client   role url/api_key, else config url/token
//!   -> POST api-key/user/full    exactly one upstream call
//!   -> Credential { data, secret }
//!
//! lease scheduler
//!   -> Revoke: GET v6/api_key?$filter=..  then DELETE v6/api_key(<id>)
//!   -> Renew:  local bookkeeping only
//! ```

pub mod audit;
pub mod cache;
pub mod config_store;
pub mod handler;
pub mod issue;
pub mod lease;
pub mod roles;

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::{Config, DEFAULT_LEASE_TTL, RevokeFailurePolicy};
use crate::storage::Storage;
use crate::{Error, Result};

pub use audit::AuditEvent;
pub use cache::{ClientBinding, ClientCache};
pub use config_store::{BackendConfig, ConfigStore, ConfigUpdate, ConfigView};
pub use issue::{Credential, CredentialData, DEFAULT_KEY_DESCRIPTION, IssueRequest, resolve_ttl};
pub use lease::{LeaseOperation, LeaseOutcome, SECRET_TYPE, Secret};
pub use roles::{Role, RoleStore, RoleUpdate, RoleView, normalize_role_name};

/// Operator policy the broker applies on top of stored records
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Per-request timeout of built upstream clients
    pub upstream_timeout: Duration,
    /// Added to the upstream key expiry beyond the lease TTL
    pub expiry_margin: Duration,
    /// Lease TTL when the role's TTL is zero
    pub default_ttl: Duration,
    /// Lease max TTL when the role's max TTL is zero
    pub max_ttl: Duration,
    /// Revoke behaviour when the upstream delete fails
    pub revoke_failure: RevokeFailurePolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
            expiry_margin: Duration::from_secs(2 * 3600),
            default_ttl: DEFAULT_LEASE_TTL,
            max_ttl: DEFAULT_LEASE_TTL,
            revoke_failure: RevokeFailurePolicy::Ignore,
        }
    }
}

impl From<&Config> for BrokerSettings {
    fn from(config: &Config) -> Self {
        Self {
            upstream_timeout: config.upstream.timeout,
            expiry_margin: config.upstream.expiry_margin,
            default_ttl: config.lease.default_ttl,
            max_ttl: config.lease.max_ttl,
            revoke_failure: config.lease.revoke_failure,
        }
    }
}

/// The credential broker. One instance per backend mount; instances share nothing.
pub struct Broker {
    config: ConfigStore,
    roles: RoleStore,
    clients: ClientCache,
    settings: BrokerSettings,
}

impl Broker {
    /// Create a broker over `storage`
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, settings: BrokerSettings) -> Self {
        Self {
            config: ConfigStore::new(Arc::clone(&storage)),
            roles: RoleStore::new(storage),
            clients: ClientCache::new(settings.upstream_timeout),
            settings,
        }
    }

    /// Active settings
    #[must_use]
    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// The client cache
    #[must_use]
    pub fn clients(&self) -> &ClientCache {
        &self.clients
    }

    // ── Configuration ──────────────────────────────────────────────────────

    /// Read the backend configuration (credential omitted)
    pub async fn read_config(&self) -> Result<Option<ConfigView>> {
        Ok(self.config.get().await?.map(|c| c.view()))
    }

    /// Create or partially update the backend configuration.
    pub async fn write_config(&self, update: ConfigUpdate) -> Result<ConfigView> {
        let existing = self.config.get().await?;
        let config = BackendConfig::merged(existing, update);
        if config.url.is_empty() {
            return Err(Error::Validation("url cannot be empty".to_string()));
        }
        Url::parse(&config.url)
            .map_err(|e| Error::Validation(format!("invalid url '{}': {e}", config.url)))?;

        self.config.put(&config).await?;
        self.clients.invalidate().await;
        audit::emit(&AuditEvent::config_written(&config.url));
        Ok(config.view())
    }

    /// Delete the backend configuration
    pub async fn delete_config(&self) -> Result<()> {
        self.config.delete().await?;
        self.clients.invalidate().await;
        audit::emit(&AuditEvent::config_deleted());
        Ok(())
    }

    // ── Roles ──────────────────────────────────────────────────────────────

    /// Read a role; `None` when absent
    pub async fn read_role(&self, name: &str) -> Result<Option<RoleView>> {
        let name = normalize_role_name(name)?;
        Ok(self.roles.get(&name).await?.map(|r| r.view()))
    }

    /// Create or partially update a role.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a bad name, a bad URL, or `ttl > max_ttl`
    /// with a nonzero `max_ttl`; nothing is written in that case.
    pub async fn write_role(&self, name: &str, update: RoleUpdate) -> Result<RoleView> {
        let name = normalize_role_name(name)?;
        let existing = self.roles.get(&name).await?;
        let role = Role::merged(&name, existing, update);
        self.roles.put(&role).await?;

        audit::emit(&AuditEvent::role_written(
            &role.name,
            role.ttl.as_secs(),
            role.max_ttl.as_secs(),
        ));
        Ok(role.view())
    }

    /// Delete a role. Outstanding leases are unaffected.
    pub async fn delete_role(&self, name: &str) -> Result<()> {
        let name = normalize_role_name(name)?;
        self.roles.delete(&name).await?;
        audit::emit(&AuditEvent::role_deleted(&name));
        Ok(())
    }

    /// Role names in storage order
    pub async fn list_roles(&self) -> Result<Vec<String>> {
        self.roles.list().await
    }
}

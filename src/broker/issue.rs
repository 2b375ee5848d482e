//! Token issuance engine.
//!
//! One call mints exactly one balena API key. Nothing is persisted locally:
//! the returned [`Secret`] carries what the lease scheduler needs to renew or
//! revoke the key later.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use super::Broker;
use super::audit::{self, AuditEvent};
use super::cache::ClientBinding;
use super::lease::{SECRET_TYPE, Secret};
use super::roles::normalize_role_name;
use crate::config::humantime_serde;
use crate::upstream::NewApiKey;
use crate::{Error, Result};

/// Description given to keys when the caller supplies none
pub const DEFAULT_KEY_DESCRIPTION: &str = "Broker managed balena API key";

/// Per-call issuance overrides.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct IssueRequest {
    /// Name to register the key under upstream (lowercased); defaults to the token id
    #[serde(default, rename = "balenaName")]
    pub name: Option<String>,
    /// Upstream key description
    #[serde(default, rename = "balenaDesc")]
    pub description: Option<String>,
    /// Requested lease duration, capped by the role's `max_ttl`
    #[serde(default, with = "humantime_serde::option")]
    pub ttl: Option<Duration>,
}

/// Caller-facing credential fields.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialData {
    /// Raw balena API key
    pub token: String,
    /// Broker-side id of this credential
    pub token_id: String,
    /// Role the credential was issued for
    pub role: String,
    /// Name the key is registered under upstream
    pub key_name: String,
    /// Upstream key description
    pub key_desc: String,
    /// Effective lease duration in seconds
    pub ttl: u64,
}

impl fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialData")
            .field("token", &"<redacted>")
            .field("token_id", &self.token_id)
            .field("role", &self.role)
            .field("key_name", &self.key_name)
            .field("key_desc", &self.key_desc)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// An issued credential with its lease
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Credential fields returned to the caller
    pub data: CredentialData,
    /// Lease for the scheduler
    pub secret: Secret,
}

/// Effective TTL before system defaults: a nonzero override beats the role
/// TTL, and the result is capped (never rejected) at a nonzero `max_ttl`.
#[must_use]
pub fn resolve_ttl(role_ttl: Duration, role_max_ttl: Duration, requested: Option<Duration>) -> Duration {
    let ttl = requested.filter(|t| !t.is_zero()).unwrap_or(role_ttl);
    if !role_max_ttl.is_zero() && ttl > role_max_ttl {
        role_max_ttl
    } else {
        ttl
    }
}

impl Broker {
    /// Issue a fresh balena API key for `role_name`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the role does not exist
    /// - [`Error::Config`] if no URL or master credential resolves
    /// - [`Error::Upstream`] if key creation fails (no retry)
    pub async fn issue(&self, role_name: &str, request: IssueRequest) -> Result<Credential> {
        let role_name = normalize_role_name(role_name)?;
        let role = self
            .roles
            .get(&role_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("role '{role_name}' not found")))?;

        let max_ttl = if role.max_ttl.is_zero() {
            self.settings.max_ttl
        } else {
            role.max_ttl
        };
        let mut ttl = resolve_ttl(role.ttl, role.max_ttl, request.ttl);
        if ttl.is_zero() {
            ttl = self.settings.default_ttl;
        }
        if !max_ttl.is_zero() && ttl > max_ttl {
            ttl = max_ttl;
        }

        let client = self
            .clients
            .get_client(&self.config, ClientBinding::for_role(&role))
            .await?;

        let token_id = Uuid::new_v4().to_string();
        let key_name = request
            .name
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| token_id.clone());
        let key_desc = request
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_KEY_DESCRIPTION.to_string());

        let expiry_date = ttl
            .checked_add(self.settings.expiry_margin)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| Error::Validation(format!("ttl {}s is out of range", ttl.as_secs())))?;

        let token = client
            .create_api_key(&NewApiKey {
                name: key_name.clone(),
                description: key_desc.clone(),
                expiry_date,
            })
            .await?;

        info!(role = %role_name, token_id = %token_id, key_name = %key_name, ttl_secs = ttl.as_secs(), "Issued balena API key");
        audit::emit(&AuditEvent::issued(
            &role_name,
            &token_id,
            &key_name,
            ttl.as_secs(),
            max_ttl.as_secs(),
        ));

        let mut internal_data = Map::new();
        internal_data.insert("token_id".to_string(), Value::from(token_id.as_str()));
        internal_data.insert("key_name".to_string(), Value::from(key_name.as_str()));
        internal_data.insert("key_desc".to_string(), Value::from(key_desc.as_str()));
        internal_data.insert("role".to_string(), Value::from(role_name.as_str()));
        internal_data.insert("ttl".to_string(), Value::from(ttl.as_secs()));
        internal_data.insert("max_ttl".to_string(), Value::from(max_ttl.as_secs()));
        internal_data.insert("url".to_string(), Value::from(client.base_url().as_str()));
        internal_data.insert(
            "role_credential".to_string(),
            Value::from(role.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())),
        );

        Ok(Credential {
            data: CredentialData {
                token,
                token_id,
                role: role_name,
                key_name,
                key_desc,
                ttl: ttl.as_secs(),
            },
            secret: Secret {
                secret_type: SECRET_TYPE.to_string(),
                ttl,
                max_ttl,
                renewable: true,
                internal_data,
            },
        })
    }
}

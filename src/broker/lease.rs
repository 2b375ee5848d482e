//! Lease lifecycle: the `Secret` handed to the lease scheduler and the
//! revoke/renew callbacks it drives.
//!
//! A lease carries everything needed to act on it later in
//! `internal_data`. Renew never consults the role. Revoke targets the
//! recorded endpoint and only needs the role when the role's own credential
//! minted the key; if that role is gone the revoke fails rather than
//! skipping the upstream delete.
//!
//! | Field | Type | Used by |
//! |-------|------|---------|
//! | `token_id` | string | audit only |
//! | `key_name` | string | revoke (upstream lookup by name) |
//! | `key_desc` | string | informational |
//! | `role` | string | revoke (role-scoped credential lookup) |
//! | `url` | string | revoke (endpoint the key was minted on) |
//! | `role_credential` | bool | revoke (whether the role's own credential minted the key) |
//! | `ttl` | integer seconds | renew |
//! | `max_ttl` | integer seconds | renew |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::Broker;
use super::audit::{self, AuditEvent};
use super::cache::ClientBinding;
use super::roles::normalize_role_name;
use crate::config::{RevokeFailurePolicy, duration_secs};
use crate::{Error, Result};

/// Secret type tag of every lease this broker issues
pub const SECRET_TYPE: &str = "balena_token";

/// A lease-bearing secret, as tracked by the external lease scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    /// Always [`SECRET_TYPE`]
    pub secret_type: String,
    /// Active lease duration
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Upper bound on the lease duration
    #[serde(with = "duration_secs")]
    pub max_ttl: Duration,
    /// Whether the scheduler may call renew
    #[serde(default)]
    pub renewable: bool,
    /// Private data snapshotted at issuance
    #[serde(default)]
    pub internal_data: Map<String, Value>,
}

/// The fixed set of lease callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseOperation {
    /// Invalidate the credential upstream and forget the lease
    Revoke,
    /// Extend the lease window; no upstream call
    Renew,
}

/// Result of a lease callback
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    /// The lease is finished
    Revoked,
    /// The lease continues with this window
    Renewed(Secret),
}

impl Broker {
    /// Dispatch a lease callback to its handler.
    pub async fn handle_lease(&self, op: LeaseOperation, secret: &Secret) -> Result<LeaseOutcome> {
        if secret.secret_type != SECRET_TYPE {
            return Err(Error::MalformedLease(format!(
                "unknown secret type '{}'",
                secret.secret_type
            )));
        }
        match op {
            LeaseOperation::Revoke => {
                self.revoke(secret).await?;
                Ok(LeaseOutcome::Revoked)
            }
            LeaseOperation::Renew => self.renew(secret).map(LeaseOutcome::Renewed),
        }
    }

    /// Delete the lease's key upstream.
    ///
    /// A key that no longer exists upstream counts as revoked. A failing
    /// delete call is handled per [`RevokeFailurePolicy`].
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the key was minted with a role credential and
    /// that role (or its credential) has since been removed.
    pub async fn revoke(&self, secret: &Secret) -> Result<()> {
        let data = &secret.internal_data;
        let key_name = require_str(data, "key_name")?;
        let token_id = optional_str(data, "token_id");

        let role = match optional_str(data, "role") {
            Some(name) => {
                let name = normalize_role_name(name)
                    .map_err(|_| Error::MalformedLease(format!("invalid role '{name}'")))?;
                self.roles.get(&name).await?
            }
            None => None,
        };

        // Leases record where and with which credential their key was minted.
        // Older leases without that record follow the role as stored now.
        let credential = match optional_bool(data, "role_credential")? {
            Some(true) => {
                let key = role
                    .as_ref()
                    .and_then(|r| r.api_key.as_deref())
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "key '{key_name}' was issued with a role credential that no longer exists"
                        ))
                    })?;
                Some(key)
            }
            Some(false) => None,
            None => role.as_ref().and_then(|r| r.api_key.as_deref()),
        };
        let binding = ClientBinding {
            url: optional_str(data, "url").or_else(|| role.as_ref().map(|r| r.url.as_str())),
            credential,
        };
        let client = self.clients.get_client(&self.config, binding).await?;

        let Some(key) = client.find_api_key(key_name).await? else {
            debug!(key_name = %key_name, "No upstream key to revoke");
            audit::emit(&AuditEvent::revoke_skipped(key_name, token_id));
            return Ok(());
        };

        match client.delete_api_key(key.id).await {
            Ok(()) => {
                audit::emit(&AuditEvent::revoked(key_name, token_id));
                Ok(())
            }
            Err(e) => {
                audit::emit(&AuditEvent::revoke_failed(key_name, token_id, e.to_string()));
                match self.settings.revoke_failure {
                    RevokeFailurePolicy::Ignore => {
                        warn!(key_name = %key_name, error = %e, "Upstream delete failed, lease dropped anyway");
                        Ok(())
                    }
                    RevokeFailurePolicy::Propagate => Err(e),
                }
            }
        }
    }

    /// Recompute the lease window from the snapshotted `ttl`/`max_ttl`.
    pub fn renew(&self, secret: &Secret) -> Result<Secret> {
        let data = &secret.internal_data;
        let ttl = require_secs(data, "ttl")?;
        let max_ttl = require_secs(data, "max_ttl")?;

        let mut renewed = secret.clone();
        if ttl != 0 {
            renewed.ttl = Duration::from_secs(ttl);
        }
        if max_ttl != 0 {
            renewed.max_ttl = Duration::from_secs(max_ttl);
        }

        audit::emit(&AuditEvent::renewed(
            optional_str(data, "token_id"),
            renewed.ttl.as_secs(),
            renewed.max_ttl.as_secs(),
        ));
        Ok(renewed)
    }
}

fn require_str<'a>(data: &'a Map<String, Value>, field: &str) -> Result<&'a str> {
    match data.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(Error::MalformedLease(format!("'{field}' is not a string"))),
        None => Err(Error::MalformedLease(format!("'{field}' is missing"))),
    }
}

fn optional_str<'a>(data: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    data.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn optional_bool(data: &Map<String, Value>, field: &str) -> Result<Option<bool>> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::MalformedLease(format!("'{field}' is not a boolean"))),
    }
}

fn require_secs(data: &Map<String, Value>, field: &str) -> Result<u64> {
    match data.get(field) {
        Some(value) => value.as_u64().ok_or_else(|| {
            Error::MalformedLease(format!("'{field}' is not a non-negative integer"))
        }),
        None => Err(Error::MalformedLease(format!("'{field}' is missing"))),
    }
}

//! Audit logging for credential lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with a JSON `audit` field, so
//! the trail is queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `config.written` | Backend configuration created or updated |
//! | `config.deleted` | Backend configuration removed |
//! | `role.written` | Role created or updated |
//! | `role.deleted` | Role removed |
//! | `credential.issued` | A balena API key was minted for a role |
//! | `credential.renewed` | A lease window was extended |
//! | `credential.revoked` | The upstream key was deleted |
//! | `credential.revoke_skipped` | No upstream key matched (already gone) |
//! | `credential.revoke_failed` | The upstream delete call failed |
//!
//! Raw key values and master credentials never appear in events.

use serde::Serialize;

/// Structured audit event emitted for every lifecycle transition.
#[derive(Debug, Default, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"credential.issued"`).
    pub event: &'static str,
    /// Role the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Broker-side id of the affected credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Name the key is registered under upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    /// Upstream base URL (config events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Lease TTL in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Lease max TTL in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<u64>,
    /// Human-readable reason for skip or failure events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Construct a `config.written` event.
    #[must_use]
    pub fn config_written(url: &str) -> Self {
        Self {
            event: "config.written",
            url: Some(url.to_string()),
            ..Self::default()
        }
    }

    /// Construct a `config.deleted` event.
    #[must_use]
    pub fn config_deleted() -> Self {
        Self {
            event: "config.deleted",
            ..Self::default()
        }
    }

    /// Construct a `role.written` event.
    #[must_use]
    pub fn role_written(role: &str, ttl: u64, max_ttl: u64) -> Self {
        Self {
            event: "role.written",
            role: Some(role.to_string()),
            ttl: Some(ttl),
            max_ttl: Some(max_ttl),
            ..Self::default()
        }
    }

    /// Construct a `role.deleted` event.
    #[must_use]
    pub fn role_deleted(role: &str) -> Self {
        Self {
            event: "role.deleted",
            role: Some(role.to_string()),
            ..Self::default()
        }
    }

    /// Construct a `credential.issued` event.
    #[must_use]
    pub fn issued(role: &str, token_id: &str, key_name: &str, ttl: u64, max_ttl: u64) -> Self {
        Self {
            event: "credential.issued",
            role: Some(role.to_string()),
            token_id: Some(token_id.to_string()),
            key_name: Some(key_name.to_string()),
            ttl: Some(ttl),
            max_ttl: Some(max_ttl),
            ..Self::default()
        }
    }

    /// Construct a `credential.renewed` event.
    #[must_use]
    pub fn renewed(token_id: Option<&str>, ttl: u64, max_ttl: u64) -> Self {
        Self {
            event: "credential.renewed",
            token_id: token_id.map(str::to_string),
            ttl: Some(ttl),
            max_ttl: Some(max_ttl),
            ..Self::default()
        }
    }

    /// Construct a `credential.revoked` event.
    #[must_use]
    pub fn revoked(key_name: &str, token_id: Option<&str>) -> Self {
        Self {
            event: "credential.revoked",
            token_id: token_id.map(str::to_string),
            key_name: Some(key_name.to_string()),
            ..Self::default()
        }
    }

    /// Construct a `credential.revoke_skipped` event.
    #[must_use]
    pub fn revoke_skipped(key_name: &str, token_id: Option<&str>) -> Self {
        Self {
            event: "credential.revoke_skipped",
            token_id: token_id.map(str::to_string),
            key_name: Some(key_name.to_string()),
            reason: Some("no upstream key with this name".to_string()),
            ..Self::default()
        }
    }

    /// Construct a `credential.revoke_failed` event.
    #[must_use]
    pub fn revoke_failed(key_name: &str, token_id: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            event: "credential.revoke_failed",
            token_id: token_id.map(str::to_string),
            key_name: Some(key_name.to_string()),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO balena_broker::broker::audit audit={"event":"credential.issued","role":"deployer",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "broker audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

//! Role records and their store (`role/<name>`).

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{duration_secs, humantime_serde};
use crate::storage::{self, Storage};
use crate::{Error, Result};

/// Storage prefix of role records
pub const ROLE_PREFIX: &str = "role/";

static ROLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w(([\w.-]+)?\w)?$").expect("static regex"));

/// Validate a role name and return its canonical (lowercase) form.
pub fn normalize_role_name(name: &str) -> Result<String> {
    if !ROLE_NAME.is_match(name) {
        return Err(Error::Validation(format!("invalid role name '{name}'")));
    }
    Ok(name.to_lowercase())
}

/// A named issuance policy.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name (lowercase, immutable)
    pub name: String,
    /// Per-role balena API URL; blank means the configuration's URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Default lease duration; zero means the system default
    #[serde(default, with = "duration_secs")]
    pub ttl: Duration,
    /// Upper bound on lease duration; zero means the system maximum
    #[serde(default, with = "duration_secs")]
    pub max_ttl: Duration,
    /// Role-scoped master credential; `None` means the configuration's token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Role")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("ttl", &self.ttl)
            .field("max_ttl", &self.max_ttl)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Role {
    /// Apply a partial update on top of `existing`, or on a zeroed role named `name`.
    #[must_use]
    pub fn merged(name: &str, existing: Option<Self>, update: RoleUpdate) -> Self {
        let mut role = existing.unwrap_or_else(|| Self {
            name: name.to_string(),
            ..Self::default()
        });
        if let Some(url) = update.url {
            role.url = url.trim().to_string();
        }
        if let Some(ttl) = update.ttl {
            role.ttl = ttl;
        }
        if let Some(max_ttl) = update.max_ttl {
            role.max_ttl = max_ttl;
        }
        if let Some(api_key) = update.api_key {
            role.api_key = (!api_key.is_empty()).then_some(api_key);
        }
        role
    }

    /// Check field invariants.
    pub fn validate(&self) -> Result<()> {
        if !self.max_ttl.is_zero() && self.ttl > self.max_ttl {
            return Err(Error::Validation(
                "ttl cannot be greater than max_ttl".to_string(),
            ));
        }
        if !self.url.is_empty() {
            Url::parse(&self.url)
                .map_err(|e| Error::Validation(format!("invalid url '{}': {e}", self.url)))?;
        }
        Ok(())
    }

    /// Public view: never includes the credential
    #[must_use]
    pub fn view(&self) -> RoleView {
        RoleView {
            name: self.name.clone(),
            url: (!self.url.is_empty()).then(|| self.url.clone()),
            ttl: self.ttl.as_secs(),
            max_ttl: self.max_ttl.as_secs(),
        }
    }
}

/// Body of a role write. Omitted fields keep their stored value.
#[derive(Default, Deserialize)]
pub struct RoleUpdate {
    /// Per-role balena API URL
    #[serde(default)]
    pub url: Option<String>,
    /// Default lease duration
    #[serde(default, with = "humantime_serde::option")]
    pub ttl: Option<Duration>,
    /// Maximum lease duration
    #[serde(default, with = "humantime_serde::option")]
    pub max_ttl: Option<Duration>,
    /// Role-scoped master credential (an empty string clears it)
    #[serde(default, alias = "balenaApiKey")]
    pub api_key: Option<String>,
}

impl fmt::Debug for RoleUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleUpdate")
            .field("url", &self.url)
            .field("ttl", &self.ttl)
            .field("max_ttl", &self.max_ttl)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Role as returned by reads, durations in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleView {
    /// Role name
    pub name: String,
    /// Per-role URL override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Default lease duration (seconds)
    pub ttl: u64,
    /// Maximum lease duration (seconds)
    pub max_ttl: u64,
}

/// Persists role records.
#[derive(Clone)]
pub struct RoleStore {
    storage: Arc<dyn Storage>,
}

impl RoleStore {
    /// Create a store over `storage`
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn key(name: &str) -> String {
        format!("{ROLE_PREFIX}{name}")
    }

    /// Read a role. `None` when no role has this name.
    pub async fn get(&self, name: &str) -> Result<Option<Role>> {
        storage::get_json(self.storage.as_ref(), &Self::key(name)).await
    }

    /// Write a role. Rejected without writing if it fails [`Role::validate`].
    pub async fn put(&self, role: &Role) -> Result<()> {
        role.validate()?;
        storage::put_json(self.storage.as_ref(), &Self::key(&role.name), role).await
    }

    /// Remove a role. Removing an absent role is not an error.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.storage.delete(&Self::key(name)).await
    }

    /// Role names in storage enumeration order
    pub async fn list(&self) -> Result<Vec<String>> {
        self.storage.list(ROLE_PREFIX).await
    }
}

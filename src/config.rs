//! Process configuration
//!
//! Settings for the broker process itself (listener, storage engine, upstream
//! HTTP behaviour, lease defaults). The balena backend configuration written
//! through `/v1/config` is a different thing: it lives in storage and is
//! managed by [`crate::broker::ConfigStore`].

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default system lease duration (32 days), used when a role's TTL is zero
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(768 * 3600);

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP facade configuration
    pub server: ServerConfig,
    /// Storage engine configuration
    pub storage: StorageConfig,
    /// Upstream (balena API) client configuration
    pub upstream: UpstreamConfig,
    /// Lease policy configuration
    pub lease: LeaseConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or holds inconsistent values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (BALENA_BROKER_ prefix, `__` for nesting)
        figment = figment.merge(Env::prefixed("BALENA_BROKER_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be non-zero".to_string()));
        }
        if !self.lease.max_ttl.is_zero() && self.lease.default_ttl > self.lease.max_ttl {
            return Err(Error::Config(
                "lease.default_ttl cannot be greater than lease.max_ttl".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Bearer token the lease scheduler must present on `/v1/lease/*`.
    /// Supports a literal value or `env:VAR_NAME`. Unset leaves the
    /// callbacks open (access control is then the host's job).
    #[serde(default, skip_serializing)]
    pub scheduler_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8200,
            request_timeout: Duration::from_secs(30),
            scheduler_token: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the scheduler token (expand `env:` references)
    #[must_use]
    pub fn resolve_scheduler_token(&self) -> Option<String> {
        self.scheduler_token.as_ref().map(|token| {
            if let Some(var_name) = token.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| token.clone())
            } else {
                token.clone()
            }
        })
    }
}

/// Which storage engine backs config and role records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on restart
    Memory,
    /// One JSON file per key
    #[default]
    File,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage engine
    pub backend: StorageBackend,
    /// Base directory for the file engine (default `~/.balena-broker/data`)
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the file engine's base directory
    pub fn resolve_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(".balena-broker").join("data"))
    }
}

/// Upstream client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Per-request timeout against the balena API
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Added to `now + ttl` when computing the upstream key expiry, so the
    /// balena side never expires a key before its local lease does
    #[serde(with = "humantime_serde")]
    pub expiry_margin: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            expiry_margin: Duration::from_secs(2 * 3600),
        }
    }
}

/// What revoke does when the upstream delete call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RevokeFailurePolicy {
    /// Log and audit the failure, report the revoke as successful
    #[default]
    Ignore,
    /// Return the failure so the lease scheduler retries
    Propagate,
}

/// Lease policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// System default TTL, used when a role's `ttl` is zero
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// System maximum TTL, used when a role's `max_ttl` is zero
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
    /// Upstream delete failure handling during revoke
    pub revoke_failure: RevokeFailurePolicy,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_LEASE_TTL,
            max_ttl: DEFAULT_LEASE_TTL,
            revoke_failure: RevokeFailurePolicy::Ignore,
        }
    }
}

/// Parse a human-readable duration: `"90"`, `"30s"`, `"5m"`, `"1h"`, `"2d"`, `"100ms"`.
///
/// A bare number is seconds.
pub fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let s = value.trim();
    let (digits, unit): (&str, u64) = if let Some(ms) = s.strip_suffix("ms") {
        return ms
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| format!("invalid duration '{value}': {e}"));
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(days) = s.strip_suffix('d') {
        (days, 86_400)
    } else {
        (s, 1)
    };

    let n = digits
        .parse::<u64>()
        .map_err(|e| format!("invalid duration '{value}': {e}"))?;
    n.checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{value}' overflows"))
}

/// Serde adapter for [`Duration`] fields: integer seconds or a human-readable string
pub mod humantime_serde {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize integer seconds or a duration string (e.g., "30s", "5m", "768h")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative number of seconds or a duration string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("duration cannot be negative: {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }

    /// Same as the parent module, for `Option<Duration>` fields
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] Duration);

        /// Serialize `Some` as a duration string and `None` as null
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize null or a duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the value is not a valid duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(d)| d))
        }
    }
}

/// Serde adapter writing [`Duration`] as integer seconds; reads anything
/// [`humantime_serde`] accepts
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserializer, Serializer};

    /// Serialize as whole seconds
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize integer seconds or a duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        super::humantime_serde::deserialize(deserializer)
    }
}

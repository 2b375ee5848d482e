//! balena broker library
//!
//! Dynamic credential broker for the balena cloud API: callers name a
//! **role**, the broker mints a fresh, expiring balena API key with the
//! master credential it holds, and hands back the key together with a lease
//! that an external scheduler later renews or revokes.
//!
//! # Features
//!
//! - **Roles**: per-role URL, TTL/max TTL and optional role-scoped credential
//! - **Issuance**: one upstream key per request, TTL capped at the role's max TTL
//! - **Leases**: revoke deletes the key upstream (idempotent), renew is local
//! - **Client cache**: one authenticated client, rebuilt on every configuration change
//! - **Storage**: in-memory or one-JSON-file-per-key, `0600` on unix
//! - **Audit**: every lifecycle transition as a structured `tracing` event

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod storage;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
        Some("text") | None => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
        Some(other) => {
            return Err(Error::Config(format!(
                "Unknown log format '{other}' (expected text or json)"
            )));
        }
    }

    Ok(())
}

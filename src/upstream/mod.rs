//! Upstream API client for the balena identity API.
//!
//! Three calls make up the whole upstream contract:
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `POST` | `api-key/user/full` | create a named, described, expiring key |
//! | `GET` | `v6/api_key?$select=..&$filter=(name eq '<name>')` | find a key's numeric id |
//! | `DELETE` | `v6/api_key(<id>)` | revoke a key |
//!
//! The query shapes are the balena `OData` dialect and are matched verbatim.

mod client;
mod types;

pub use client::BalenaClient;
pub use types::{ApiKey, NewApiKey, ODataList};

/// Default public balena API endpoint
pub const DEFAULT_API_URL: &str = "https://api.balena-cloud.com/";

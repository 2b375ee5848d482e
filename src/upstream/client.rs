//! Typed HTTP client for the balena API.
//!
//! A [`BalenaClient`] is bound to one base URL and one bearer credential.
//! It never retries: retry policy belongs to the caller (or the lease
//! scheduler), and a dropped future cancels the in-flight request.
//!
//! # Security
//!
//! - The bearer credential is NEVER logged or included in error messages
//! - Issued key values are NEVER logged

use std::fmt;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;

use super::types::{ApiKey, NewApiKey, ODataList};
use crate::{Error, Result};

/// Path of the "create full user API key" endpoint
const CREATE_KEY_PATH: &str = "api-key/user/full";

/// Columns selected when looking a key up by name
const KEY_SELECT: &str = "id,created_at,name,description,expiry_date";

/// Error bodies are truncated to this many bytes in messages
const MAX_ERROR_BODY: usize = 256;

/// Authenticated balena API client
pub struct BalenaClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for BalenaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BalenaClient")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl BalenaClient {
    /// Build a client for `base_url`, authenticating with `token`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the URL is blank or unparsable, or the token is empty.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim();
        if base_url.is_empty() {
            return Err(Error::Config("client URL was not defined".to_string()));
        }
        if token.is_empty() {
            return Err(Error::Config(
                "client master credential was not defined".to_string(),
            ));
        }

        // A base without a trailing slash would lose its last segment on join
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| Error::Config(format!("invalid client URL '{normalized}': {e}")))?;

        let http = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
        })
    }

    /// Base URL every request path is resolved against
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build an authenticated request for `path` (relative, may carry a query string).
    pub fn new_request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::Config(format!("invalid request path '{path}': {e}")))?;

        let mut request = self.http.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request)
    }

    /// Send a request and return the raw success body.
    pub async fn execute_raw(&self, request: RequestBuilder) -> Result<String> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("request failed: {e}")))?;

        let status = response.status();
        let url = response.url().path().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Upstream(format!("failed to read response from {url}: {e}")))?;

        if !status.is_success() {
            let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(Error::Upstream(format!("{url} returned {status}: {snippet}")));
        }

        debug!(path = %url, status = %status, "balena API call succeeded");
        Ok(body)
    }

    /// Send a request and decode a JSON success body.
    pub async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let body = self.execute_raw(request).await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::Upstream(format!("failed to decode response: {e}")))
    }

    /// Create a named, described, time-bounded API key and return its raw value.
    pub async fn create_api_key(&self, key: &NewApiKey) -> Result<String> {
        let request = self.new_request(Method::POST, CREATE_KEY_PATH, Some(key))?;
        let body = self.execute_raw(request).await?;

        // The key comes back as a JSON string; tolerate a bare text body too
        let value = serde_json::from_str::<String>(&body)
            .unwrap_or_else(|_| body.trim().to_string());
        if value.is_empty() {
            return Err(Error::Upstream("balena returned an empty API key".to_string()));
        }
        Ok(value)
    }

    /// Look a key up by exact name. `None` when no key has that name.
    pub async fn find_api_key(&self, name: &str) -> Result<Option<ApiKey>> {
        let path = format!(
            "v6/api_key?$select={KEY_SELECT}&$filter=(name%20eq%20%27{}%27)",
            odata_string(name)
        );
        let request = self.new_request::<()>(Method::GET, &path, None)?;
        let list: ODataList<ApiKey> = self.execute(request).await?;
        Ok(list.d.into_iter().next())
    }

    /// Delete a key by numeric id.
    pub async fn delete_api_key(&self, id: u64) -> Result<()> {
        let request = self.new_request::<()>(Method::DELETE, &format!("v6/api_key({id})"), None)?;
        self.execute_raw(request).await?;
        Ok(())
    }
}

/// Escape and percent-encode a value for use inside an `OData` string literal.
fn odata_string(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    url::form_urlencoded::byte_serialize(escaped.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

//! Wire types of the balena API key endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST api-key/user/full`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApiKey {
    /// Name the key is registered under (used later to find it for revocation)
    pub name: String,
    /// Free-text description shown in the balena dashboard
    pub description: String,
    /// Absolute expiry, RFC 3339 UTC
    pub expiry_date: DateTime<Utc>,
}

/// One row of `GET v6/api_key`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKey {
    /// Numeric id, the only handle `DELETE v6/api_key(<id>)` accepts
    pub id: u64,
    /// Creation time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Registered name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Upstream expiry, if any
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
}

/// `OData` collection envelope (`{"d": [...]}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ODataList<T> {
    /// Result rows
    pub d: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_api_key_uses_camel_case_expiry() {
        let body = NewApiKey {
            name: "deployer-key".to_string(),
            description: "ci".to_string(),
            expiry_date: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["name"], "deployer-key");
        assert_eq!(json["expiryDate"], "2026-01-02T03:04:05Z");
        assert!(json.get("expiry_date").is_none());
    }

    #[test]
    fn api_key_list_decodes_balena_rows() {
        let raw = r#"{"d":[{"id":4711,"created_at":"2023-09-19T12:00:00.000Z","name":"k","description":null,"expiry_date":null}]}"#;
        let list: ODataList<ApiKey> = serde_json::from_str(raw).unwrap();
        assert_eq!(list.d.len(), 1);
        assert_eq!(list.d[0].id, 4711);
        assert_eq!(list.d[0].name, "k");
        assert!(list.d[0].expiry_date.is_none());
    }
}

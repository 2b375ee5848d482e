//! HTTP facade tests
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot`:
//! - Status mapping for validation, not found and configuration errors
//! - Write-only credentials never echoed back
//! - Scheduler token guard on lease callbacks

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use balena_broker::broker::{Broker, BrokerSettings, handler::broker_routes};
use balena_broker::storage::MemoryStorage;

fn app(scheduler_token: Option<&str>) -> Router {
    let broker = Arc::new(Broker::new(
        Arc::new(MemoryStorage::new()),
        BrokerSettings::default(),
    ));
    broker_routes(broker, scheduler_token.map(str::to_string))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    call_with_auth(app, method, uri, body, None).await
}

async fn call_with_auth(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let app = app(None);
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_config_read_never_returns_token() {
    // GIVEN: a configuration written with a master token
    let app = app(None);
    let (status, written) = call(
        &app,
        "POST",
        "/v1/config",
        Some(json!({"url": "https://api.example.com/", "token": "master-secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(written, json!({"url": "https://api.example.com/"}));

    // WHEN: read back
    let (status, body) = call(&app, "GET", "/v1/config", None).await;

    // THEN: only the url is present
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"url": "https://api.example.com/"}));
}

#[tokio::test]
async fn test_config_delete_then_read_is_not_found() {
    let app = app(None);
    call(&app, "PUT", "/v1/config", Some(json!({"url": "https://api.example.com/"}))).await;

    let (status, _) = call(&app, "DELETE", "/v1/config", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app, "GET", "/v1/config", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_role_ttl_above_max_is_bad_request_and_not_stored() {
    // GIVEN/WHEN: a role written with ttl=600 > max_ttl=300
    let app = app(None);
    let (status, body) = call(
        &app,
        "POST",
        "/v1/role/deployer",
        Some(json!({"ttl": 600, "max_ttl": 300})),
    )
    .await;

    // THEN: rejected as a validation error
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    // AND: the role does not exist
    let (status, _) = call(&app, "GET", "/v1/role/deployer", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_role_write_read_list_delete() {
    let app = app(None);
    let (status, body) = call(
        &app,
        "POST",
        "/v1/role/Deployer",
        Some(json!({"ttl": "1m", "max_ttl": "5m", "balenaApiKey": "role-secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"name": "deployer", "ttl": 60, "max_ttl": 300}));

    let (_, listed) = call(&app, "GET", "/v1/role", None).await;
    assert_eq!(listed, json!({"keys": ["deployer"]}));

    let (status, read) = call(&app, "GET", "/v1/role/deployer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!read.to_string().contains("role-secret"));

    let (status, _) = call(&app, "DELETE", "/v1/role/deployer", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "GET", "/v1/role/deployer", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_role_name_is_bad_request() {
    let app = app(None);
    let (status, _) = call(&app, "POST", "/v1/role/-bad-", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_creds_for_missing_role_is_not_found() {
    let app = app(None);
    let (status, body) = call(&app, "GET", "/v1/creds/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_creds_without_credential_is_configuration_error() {
    // GIVEN: a configuration without any master token
    let app = app(None);
    call(&app, "POST", "/v1/config", Some(json!({"url": "https://api.example.com/"}))).await;
    call(&app, "POST", "/v1/role/deployer", Some(json!({"ttl": 60}))).await;

    // WHEN/THEN: issuance fails as a configuration error
    let (status, body) = call(&app, "GET", "/v1/creds/deployer", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "configuration_error");
}

#[tokio::test]
async fn test_creds_query_and_body_issue_keys() {
    // GIVEN: a balena stand-in and a configured role
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api-key/user/full"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("raw-key")))
        .expect(2)
        .mount(&server)
        .await;
    let app = app(None);
    call(
        &app,
        "POST",
        "/v1/config",
        Some(json!({"url": server.uri(), "token": "master"})),
    )
    .await;
    call(&app, "POST", "/v1/role/deployer", Some(json!({"ttl": 60, "max_ttl": 300}))).await;

    // WHEN: issuing via query string and via JSON body
    let (status, by_query) = call(
        &app,
        "GET",
        "/v1/creds/deployer?balenaName=CI&ttl=10m",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, by_body) = call(
        &app,
        "POST",
        "/v1/creds/deployer",
        Some(json!({"balenaDesc": "nightly"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // THEN: both carry the credential fields and a lease
    assert_eq!(by_query["data"]["token"], "raw-key");
    assert_eq!(by_query["data"]["key_name"], "ci");
    assert_eq!(by_query["data"]["ttl"], 300);
    assert_eq!(by_query["secret"]["secret_type"], "balena_token");
    assert_eq!(by_query["secret"]["renewable"], true);
    assert_eq!(by_body["data"]["key_desc"], "nightly");
    assert_eq!(by_body["data"]["ttl"], 60);
    assert_ne!(by_query["data"]["token_id"], by_body["data"]["token_id"]);
}

fn lease() -> Value {
    json!({
        "secret_type": "balena_token",
        "ttl": 10,
        "max_ttl": 20,
        "renewable": true,
        "internal_data": {"key_name": "k", "ttl": 60, "max_ttl": 300}
    })
}

#[tokio::test]
async fn test_lease_callbacks_require_scheduler_token() {
    let app = app(Some("sched-secret"));

    let (status, body) = call(&app, "POST", "/v1/lease/renew", Some(lease())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = call_with_auth(
        &app,
        "POST",
        "/v1/lease/renew",
        Some(lease()),
        Some("wrong"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, renewed) = call_with_auth(
        &app,
        "POST",
        "/v1/lease/renew",
        Some(lease()),
        Some("sched-secret"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renewed["ttl"], 60);
    assert_eq!(renewed["max_ttl"], 300);
}

#[tokio::test]
async fn test_malformed_lease_is_unprocessable() {
    let app = app(None);
    let (status, body) = call(
        &app,
        "POST",
        "/v1/lease/revoke",
        Some(json!({
            "secret_type": "balena_token",
            "ttl": 10,
            "max_ttl": 20,
            "internal_data": {"key_name": 42}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "malformed_lease");
}

#[tokio::test]
async fn test_creds_post_without_body_uses_role_defaults() {
    // GIVEN: a configured role
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api-key/user/full"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("raw-key")))
        .expect(1)
        .mount(&server)
        .await;
    let app = app(None);
    call(
        &app,
        "POST",
        "/v1/config",
        Some(json!({"url": server.uri(), "token": "master"})),
    )
    .await;
    call(&app, "POST", "/v1/role/deployer", Some(json!({"ttl": 60, "max_ttl": 300}))).await;

    // WHEN: creds are requested with an empty POST
    let (status, body) = call(&app, "POST", "/v1/creds/deployer", None).await;

    // THEN: a credential is issued with the role's ttl
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["token"], "raw-key");
    assert_eq!(body["data"]["ttl"], 60);
}

#[tokio::test]
async fn test_creds_post_with_invalid_body_is_bad_request() {
    let app = app(None);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/creds/deployer")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_lease_auth_checked_before_body() {
    // GIVEN: a scheduler token and a body that is not JSON
    let app = app(Some("sched-secret"));
    let request = |bearer: Option<&str>| {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/lease/revoke")
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from("{not json")).unwrap()
    };

    // WHEN/THEN: without the token the caller only learns it is unauthorized
    let response = app.clone().oneshot(request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // AND: with the token the body is reported as a malformed lease
    let response = app.clone().oneshot(request(Some("sched-secret"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "malformed_lease");
}

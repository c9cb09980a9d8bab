//! Query and geo proxy tests

mod support;

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use tokio::sync::Mutex;
use tower::ServiceExt;

use ngsi_core::{AuthHeaderProvider, BrokerConfig, IdmConfig, NgsiResult};
use ngsi_proxy::{Flavor, QueryProxy, QueryProxyConfig, QueryProxyState};

use support::{body_json, body_string, form_post, get, RecordingTransport};

fn proxy(flavor: Flavor, transport: Arc<RecordingTransport>) -> QueryProxy {
    let broker = BrokerConfig::builder("http://orion:1026").build().unwrap();
    QueryProxy::new(QueryProxyConfig::new(flavor, broker), transport)
}

struct StaticToken;

#[async_trait]
impl AuthHeaderProvider for StaticToken {
    async fn auth_header(&mut self) -> NgsiResult<(String, String)> {
        Ok(("Authorization".to_string(), "Bearer abc123".to_string()))
    }
}

#[tokio::test]
async fn test_form_becomes_query_string() {
    let transport = RecordingTransport::ok("[]");
    let app = proxy(Flavor::Query, transport.clone()).router();

    let response = app.oneshot(form_post("/v2/ex/entities", "a=1&b=2")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "[]");

    let upstream = transport.last();
    assert_eq!(upstream.method, Method::GET);
    assert_eq!(upstream.url.as_str(), "http://orion:1026/v2/entities?a=1&b=2");
    assert!(upstream.body.is_none());
}

#[tokio::test]
async fn test_geo_scenario_forwards_tenant_headers() {
    let transport = RecordingTransport::ok("{}");
    let proxy = proxy(Flavor::Geo, transport.clone());
    let app = proxy.router();

    let request = Request::builder()
        .method("POST")
        .uri("/v2/ex/entities")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("FIWARE-Service", "fiware")
        .header("FIWARE-ServicePath", "/iot")
        .header("User-Agent", "curl/7.68.0")
        .body(Body::from("options=keyValues&type=Device"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "{}");

    let upstream = transport.last();
    assert_eq!(
        upstream.url.as_str(),
        "http://orion:1026/v2/entities?options=keyValues&type=Device"
    );
    assert_eq!(upstream.headers["fiware-service"], "fiware");
    assert_eq!(upstream.headers["fiware-servicepath"], "/iot");
    assert!(upstream.headers.get("user-agent").is_none());
    assert!(upstream.headers.get("content-type").is_none());

    let snapshot = proxy.state().stats().snapshot();
    assert_eq!((snapshot.time_sent, snapshot.success, snapshot.failure), (1, 1, 0));
}

#[tokio::test]
async fn test_upstream_status_and_headers_are_relayed() {
    let mut headers = HeaderMap::new();
    headers.insert("fiware-total-count", HeaderValue::from_static("0"));
    headers.insert("content-length", HeaderValue::from_static("2"));
    let transport = RecordingTransport::with_headers(StatusCode::NOT_FOUND, headers, "[]");
    let app = proxy(Flavor::Query, transport).router();

    let response = app.oneshot(form_post("/v2/ex/entities", "type=Nothing")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["fiware-total-count"], "0");
}

#[tokio::test]
async fn test_custom_action_path() {
    let transport = RecordingTransport::ok("[]");
    let broker = BrokerConfig::builder("http://orion:1026").build().unwrap();
    let config = QueryProxyConfig::new(Flavor::Geo, broker).action_path("v2/geo");
    let app = QueryProxy::new(config, transport.clone()).router();

    let response = app.clone().oneshot(form_post("/v2/geo", "georel=near")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(form_post("/v2/ex/entities", "georel=near")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn test_only_post_is_accepted() {
    let transport = RecordingTransport::ok("[]");
    let proxy = proxy(Flavor::Query, transport.clone());

    let response = proxy.router().oneshot(get("/v2/ex/entities")).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body_string(response).await, "");
    assert!(transport.requests().is_empty());
    assert_eq!(proxy.state().stats().snapshot().time_sent, 0);
}

#[tokio::test]
async fn test_root_is_not_found_for_any_method() {
    let app = proxy(Flavor::Geo, RecordingTransport::ok("[]")).router();

    for method in ["GET", "POST", "DELETE"] {
        let request = Request::builder().method(method).uri("/").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(body_string(response).await, r#"{"error": "/ not found"}"#);
    }
}

#[tokio::test]
async fn test_content_type_errors() {
    let transport = RecordingTransport::ok("[]");
    let proxy = proxy(Flavor::Query, transport.clone());
    let app = proxy.router();

    let missing = Request::builder()
        .method("POST")
        .uri("/v2/ex/entities")
        .body(Body::from("a=1"))
        .unwrap();
    let response = app.clone().oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"error": "tokeProxyRequestToken001 missing Content-Type"})
    );

    let response = app
        .oneshot(support::json_post("/v2/ex/entities", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"error": "tokeProxyRequestToken003 Content-Type error"})
    );

    assert!(transport.requests().is_empty());
    let snapshot = proxy.state().stats().snapshot();
    assert_eq!((snapshot.time_sent, snapshot.failure), (2, 2));
}

#[tokio::test]
async fn test_upstream_failure() {
    let proxy = proxy(Flavor::Query, RecordingTransport::unreachable());

    let response = proxy
        .router()
        .oneshot(form_post("/v2/ex/entities", "type=Room"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_string(response).await,
        r#"{"error":"queryProxyHandler006 connection refused"}"#
    );
    assert_eq!(proxy.state().stats().snapshot().failure, 1);
}

#[tokio::test]
async fn test_unknown_idm_type() {
    let transport = RecordingTransport::ok("[]");
    let broker = BrokerConfig::builder("http://orion:1026")
        .idm(IdmConfig::new("unknown"))
        .build()
        .unwrap();
    let app = QueryProxy::new(QueryProxyConfig::new(Flavor::Query, broker), transport.clone()).router();

    let response = app.oneshot(form_post("/v2/ex/entities", "type=Room")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"error": "queryProxyHandler004 unknown idm type: unknown"})
    );
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_auth_header_is_attached() {
    let transport = RecordingTransport::ok("[]");
    let broker = BrokerConfig::builder("http://orion:1026").build().unwrap();
    let config = QueryProxyConfig::new(Flavor::Query, broker);
    let provider: Box<dyn AuthHeaderProvider> = Box::new(StaticToken);
    let state = QueryProxyState::with_auth(&config, transport.clone(), Some(Mutex::new(provider)));
    let app = QueryProxy::from_state(state, &config.action_path).router();

    let mut request = form_post("/v2/ex/entities", "type=Room");
    request
        .headers_mut()
        .insert("authorization", HeaderValue::from_static("Bearer client-token"));
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(transport.last().headers["authorization"], "Bearer abc123");
}

#[tokio::test]
async fn test_keyrock_token_is_cached_between_requests() {
    let transport = RecordingTransport::ok(r#"{"access_token":"abc","expires_in":3600}"#);
    let idm = IdmConfig::new("keyrock")
        .idm_host("http://keyrock:3000/oauth2/token")
        .credentials("admin@test.com", "1234")
        .client("id", "secret");
    let broker = BrokerConfig::builder("http://orion:1026").idm(idm).build().unwrap();
    let app = QueryProxy::new(QueryProxyConfig::new(Flavor::Query, broker), transport.clone()).router();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(form_post("/v2/ex/entities", "type=Room"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].url.as_str(), "http://keyrock:3000/oauth2/token");
    assert_eq!(requests[1].headers["authorization"], "Bearer abc");
    assert_eq!(requests[2].headers["authorization"], "Bearer abc");
}

#[tokio::test]
async fn test_health_report() {
    let transport = RecordingTransport::ok("[]");
    let proxy = proxy(Flavor::Geo, transport);
    let app = proxy.router();

    app.clone().oneshot(form_post("/v2/ex/entities", "type=Room")).await.unwrap();
    app.clone().oneshot(form_post("/v2/ex/entities", "q=%zz")).await.unwrap();

    let first = body_string(app.clone().oneshot(get("/health")).await.unwrap()).await;
    let second = body_string(app.clone().oneshot(get("/health")).await.unwrap()).await;

    let report: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(report["ngsi-go"], "geoproxy");
    assert_eq!(report["health"], "OK");
    assert_eq!(report["orion"], "http://orion:1026/v2/entities");
    assert_eq!(report["verbose"], false);
    assert_eq!(report["timesent"], 2);
    assert_eq!(report["success"], 1);
    assert_eq!(report["failure"], 1);

    let keys: Vec<&str> = report.as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec!["ngsi-go", "version", "health", "orion", "verbose", "uptime", "timesent", "success", "failure"]
    );

    let again: serde_json::Value = serde_json::from_str(&second).unwrap();
    assert_eq!(again["timesent"], 2);

    let response = app.oneshot(form_post("/health", "a=1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_counters_stay_consistent_under_load() {
    let transport = RecordingTransport::ok("[]");
    let proxy = proxy(Flavor::Query, transport);
    let app = proxy.router();

    let mut handles = Vec::new();
    for i in 0..50 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let body = if i % 5 == 0 { "q=%zz" } else { "type=Room" };
            app.oneshot(form_post("/v2/ex/entities", body)).await.unwrap().status()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = proxy.state().stats().snapshot();
    assert_eq!(snapshot.time_sent, 50);
    assert_eq!(snapshot.success, 40);
    assert_eq!(snapshot.failure, 10);
    assert_eq!(snapshot.time_sent, snapshot.success + snapshot.failure);
}

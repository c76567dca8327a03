//! HTTP server & routing integration tests

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use corpmap_enrich::api::enrich::SESSION_ID_HEADER;
use corpmap_enrich::types::{FieldSet, KnownField};
use corpmap_enrich::{build_router, AppState};
use helpers::{industry, orchestrator, MockAdapter};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_app() -> axum::Router {
    let adapters = vec![
        Arc::new(MockAdapter::ok(
            "website",
            1,
            industry("Widgets").with(KnownField::DisplayName("Acme".into())),
        )),
        Arc::new(MockAdapter::ok(
            "registry",
            2,
            FieldSet::new().with(KnownField::EmployeeRange("51-200".into())),
        )),
    ];
    build_router(AppState::new(orchestrator(&adapters), Duration::from_secs(15)))
}

async fn get(app: &axum::Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn test_health_reports_ok() {
    let app = test_app();

    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "corpmap-enrich");
    assert_eq!(json["active_sessions"], 0);
    assert_eq!(json["breakers"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_invalid_domain_rejected() {
    let app = test_app();

    let response = get(&app, "/enrich/not_a_domain").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_enrich_streams_tiers_then_session_is_retrievable() {
    let app = test_app();

    let response = get(&app, "/enrich/www.Acme.test").await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert!(headers["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(headers["cache-control"], "no-cache, no-transform");
    assert_eq!(headers["x-accel-buffering"], "no");
    let session_id = headers[SESSION_ID_HEADER].to_str().unwrap().to_string();

    let body = body_text(response).await;
    let tier1 = body.find("event: tier_1_complete").expect("tier 1 event");
    let tier2 = body.find("event: tier_2_complete").expect("tier 2 event");
    let done = body.find("event: complete").expect("terminal event");
    assert!(tier1 < tier2 && tier2 < done);
    assert!(body.contains(r#""status":"tier_1_complete""#));
    assert!(body.contains(r#""status":"complete""#));
    assert!(body.contains(&session_id));

    let response = get(&app, &format!("/session/{session_id}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["vocabulary"], "v1");
    assert_eq!(json["domain"], "acme.test");
    assert_eq!(json["status"], "complete");
    assert_eq!(json["fields"]["name"]["value"], "Acme");
    assert_eq!(json["fields"]["employees"]["value"], "51-200");
    assert_eq!(json["fields"]["industry"]["contributing_sources"][0], "website");
}

#[tokio::test]
async fn test_unknown_session_not_found() {
    let app = test_app();

    let response = get(&app, &format!("/session/{}", uuid::Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&app, "/session/not-a-uuid").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

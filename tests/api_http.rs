// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /, /test, /health
// - POST /fetch-bands: placeholder success, progress reaching hub subscribers,
//   malformed JSON, missing geometry, bad dates, upstream failure

mod common;

use std::sync::Arc;

use serde_json::json;
use serde_json::Value as Json;
use shuttle_axum::axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use tower::ServiceExt as _; // for `oneshot`

use common::*;
use cropmap_pipeline::api::{self, AppState};
use cropmap_pipeline::progress::ProgressHub;
use cropmap_pipeline::sources::SourceKey;

const BODY_LIMIT: usize = 1024 * 1024;

fn router_with(secondary: StaticFetcher) -> (Router, Arc<ProgressHub>) {
    let hub = Arc::new(ProgressHub::default());
    let primary = Arc::new(StaticFetcher::ok(
        SourceKey::Primary,
        json!({
            "10,20": {"2024-01": {"B2": 0.1}},
            "11,20": {"2024-01": {"B2": 0.2}}
        }),
    ));
    let pipeline = build_pipeline(
        primary,
        Arc::new(secondary),
        Arc::new(ScriptedPredictor::default()),
        hub.clone(),
    );
    let router = api::router(AppState::new(Arc::new(pipeline), hub.clone()));
    (router, hub)
}

fn test_router() -> (Router, Arc<ProgressHub>) {
    router_with(StaticFetcher::ok(
        SourceKey::Secondary,
        json!({"10,20": {"2024-01": {"VV": -10.0}}}),
    ))
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

fn post_fetch_bands(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/fetch-bands")
        .header("content-type", "application/json")
        .body(body.into())
        .expect("build POST /fetch-bands")
}

#[tokio::test]
async fn api_health_returns_200_and_ok_body() {
    let (app, _) = test_router();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, bytes) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(bytes).unwrap().trim(), "OK");
}

#[tokio::test]
async fn welcome_routes_answer_with_message_json() {
    for (uri, expected) in [
        ("/", "Welcome to the Crop Mapping API!"),
        ("/test", "Test route working!"),
    ] {
        let (app, _) = test_router();
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, bytes) = send(app, req).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        let v: Json = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(v["message"], expected, "{uri}");
    }
}

#[tokio::test]
async fn fetch_bands_placeholder_returns_output_and_raw_results() {
    let (app, _) = test_router();
    let payload = json!({ "geojson": polygon(), "flag": false });

    let (status, bytes) = send(app, post_fetch_bands(payload.to_string())).await;
    assert_eq!(status, StatusCode::OK);

    let v: Json = serde_json::from_slice(&bytes).expect("parse json");
    let features = v["output"]["geometryCollection"].as_array().expect("features");
    assert_eq!(features.len(), 2);
    assert_eq!(features[0]["geometry"]["coordinates"], json!([10.0, 20.0]));
    assert_eq!(features[0]["properties"]["prediction"], json!(0));
    assert_eq!(v["output"]["metrics"]["positiveCoveragePercent"], json!(0.0));
    assert_eq!(v["output"]["metrics"]["negativeCoveragePercent"], json!(100.0));
    assert!(v["results"].get("primary").is_some(), "missing primary payload");
    assert!(v["results"].get("secondary").is_some(), "missing secondary payload");
}

#[tokio::test]
async fn fetch_bands_progress_reaches_subscribers() {
    let (app, hub) = test_router();
    let mut rx = hub.subscribe("satellite_progress");

    let payload = json!({ "geojson": polygon(), "flag": false, "startDate": "2024-03-01", "endDate": "2024-03-31" });
    let (status, _) = send(app, post_fetch_bands(payload.to_string())).await;
    assert_eq!(status, StatusCode::OK);

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert!(!events.is_empty());
    assert_contiguous(&events);
    assert_eq!(events.first().unwrap().start_progress, Some(0.0));
    assert_eq!(events.last().unwrap().end_progress, Some(100.0));

    let wire = serde_json::to_value(events.last().unwrap()).unwrap();
    assert_eq!(wire["type"], "progress");
    assert!(wire.get("startProgress").is_some());
    assert!(wire.get("message").is_some());
}

#[tokio::test]
async fn fetch_bands_rejects_malformed_json() {
    let (app, hub) = test_router();
    let mut rx = hub.subscribe("satellite_progress");

    let (status, bytes) = send(app, post_fetch_bands("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let v: Json = serde_json::from_slice(&bytes).expect("error json");
    assert!(v["error"].is_string());
    assert!(rx.try_recv().is_err(), "no progress for rejected input");
}

#[tokio::test]
async fn fetch_bands_requires_geometry() {
    let (app, _) = test_router();
    let (status, bytes) = send(app, post_fetch_bands(json!({ "flag": true }).to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let v: Json = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["error"], "No geometry provided");
}

#[tokio::test]
async fn fetch_bands_validates_dates() {
    for (start, end) in [("2024-13-01", "2024-02-01"), ("2024-03-01", "2024-02-01")] {
        let (app, _) = test_router();
        let payload = json!({ "geojson": polygon(), "startDate": start, "endDate": end });
        let (status, bytes) = send(app, post_fetch_bands(payload.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{start}..{end}");
        let v: Json = serde_json::from_slice(&bytes).unwrap();
        assert!(v["error"].as_str().unwrap().contains(start), "{v}");
    }
}

#[tokio::test]
async fn fetch_bands_upstream_failure_is_bad_gateway_with_error_event() {
    let (app, hub) = router_with(StaticFetcher::failing(SourceKey::Secondary, "provider unreachable"));
    let mut rx = hub.subscribe("satellite_progress");

    let payload = json!({ "geojson": polygon(), "flag": true });
    let (status, bytes) = send(app, post_fetch_bands(payload.to_string())).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let v: Json = serde_json::from_slice(&bytes).unwrap();
    assert!(v["error"].as_str().unwrap().contains("provider unreachable"));

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert_eq!(events.iter().filter(|e| e.is_error()).count(), 1);
    assert!(events.last().unwrap().is_error());
}

use std::{sync::Arc, time::Duration};

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use braess_bff::{DEGRADED_HEADER, router};
use braess_planner::planner::{
    EndpointSelection, NodeStatsStore, PlannerService,
    config::PlannerConfig,
    http::{HttpError, NodeCall, NodeResponse},
};
use serde_json::{Value, json};
use tower::{ServiceExt, service_fn};

fn config(enabled: bool) -> PlannerConfig {
    let raw = json!({
        "enabled": enabled,
        "policy": { "degradedP95Threshold": 200, "recoveryP95Threshold": 100 },
        "routes": {
            "dashboard": {
                "nodes": [
                    {
                        "name": "user",
                        "mandatory": true,
                        "primary": { "url": "http://user-primary/user", "timeoutMs": 500 },
                        "alternate": { "url": "http://user-alternate/user", "timeoutMs": 500 }
                    },
                    {
                        "name": "recs",
                        "primary": { "url": "http://recs-primary/recs", "timeoutMs": 500 }
                    }
                ]
            }
        }
    });
    PlannerConfig::from_json_str(&raw.to_string()).unwrap()
}

fn service(enabled: bool) -> Arc<PlannerService> {
    Arc::new(PlannerService::from_config(config(enabled)).unwrap())
}

/// Echoes the host it was sent to; the `failing` host answers 503.
async fn echo(call: NodeCall, failing: Option<&'static str>) -> Result<NodeResponse, HttpError> {
    let host = call.uri.host_str().unwrap_or_default().to_string();
    if failing == Some(host.as_str()) {
        return Ok(NodeResponse::new(StatusCode::SERVICE_UNAVAILABLE, "busy"));
    }
    Ok(NodeResponse::ok_json(&json!({ "host": host })))
}

fn degrade(service: &PlannerService, node: &str) {
    for _ in 0..20 {
        service.stats().record(
            "dashboard",
            node,
            EndpointSelection::Primary,
            Duration::from_millis(400),
            true,
        );
    }
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, headers, body)
}

#[tokio::test]
async fn health_check_answers_ok() {
    let app = router(service(true), service_fn(|call| echo(call, None)));

    let response = app
        .oneshot(Request::get("/__health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn healthy_route_returns_envelope_without_degraded_header() {
    let app = router(service(true), service_fn(|call| echo(call, None)));

    let (status, headers, body) = get(app, "/api/dashboard").await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(DEGRADED_HEADER).is_none());
    assert_eq!(
        body,
        json!({
            "nodes": {
                "user": { "host": "user-primary" },
                "recs": { "host": "recs-primary" }
            },
            "braess": { "degraded": [], "currentCost": 0.0, "targetCost": 0.0 }
        })
    );
}

#[tokio::test]
async fn degraded_node_is_detoured_and_flagged() {
    let service = service(true);
    degrade(&service, "user");
    let app = router(Arc::clone(&service), service_fn(|call| echo(call, None)));

    let (status, headers, body) = get(app, "/api/Dashboard").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[DEGRADED_HEADER], "user");
    assert_eq!(body["nodes"]["user"]["host"], "user-alternate");
    assert_eq!(body["braess"]["degraded"], json!(["user"]));
    assert_eq!(body["braess"]["currentCost"], 400.0);
    assert_eq!(body["braess"]["targetCost"], 360.0);
    assert_eq!(
        service.stats().snapshot("dashboard", "user").alternate_share,
        1
    );
}

#[tokio::test]
async fn disabled_planner_always_calls_primary() {
    let service = service(false);
    degrade(&service, "user");
    let app = router(service, service_fn(|call| echo(call, None)));

    let (status, headers, body) = get(app, "/api/dashboard").await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(DEGRADED_HEADER).is_none());
    assert_eq!(body["nodes"]["user"]["host"], "user-primary");
}

#[tokio::test]
async fn failed_optional_node_is_left_out() {
    let app = router(
        service(true),
        service_fn(|call| echo(call, Some("recs-primary"))),
    );

    let (status, _, body) = get(app, "/api/dashboard").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"], json!({ "user": { "host": "user-primary" } }));
}

#[tokio::test]
async fn failed_mandatory_node_is_a_problem_response() {
    let app = router(
        service(true),
        service_fn(|call| echo(call, Some("user-primary"))),
    );

    let (status, headers, body) = get(app, "/api/dashboard").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[header::CONTENT_TYPE], "application/problem+json");
    assert_eq!(
        body,
        json!({ "title": "Mandatory node user failed with 503", "status": 503 })
    );
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = router(service(true), service_fn(|call| echo(call, None)));

    let (status, _, body) = get(app, "/api/checkout").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
}

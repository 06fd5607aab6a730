//! HTTP front for the Braess-aware planner.
//!
//! - `GET /api/:route` aggregates every node of the route into one JSON
//!   envelope; degraded nodes are listed in the `x-braess-degraded` header
//! - `GET /__health` answers `OK`
//!
//! A failed mandatory node answers with a problem document carrying the
//! downstream status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use braess_planner::planner::{
    PlannerService,
    aggregate::{AggregateError, AggregateResponse, aggregate_route},
    http::{HttpError, NodeCall, NodeResponse},
};
use serde::Serialize;
use tower::Service;
use tower_http::trace::TraceLayer;

#[macro_use]
extern crate tracing;

pub const DEGRADED_HEADER: HeaderName = HeaderName::from_static("x-braess-degraded");

/// Shared by every request: the planner and the call capability used for
/// downstream nodes.
pub struct AppState<C> {
    pub service: Arc<PlannerService>,
    pub caller: C,
}

impl<C: Clone> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            caller: self.caller.clone(),
        }
    }
}

pub fn router<C>(service: Arc<PlannerService>, caller: C) -> Router
where
    C: Service<NodeCall, Response = NodeResponse, Error = HttpError>
        + Clone
        + Send
        + Sync
        + 'static,
    C::Future: Send,
{
    Router::new()
        .route("/api/:route", get(aggregate::<C>))
        .route("/__health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service, caller })
}

async fn aggregate<C>(State(state): State<AppState<C>>, Path(route): Path<String>) -> Response
where
    C: Service<NodeCall, Response = NodeResponse, Error = HttpError> + Clone + Send + Sync,
    C::Future: Send,
{
    match aggregate_route(&*state.service, &route, state.caller.clone()).await {
        Ok(body) => envelope(&body),
        Err(error) => problem(&error),
    }
}

fn envelope(body: &AggregateResponse) -> Response {
    let mut response = Json(body).into_response();
    if !body.braess.degraded.is_empty() {
        match HeaderValue::from_str(&body.braess.degraded.join(",")) {
            Ok(value) => {
                response.headers_mut().insert(DEGRADED_HEADER, value);
            }
            Err(error) => warn!(%error, "Degraded node names are not a valid header value"),
        }
    }
    response
}

#[derive(Serialize)]
struct Problem {
    title: String,
    status: u16,
}

fn problem(error: &AggregateError) -> Response {
    let status = error.status();
    if status.is_server_error() {
        warn!(%error, status = status.as_u16(), "Route aggregation failed");
    } else {
        debug!(%error, status = status.as_u16(), "Route aggregation rejected");
    }

    let body = Problem {
        title: error.to_string(),
        status: status.as_u16(),
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        Json(body),
    )
        .into_response()
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

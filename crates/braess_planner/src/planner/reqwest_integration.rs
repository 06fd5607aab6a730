// src/planner/reqwest_integration.rs
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::StatusCode;
use tower::Service;

use super::http::{HttpError, NodeCall, NodeResponse};

/// The reqwest-backed call capability: a `tower::Service<NodeCall>` that
/// performs a GET bounded by the call's timeout.
///
/// Non-success statuses come back as `Ok(NodeResponse)` so the planner can
/// record them and convert them itself; only transport-level failures are
/// `Err`.
#[derive(Clone)]
pub struct ReqwestCaller {
    client: reqwest::Client,
}

impl ReqwestCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<NodeCall> for ReqwestCaller {
    type Response = NodeResponse;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: NodeCall) -> Self::Future {
        let request_future = self
            .client
            .get(call.uri.clone())
            .timeout(call.timeout)
            .send();

        Box::pin(async move {
            match request_future.await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.bytes().await.map_err(|e| {
                        if e.is_timeout() {
                            warn!(uri = %call.uri, error = %e, "Timed out reading response body");
                            HttpError::Timeout
                        } else {
                            HttpError::Transport {
                                source: Box::new(e),
                            }
                        }
                    })?;

                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(uri = %call.uri, status = %status, "Server error or rate limited");
                    } else if status.is_client_error() {
                        error!(uri = %call.uri, status = %status, "Client error");
                    }

                    Ok(NodeResponse { status, body })
                }
                Err(e) => {
                    if e.is_timeout() {
                        warn!(uri = %call.uri, timeout_ms = call.timeout.as_millis(), "Request timed out");
                        Err(HttpError::Timeout)
                    } else if e.is_connect() {
                        error!(uri = %call.uri, error = %e, "Connection error");
                        Err(HttpError::Transport {
                            source: Box::new(e),
                        })
                    } else if e.is_builder() {
                        Err(HttpError::BuildRequest {
                            details: e.to_string(),
                        })
                    } else {
                        error!(uri = %call.uri, error = %e, "Other reqwest error");
                        Err(HttpError::ClientError {
                            source: Box::new(e),
                        })
                    }
                }
            }
        })
    }
}

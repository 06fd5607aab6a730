// src/planner/http.rs
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use serde::de::DeserializeOwned;
use snafu::Snafu;
use url::Url;

use crate::Error as CrateError;

/// A single GET against a node endpoint, bounded by the endpoint's timeout.
///
/// Any `tower::Service<NodeCall, Response = NodeResponse>` can serve as the
/// planner's call capability; it owns connection pooling, redirects and any
/// retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeCall {
    pub uri: Url,
    pub timeout: Duration,
}

/// Status and raw body of a downstream response.
#[derive(Clone, Debug)]
pub struct NodeResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl NodeResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(value: &serde_json::Value) -> Self {
        Self::new(StatusCode::OK, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Failure of a node call. Recorded as a failed sample, then handed back to
/// the caller unchanged; the planner never retries.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// An error occurred during the transport of the request (e.g., network issue, DNS).
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The node answered with a non-success status.
    #[snafu(display("HTTP server error response (status {}): {}", status, body))]
    ServerError { status: u16, body: String },

    /// The endpoint's timeout elapsed.
    #[snafu(display("HTTP request timed out"))]
    Timeout,

    #[snafu(display("Failed to build HTTP request: {}", details))]
    BuildRequest { details: String },

    /// Other, unspecified HTTP client errors.
    #[snafu(display("Generic HTTP client error: {}", source))]
    ClientError { source: CrateError },
}

impl HttpError {
    /// The downstream status, when the node actually answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::ServerError { status, .. } => StatusCode::from_u16(*status).ok(),
            _ => None,
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout)
    }

    pub(crate) fn from_response(response: &NodeResponse) -> Self {
        HttpError::ServerError {
            status: response.status.as_u16(),
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }
    }
}

// Boxed errors from generic services (tower's `BoxError`, mocks, layers)
// unwrap back into `HttpError` when that is what they carry.
impl From<CrateError> for HttpError {
    fn from(error: CrateError) -> Self {
        match error.downcast::<HttpError>() {
            Ok(http) => *http,
            Err(source) => {
                if source.is::<tower::timeout::error::Elapsed>() {
                    HttpError::Timeout
                } else {
                    HttpError::ClientError { source }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boxed_http_errors_round_trip() {
        let boxed: CrateError = Box::new(HttpError::Timeout);
        assert!(HttpError::from(boxed).is_timeout());

        let boxed: CrateError = Box::new(tower::timeout::error::Elapsed::new());
        assert!(HttpError::from(boxed).is_timeout());

        let boxed: CrateError = "socket closed".into();
        assert!(matches!(
            HttpError::from(boxed),
            HttpError::ClientError { .. }
        ));
    }

    #[test]
    fn only_server_errors_carry_a_status() {
        let response = NodeResponse::new(StatusCode::SERVICE_UNAVAILABLE, "busy");
        let error = HttpError::from_response(&response);
        assert_eq!(error.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(
            error.to_string(),
            "HTTP server error response (status 503): busy"
        );
        assert_eq!(HttpError::Timeout.status(), None);
    }

    #[test]
    fn decodes_json_bodies() {
        let response = NodeResponse::ok_json(&serde_json::json!({ "service": "accounts" }));
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["service"], "accounts");
        assert!(response.is_success());
    }
}

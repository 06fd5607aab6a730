//! Fans a route out to its nodes and folds the results into one envelope.

use std::collections::BTreeMap;

use futures::future::join_all;
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tower::Service;

use super::{
    CallPlannerPolicy, NodeStatsStore, PlannerError, PlannerService,
    http::{HttpError, NodeCall, NodeResponse},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AggregateError {
    #[snafu(display("Failed to plan route: {}", source))]
    Plan { source: PlannerError },

    #[snafu(display("Mandatory node {} failed with {}", node, status.as_u16()))]
    MandatoryNodeDown { node: String, status: StatusCode },
}

impl AggregateError {
    /// Status to answer the client with.
    pub fn status(&self) -> StatusCode {
        match self {
            AggregateError::Plan {
                source: PlannerError::UnknownRoute { .. },
            } => StatusCode::NOT_FOUND,
            AggregateError::MandatoryNodeDown { status, .. } => *status,
        }
    }
}

#[derive(Debug, Snafu)]
enum NodeFailure {
    #[snafu(display("{}", source))]
    Call { source: HttpError },

    #[snafu(display("Undecodable response body: {}", source))]
    Decode { source: serde_json::Error },
}

impl NodeFailure {
    fn status(&self) -> StatusCode {
        match self {
            NodeFailure::Call { source } => source.status(),
            NodeFailure::Decode { .. } => None,
        }
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// The response body for an aggregated route:
/// `{ "nodes": {...}, "braess": { "degraded": [...], "currentCost": x, "targetCost": y } }`.
#[derive(Clone, Debug, Serialize)]
pub struct AggregateResponse {
    pub nodes: BTreeMap<String, Value>,
    pub braess: BraessSummary,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BraessSummary {
    pub degraded: Vec<String>,
    pub current_cost: f64,
    pub target_cost: f64,
}

/// Plans `route_key` and calls every planned node concurrently.
///
/// A failed mandatory node fails the whole request; a failed optional node
/// is left out of `nodes`. Dropping the returned future cancels the pending
/// node calls, and each of them is recorded as a failure.
pub async fn aggregate_route<S, P, C>(
    service: &PlannerService<S, P>,
    route_key: &str,
    caller: C,
) -> Result<AggregateResponse, AggregateError>
where
    S: NodeStatsStore,
    P: CallPlannerPolicy,
    C: Service<NodeCall, Response = NodeResponse> + Clone,
    C::Error: Into<HttpError>,
{
    let plan = service.plan(route_key).context(PlanSnafu)?;
    let route = plan.route.as_str();

    let calls = plan.nodes.iter().map(|planned| {
        let caller = caller.clone();
        async move {
            let outcome = service
                .execute(route, planned, caller)
                .await
                .context(CallSnafu)
                .and_then(|response| response.json::<Value>().context(DecodeSnafu));
            (planned, outcome)
        }
    });

    let mut nodes = BTreeMap::new();
    for (planned, outcome) in join_all(calls).await {
        let name = &planned.node.name;
        match outcome {
            Ok(body) => {
                nodes.insert(name.clone(), body);
            }
            Err(failure) if planned.node.mandatory => {
                warn!(route, node = %name, error = %failure, "Mandatory node failed");
                return MandatoryNodeDownSnafu {
                    node: name.as_str(),
                    status: failure.status(),
                }
                .fail();
            }
            Err(failure) => {
                warn!(route, node = %name, error = %failure, "Omitting failed optional node");
            }
        }
    }

    Ok(AggregateResponse {
        nodes,
        braess: BraessSummary {
            degraded: plan.degraded_nodes().map(str::to_string).collect(),
            current_cost: plan.current_cost,
            target_cost: plan.target_cost,
        },
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::{assert_pending, task};
    use tower::service_fn;

    use super::*;
    use crate::planner::DownstreamNode;
    use crate::test_utils::{degrade, node_with_alternate, node_without_alternate, planner_service};

    fn mandatory(mut node: DownstreamNode) -> DownstreamNode {
        node.mandatory = true;
        node
    }

    /// Answers `{"from": "<host>/<path>"}` for every call, except for paths
    /// listed in `failing` which answer with the given status.
    fn caller(
        failing: &'static [(&'static str, StatusCode)],
    ) -> impl Service<NodeCall, Response = NodeResponse, Error = HttpError> + Clone {
        service_fn(move |call: NodeCall| async move {
            let path = call.uri.path().to_string();
            if let Some((_, status)) = failing.iter().find(|(failing, _)| *failing == path) {
                return Ok::<_, HttpError>(NodeResponse::new(*status, "unavailable"));
            }
            let from = format!("{}{}", call.uri.host_str().unwrap_or_default(), path);
            Ok(NodeResponse::ok_json(&json!({ "from": from })))
        })
    }

    #[tokio::test]
    async fn aggregates_every_node_into_the_envelope() {
        let service = planner_service(vec![
            mandatory(node_with_alternate("user")),
            node_without_alternate("recs"),
        ]);

        let response = aggregate_route(&service, "dashboard", caller(&[]))
            .await
            .unwrap();

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(
            body,
            json!({
                "nodes": {
                    "user": { "from": "primary/user" },
                    "recs": { "from": "primary/recs" }
                },
                "braess": { "degraded": [], "currentCost": 0.0, "targetCost": 0.0 }
            })
        );
    }

    #[tokio::test]
    async fn degraded_nodes_are_reported_and_detoured() {
        let service = planner_service(vec![
            mandatory(node_with_alternate("user")),
            node_with_alternate("recs"),
        ]);
        degrade(service.stats(), "dashboard", "user", 400);

        let response = aggregate_route(&service, "dashboard", caller(&[]))
            .await
            .unwrap();

        assert_eq!(response.nodes["user"], json!({ "from": "alternate/user" }));
        assert_eq!(response.nodes["recs"], json!({ "from": "primary/recs" }));
        assert_eq!(response.braess.degraded, ["user"]);
        assert_eq!(response.braess.current_cost, 400.0);
        assert_eq!(response.braess.target_cost, 360.0);
    }

    #[tokio::test]
    async fn failed_optional_node_is_omitted() {
        let service = planner_service(vec![
            mandatory(node_with_alternate("user")),
            node_without_alternate("recs"),
        ]);

        let response = aggregate_route(
            &service,
            "dashboard",
            caller(&[("/recs", StatusCode::SERVICE_UNAVAILABLE)]),
        )
        .await
        .unwrap();

        assert_eq!(response.nodes.len(), 1);
        assert!(response.nodes.contains_key("user"));
        assert_eq!(service.stats().snapshot("dashboard", "recs").error_rate, 1.0);
    }

    #[tokio::test]
    async fn failed_mandatory_node_fails_with_downstream_status() {
        let service = planner_service(vec![
            mandatory(node_with_alternate("user")),
            node_without_alternate("recs"),
        ]);

        let error = aggregate_route(
            &service,
            "dashboard",
            caller(&[("/user", StatusCode::INTERNAL_SERVER_ERROR)]),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, AggregateError::MandatoryNodeDown { ref node, .. } if node == "user"));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.to_string(), "Mandatory node user failed with 500");
        // The optional node was still called and recorded.
        assert_eq!(service.stats().snapshot("dashboard", "recs").requests(), 1);
    }

    #[tokio::test]
    async fn mandatory_transport_failure_is_service_unavailable() {
        let service = planner_service(vec![mandatory(node_with_alternate("user"))]);
        let timing_out =
            service_fn(|_: NodeCall| async { Err::<NodeResponse, _>(HttpError::Timeout) });

        let error = aggregate_route(&service, "dashboard", timing_out)
            .await
            .unwrap_err();

        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn undecodable_body_counts_as_node_failure() {
        let service = planner_service(vec![mandatory(node_with_alternate("user"))]);
        let garbage = service_fn(|_: NodeCall| async {
            Ok::<_, HttpError>(NodeResponse::new(StatusCode::OK, "<html>"))
        });

        let error = aggregate_route(&service, "dashboard", garbage)
            .await
            .unwrap_err();

        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let service = planner_service(vec![node_with_alternate("user")]);

        let error = aggregate_route(&service, "checkout", caller(&[]))
            .await
            .unwrap_err();

        assert!(matches!(error, AggregateError::Plan { .. }));
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dropping_the_request_records_failures_for_pending_calls() {
        let service = planner_service(vec![
            mandatory(node_with_alternate("user")),
            node_without_alternate("recs"),
        ]);
        let hanging = service_fn(|_: NodeCall| {
            futures::future::pending::<Result<NodeResponse, HttpError>>()
        });

        let mut request = task::spawn(aggregate_route(&service, "dashboard", hanging));
        assert_pending!(request.poll());
        assert_eq!(service.stats().snapshot("dashboard", "user").in_flight, 1);
        assert_eq!(service.stats().snapshot("dashboard", "recs").in_flight, 1);

        drop(request);

        for node in ["user", "recs"] {
            let snapshot = service.stats().snapshot("dashboard", node);
            assert_eq!(snapshot.in_flight, 0);
            assert_eq!(snapshot.requests(), 1);
            assert_eq!(snapshot.error_rate, 1.0);
        }
    }
}

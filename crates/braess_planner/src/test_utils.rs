use std::time::Duration;

use crate::planner::{
    DownstreamEndpoint, DownstreamNode, EndpointSelection, HysteresisPolicy,
    InMemoryNodeStatsStore, NodeStatsSnapshot, NodeStatsStore, PlannerPolicySettings,
    PlannerService, PlannerSettings, RouteSettings,
};

pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn endpoint(host: &str, name: &str, timeout_ms: u64) -> DownstreamEndpoint {
    let url = format!("http://{host}/{name}").parse().unwrap();
    DownstreamEndpoint::new(url, Duration::from_millis(timeout_ms))
}

/// Primary `http://primary/{name}` (100ms), alternate `http://alternate/{name}` (150ms).
pub fn node_with_alternate(name: &str) -> DownstreamNode {
    DownstreamNode::builder()
        .name(name)
        .primary(endpoint("primary", name, 100))
        .alternate(endpoint("alternate", name, 150))
        .build()
}

pub fn node_without_alternate(name: &str) -> DownstreamNode {
    DownstreamNode::builder()
        .name(name)
        .primary(endpoint("primary", name, 100))
        .build()
}

pub fn snapshot(p50: f64, p95: f64, p99: f64) -> NodeStatsSnapshot {
    NodeStatsSnapshot {
        p50,
        p95,
        p99,
        ..Default::default()
    }
}

pub fn route_settings(name: &str, nodes: Vec<DownstreamNode>) -> RouteSettings {
    RouteSettings::builder().name(name).nodes(nodes).build()
}

/// A `dashboard` route over `nodes`, degrading above 200ms and recovering
/// below 100ms.
pub fn planner_service(nodes: Vec<DownstreamNode>) -> PlannerService {
    let settings = PlannerSettings::builder()
        .routes(vec![route_settings("dashboard", nodes)])
        .build();
    let policy = PlannerPolicySettings::builder()
        .degraded_p95_threshold(200.0)
        .recovery_p95_threshold(100.0)
        .build();
    PlannerService::new(
        settings,
        InMemoryNodeStatsStore::new(),
        HysteresisPolicy::new(policy),
    )
}

/// Records 20 successful primary calls of `latency_ms` each.
pub fn degrade(stats: &InMemoryNodeStatsStore, route: &str, node: &str, latency_ms: u64) {
    for _ in 0..20 {
        stats.record(
            route,
            node,
            EndpointSelection::Primary,
            Duration::from_millis(latency_ms),
            true,
        );
    }
}

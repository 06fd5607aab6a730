use std::time::Duration;

use url::Url;

use super::{DownstreamNode, EndpointSelection};

/// The decision for one node in one planning cycle.
#[derive(Clone, Debug)]
pub struct PlannedNode {
    pub node: DownstreamNode,
    pub selection: EndpointSelection,
    pub is_degraded: bool,
    pub primary_p95: f64,
    pub alternate_p95: f64,
}

impl PlannedNode {
    /// Falls back to the primary endpoint if the node has no alternate.
    pub fn selected_uri(&self) -> &Url {
        match (self.selection, &self.node.alternate) {
            (EndpointSelection::Alternate, Some(alternate)) => &alternate.url,
            _ => &self.node.primary.url,
        }
    }

    pub fn selected_timeout(&self) -> Duration {
        match (self.selection, &self.node.alternate) {
            (EndpointSelection::Alternate, Some(alternate)) => alternate.timeout,
            _ => self.node.primary.timeout,
        }
    }
}

/// Ordered per-node decisions for a route plus its cost pair.
#[derive(Clone, Debug)]
pub struct PlannerPlan {
    pub route: String,
    pub nodes: Vec<PlannedNode>,
    pub current_cost: f64,
    pub target_cost: f64,
}

impl PlannerPlan {
    pub fn degraded_nodes(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes
            .iter()
            .filter(|planned| planned.is_degraded)
            .map(|planned| planned.node.name.as_str())
    }

    pub fn is_degraded(&self) -> bool {
        self.nodes.iter().any(|planned| planned.is_degraded)
    }
}

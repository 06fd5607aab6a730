use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

use crate::planner::{EndpointSelection, RouteCostSnapshot};
use crate::registered_event;

#[derive(Clone, Copy, Debug)]
pub struct NodeCallData {
    pub duration: Duration,
    pub success: bool,
}

registered_event! {
    PlanEvaluated {
        route: String,
    } => {
        route: String = self.route.clone(),
        plans: Counter = counter!("braess_bff_plans_total", "route" => self.route.clone()),
        // Point-in-time values; the last plan for a route wins.
        current_cost: Gauge = gauge!("braess_bff_endpoint_cost_current", "route" => self.route.clone()),
        target_cost: Gauge = gauge!("braess_bff_endpoint_cost_target", "route" => self.route.clone()),
    }

    fn emit(&self, cost: RouteCostSnapshot) {
        self.plans.increment(1);
        self.current_cost.set(cost.current_cost);
        self.target_cost.set(cost.target_cost);

        tracing::debug!(
            target: "braess_planner::planner",
            route = %self.route,
            current_cost_ms = cost.current_cost,
            target_cost_ms = cost.target_cost,
            "Plan Evaluated"
        );
    }
}

registered_event! {
    DetourApplied {
        node: String,
        success: bool,
    } => {
        node: String = self.node.clone(),
        success: bool = self.success,
        detours: Counter = counter!(
            "braess_bff_detours_applied_total",
            "node" => self.node.clone(),
            "success" => self.success.to_string()
        ),
    }

    fn emit(&self, count: u64) {
        self.detours.increment(count);
        tracing::debug!(target: "braess_planner::planner", node = %self.node, success = self.success, "Detour Applied");
    }
}

registered_event! {
    NodeCallObserved {
        route: String,
        node: String,
        selection: EndpointSelection,
    } => {
        route: String = self.route.clone(),
        node: String = self.node.clone(),
        selection: EndpointSelection = self.selection,
        latency: Histogram = histogram!(
            "braess_bff_node_latency",
            "route" => self.route.clone(),
            "node" => self.node.clone(),
            "selection" => self.selection.as_str()
        ),
        errors: Counter = counter!(
            "braess_bff_node_errors_total",
            "route" => self.route.clone(),
            "node" => self.node.clone(),
            "selection" => self.selection.as_str()
        ),
    }

    fn emit(&self, data: NodeCallData) {
        let latency_ms = data.duration.as_secs_f64() * 1000.0;
        self.latency.record(latency_ms);
        if !data.success {
            self.errors.increment(1);
        }

        // Raw samples, very verbose.
        tracing::trace!(
            target: "braess_planner::stats",
            route = %self.route,
            node = %self.node,
            selection = %self.selection,
            latency_ms,
            success = data.success,
            "Node Call Observed"
        );
    }
}

//! Plans routes and executes planned node calls.

use dashmap::DashMap;
use snafu::Snafu;
use tower::{Service, ServiceExt};

use super::{
    CallPlannerPolicy, HysteresisPolicy, InMemoryNodeStatsStore, NodeStatsStore, PlannedNode,
    PlannerPlan, PlannerSettings, RouteCostSnapshot, RouteSettings,
    config::{ConfigError, PlannerConfig},
    http::{HttpError, NodeCall, NodeResponse},
    internal_event::{
        DetourApplied, DetourAppliedHandle, InternalEventHandle, PlanEvaluated,
        PlanEvaluatedHandle,
    },
};
use crate::register;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PlannerError {
    #[snafu(display("Unknown route {}", route))]
    UnknownRoute { route: String },
}

/// The orchestrator tying the stats store, the policy and the configured
/// routes together.
///
/// `plan` reads; `execute` calls a node and writes exactly one sample back.
/// Both are safe to call from many requests at once.
pub struct PlannerService<S = InMemoryNodeStatsStore, P = HysteresisPolicy> {
    settings: PlannerSettings,
    stats: S,
    policy: P,
    plan_events: DashMap<String, PlanEvaluatedHandle>,
    detour_events: DashMap<(String, bool), DetourAppliedHandle>,
}

impl PlannerService {
    /// Builds the default in-memory store and hysteresis policy from a loaded
    /// configuration.
    pub fn from_config(config: PlannerConfig) -> Result<Self, ConfigError> {
        let policy = HysteresisPolicy::new(config.policy_settings());
        let stats = InMemoryNodeStatsStore::with_settings(config.stats_settings());
        let settings = config.into_settings()?;
        Ok(Self::new(settings, stats, policy))
    }
}

impl<S, P> PlannerService<S, P>
where
    S: NodeStatsStore,
    P: CallPlannerPolicy,
{
    pub fn new(settings: PlannerSettings, stats: S, policy: P) -> Self {
        Self {
            settings,
            stats,
            policy,
            plan_events: DashMap::new(),
            detour_events: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    pub fn stats(&self) -> &S {
        &self.stats
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn route(&self, route_key: &str) -> Result<&RouteSettings, PlannerError> {
        self.settings
            .route(route_key)
            .ok_or_else(|| PlannerError::UnknownRoute {
                route: route_key.to_string(),
            })
    }

    /// Decides primary or alternate for every node of the route.
    pub fn plan(&self, route_key: &str) -> Result<PlannerPlan, PlannerError> {
        let route = self.route(route_key)?;
        let nodes = route.nodes.as_slice();

        let cost = self.stats.route_snapshot(&route.name, nodes);
        let enabled = self.settings.enabled && route.enabled;
        let plan = self.policy.plan(
            &route.name,
            nodes,
            &|node: &str| self.stats.snapshot(&route.name, node),
            cost,
            enabled,
        );

        self.emit_plan_evaluated(
            &route.name,
            RouteCostSnapshot::new(plan.current_cost, plan.target_cost),
        );

        Ok(plan)
    }

    fn emit_plan_evaluated(&self, route: &str, cost: RouteCostSnapshot) {
        if let Some(handle) = self.plan_events.get(route) {
            handle.emit(cost);
            return;
        }
        self.plan_events
            .entry(route.to_string())
            .or_insert_with(|| {
                register!(PlanEvaluated {
                    route: route.to_string(),
                })
            })
            .emit(cost);
    }

    fn emit_detour_applied(&self, node: &str, success: bool) {
        let key = (node.to_string(), success);
        if let Some(handle) = self.detour_events.get(&key) {
            handle.emit(1);
            return;
        }
        self.detour_events
            .entry(key)
            .or_insert_with(|| {
                register!(DetourApplied {
                    node: node.to_string(),
                    success,
                })
            })
            .emit(1);
    }

    /// Calls the planned endpoint and records the outcome.
    ///
    /// Every failure (transport error, timeout, non-success status) is
    /// recorded and then returned; whether it is fatal for the request is up
    /// to the caller. If the returned future is dropped mid-call the
    /// execution scope records a failure instead.
    pub async fn execute<C>(
        &self,
        route_key: &str,
        planned: &PlannedNode,
        caller: C,
    ) -> Result<NodeResponse, HttpError>
    where
        C: Service<NodeCall, Response = NodeResponse>,
        C::Error: Into<HttpError>,
    {
        let node = planned.node.name.as_str();
        let selection = planned.selection;
        let scope = self.stats.begin_execution(route_key, node, selection);

        let call = NodeCall {
            uri: planned.selected_uri().clone(),
            timeout: planned.selected_timeout(),
        };
        let result = caller.oneshot(call).await.map_err(Into::into);
        let elapsed = scope.elapsed();

        let result = match result {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(HttpError::from_response(&response)),
            Err(error) => Err(error),
        };
        let success = result.is_ok();

        self.stats
            .record(route_key, node, selection, elapsed, success);
        scope.complete();

        if selection.is_alternate() {
            self.emit_detour_applied(node, success);
        }

        match &result {
            Ok(_) => debug!(
                route = route_key,
                node,
                %selection,
                elapsed_ms = elapsed.as_millis(),
                "Node call succeeded"
            ),
            Err(error) => debug!(
                route = route_key,
                node,
                %selection,
                elapsed_ms = elapsed.as_millis(),
                %error,
                "Node call failed"
            ),
        }

        result
    }
}

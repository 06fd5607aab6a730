//! Hysteresis-based primary/alternate selection.
//!
//! Each (route, node) pair is either steady (calling primary) or detouring
//! (calling alternate):
//!
//! ```text
//!            degraded && alternate && share < cap
//!   Steady ──────────────────────────────────────▶ Detouring
//!     ▲                                               │
//!     └───────────────────────────────────────────────┘
//!        past hysteresis window && p95 < recovery && errors < threshold
//! ```
//!
//! Within the hysteresis window a detouring node stays detouring no matter
//! what its metrics say.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::{
    DownstreamNode, EndpointSelection, NodeStatsSnapshot, PlannedNode, PlannerPlan,
    PlannerPolicySettings, RouteCostSnapshot, instant_now,
};

/// Turns per-node statistics into a plan for one route.
pub trait CallPlannerPolicy: Send + Sync {
    fn plan(
        &self,
        route: &str,
        nodes: &[DownstreamNode],
        snapshot_lookup: &dyn Fn(&str) -> NodeStatsSnapshot,
        cost: RouteCostSnapshot,
        enabled: bool,
    ) -> PlannerPlan;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HysteresisState {
    pub is_detouring: bool,
    /// `None` until the node first starts detouring.
    pub last_detour: Option<Instant>,
}

/// Hysteresis state per (route, node), keyed case-insensitively.
///
/// Each read-modify-write runs under the key's shard lock. Concurrent plans for
/// the same key may still interleave across evaluations; the last write wins.
#[derive(Debug, Default)]
pub struct HysteresisStore {
    states: DashMap<(String, String), HysteresisState>,
}

impl HysteresisStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(route: &str, node: &str) -> (String, String) {
        (route.to_lowercase(), node.to_lowercase())
    }

    /// Runs `update` against the state for the key, creating a steady state
    /// first if the key has never been evaluated.
    pub fn update_or_create<R>(
        &self,
        route: &str,
        node: &str,
        update: impl FnOnce(&mut HysteresisState) -> R,
    ) -> R {
        let mut state = self.states.entry(Self::key(route, node)).or_default();
        update(state.value_mut())
    }

    pub fn get(&self, route: &str, node: &str) -> Option<HysteresisState> {
        self.states
            .get(&Self::key(route, node))
            .map(|state| *state.value())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// The default [`CallPlannerPolicy`].
#[derive(Debug)]
pub struct HysteresisPolicy {
    settings: PlannerPolicySettings,
    states: HysteresisStore,
}

impl HysteresisPolicy {
    pub fn new(settings: PlannerPolicySettings) -> Self {
        Self::with_store(settings, HysteresisStore::new())
    }

    pub fn with_store(settings: PlannerPolicySettings, states: HysteresisStore) -> Self {
        Self { settings, states }
    }

    pub fn settings(&self) -> &PlannerPolicySettings {
        &self.settings
    }

    pub fn states(&self) -> &HysteresisStore {
        &self.states
    }

    fn is_degraded(&self, snapshot: &NodeStatsSnapshot) -> bool {
        let settings = &self.settings;
        snapshot.p95 > settings.degraded_p95_threshold
            || snapshot.error_rate > settings.error_rate_threshold
            || (snapshot.in_flight > 0
                && snapshot.p99 - snapshot.p50 > settings.degraded_latency_slope_threshold)
    }

    fn can_recover(&self, snapshot: &NodeStatsSnapshot) -> bool {
        snapshot.p95 < self.settings.recovery_p95_threshold
            && snapshot.error_rate < self.settings.error_rate_threshold
    }

    /// Advances the node's state machine and reports whether it detours now.
    fn decide(
        &self,
        node: &DownstreamNode,
        snapshot: &NodeStatsSnapshot,
        state: &mut HysteresisState,
        now: Instant,
    ) -> bool {
        if state.is_detouring {
            let dwell = state
                .last_detour
                .map_or(Duration::MAX, |since| now.saturating_duration_since(since));
            if dwell < self.settings.hysteresis_duration {
                return true;
            }
            if self.can_recover(snapshot) {
                state.is_detouring = false;
                return false;
            }
            // Still unhealthy: keep detouring without restarting the window.
            // The share cap is not rechecked once detouring.
            return true;
        }

        let share_cap = node.max_detour_share.min(self.settings.max_detour_share);
        if self.is_degraded(snapshot) && node.has_alternate() && snapshot.detour_share < share_cap
        {
            state.is_detouring = true;
            state.last_detour = Some(now);
            return true;
        }

        false
    }

    /// Relaxes the route target when any node is degraded: by 10% or by the
    /// slope threshold, whichever moves it less.
    fn adjusted_target(&self, target_cost: f64) -> f64 {
        (target_cost * 0.9).max(target_cost - self.settings.degraded_latency_slope_threshold)
    }
}

impl CallPlannerPolicy for HysteresisPolicy {
    fn plan(
        &self,
        route: &str,
        nodes: &[DownstreamNode],
        snapshot_lookup: &dyn Fn(&str) -> NodeStatsSnapshot,
        cost: RouteCostSnapshot,
        enabled: bool,
    ) -> PlannerPlan {
        let now = instant_now();
        let mut planned_nodes = Vec::with_capacity(nodes.len());

        for node in nodes {
            let snapshot = snapshot_lookup(&node.name);

            // Disabled planning leaves hysteresis state untouched so that
            // re-enabling starts from whatever was there before.
            if !enabled {
                planned_nodes.push(PlannedNode {
                    node: node.clone(),
                    selection: EndpointSelection::Primary,
                    is_degraded: false,
                    primary_p95: snapshot.p95,
                    alternate_p95: 0.0,
                });
                continue;
            }

            let detour = self.states.update_or_create(route, &node.name, |state| {
                self.decide(node, &snapshot, state, now)
            });
            let selection = if detour && node.has_alternate() {
                EndpointSelection::Alternate
            } else {
                EndpointSelection::Primary
            };

            planned_nodes.push(PlannedNode {
                node: node.clone(),
                selection,
                is_degraded: selection.is_alternate(),
                primary_p95: snapshot.p95,
                alternate_p95: snapshot.p95,
            });
        }

        let target_cost = if planned_nodes.iter().any(|planned| planned.is_degraded) {
            self.adjusted_target(cost.target_cost)
        } else {
            cost.target_cost
        };

        debug!(
            target: "braess_planner::policy",
            route,
            enabled,
            selection = %planned_nodes
                .iter()
                .map(|planned| format!("{}:{}", planned.node.name, planned.selection))
                .collect::<Vec<_>>()
                .join(","),
            "Route planned"
        );

        PlannerPlan {
            route: route.to_string(),
            nodes: planned_nodes,
            current_cost: cost.current_cost,
            target_cost,
        }
    }
}

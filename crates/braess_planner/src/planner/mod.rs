//! Plan and execute primary/alternate downstream calls per route.

pub mod aggregate;
pub mod config;
pub mod http;
pub mod internal_event;
mod node;
mod plan;
pub mod policy;
pub mod reqwest_integration;
pub mod service;
pub mod stats;

use std::time::Duration;

use bon::Builder;

pub use node::{DownstreamEndpoint, DownstreamNode, EndpointSelection};
pub use plan::{PlannedNode, PlannerPlan};
pub use policy::{CallPlannerPolicy, HysteresisPolicy};
pub use service::{PlannerError, PlannerService};
pub use stats::{
    ExecutionScope, InMemoryNodeStatsStore, NodeStatsSnapshot, NodeStatsStore, RouteCostSnapshot,
};

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

/// Thresholds driving the detour state machine.
///
/// All latency values are in milliseconds. The defaults match a dashboard
/// workload whose healthy P95 sits well under 300ms.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `degraded_p95_threshold` | 450 | P95 above which a steady node starts detouring |
/// | `recovery_p95_threshold` | 300 | P95 below which a detouring node may return to primary |
/// | `error_rate_threshold` | 0.2 | Error rate that triggers a detour and blocks recovery |
/// | `degraded_latency_slope_threshold` | 50 | Max tolerated P99-P50 spread while requests are in flight |
/// | `max_detour_share` | 0.2 | Global cap on the all-time share of requests sent to alternates |
/// | `hysteresis_duration` | 30s | Minimum dwell time in the detouring state |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use braess_planner::planner::PlannerPolicySettings;
///
/// let settings = PlannerPolicySettings::builder()
///     .degraded_p95_threshold(200.0)
///     .hysteresis_duration(Duration::from_secs(10))
///     .build();
/// assert_eq!(settings.recovery_p95_threshold(), 300.0);
/// ```
#[derive(Clone, Copy, Debug, Builder)]
pub struct PlannerPolicySettings {
    /// A steady node whose P95 exceeds this value starts detouring.
    #[builder(default = default_degraded_p95_threshold())]
    pub(super) degraded_p95_threshold: f64,

    /// A detouring node past its hysteresis window returns to primary only
    /// once its P95 drops below this value (and its error rate is healthy).
    #[builder(default = default_recovery_p95_threshold())]
    pub(super) recovery_p95_threshold: f64,

    #[builder(default = default_error_rate_threshold())]
    pub(super) error_rate_threshold: f64,

    /// Tail spread (`P99 - P50`) that counts as degradation while the node has
    /// requests in flight. Also bounds how far a degraded route's target cost
    /// is relaxed.
    #[builder(default = default_degraded_latency_slope_threshold())]
    pub(super) degraded_latency_slope_threshold: f64,

    /// Global detour-share cap; the effective cap for a node is the minimum of
    /// this and the node's own `max_detour_share`.
    #[builder(default = default_max_detour_share())]
    pub(super) max_detour_share: f64,

    #[builder(default = default_hysteresis_duration())]
    pub(super) hysteresis_duration: Duration,
}

const fn default_degraded_p95_threshold() -> f64 {
    450.0
}

const fn default_recovery_p95_threshold() -> f64 {
    300.0
}

const fn default_error_rate_threshold() -> f64 {
    0.2
}

const fn default_degraded_latency_slope_threshold() -> f64 {
    50.0
}

const fn default_max_detour_share() -> f64 {
    0.2
}

const fn default_hysteresis_duration() -> Duration {
    Duration::from_secs(30)
}

impl Default for PlannerPolicySettings {
    fn default() -> Self {
        Self {
            degraded_p95_threshold: default_degraded_p95_threshold(),
            recovery_p95_threshold: default_recovery_p95_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            degraded_latency_slope_threshold: default_degraded_latency_slope_threshold(),
            max_detour_share: default_max_detour_share(),
            hysteresis_duration: default_hysteresis_duration(),
        }
    }
}

impl PlannerPolicySettings {
    pub fn degraded_p95_threshold(&self) -> f64 {
        self.degraded_p95_threshold
    }
    pub fn recovery_p95_threshold(&self) -> f64 {
        self.recovery_p95_threshold
    }
    pub fn error_rate_threshold(&self) -> f64 {
        self.error_rate_threshold
    }
    pub fn degraded_latency_slope_threshold(&self) -> f64 {
        self.degraded_latency_slope_threshold
    }
    pub fn max_detour_share(&self) -> f64 {
        self.max_detour_share
    }
    pub fn hysteresis_duration(&self) -> Duration {
        self.hysteresis_duration
    }
}

/// A named group of nodes served together as one aggregate response.
#[derive(Clone, Debug, Builder)]
pub struct RouteSettings {
    #[builder(into)]
    pub name: String,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default)]
    pub nodes: Vec<DownstreamNode>,
}

/// Process-wide planner configuration: the global switch plus every route.
#[derive(Clone, Debug, Builder)]
pub struct PlannerSettings {
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default)]
    pub routes: Vec<RouteSettings>,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            routes: Vec::new(),
        }
    }
}

impl PlannerSettings {
    /// Case-insensitive route lookup, folded the same way as the stats and
    /// hysteresis keys.
    pub fn route(&self, key: &str) -> Option<&RouteSettings> {
        let key = key.to_lowercase();
        self.routes
            .iter()
            .find(|route| route.name.to_lowercase() == key)
    }
}

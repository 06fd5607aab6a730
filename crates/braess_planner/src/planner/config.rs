//! JSON configuration for the planner.
//!
//! ```json
//! {
//!   "enabled": true,
//!   "policy": { "degradedP95Threshold": 450, "hysteresisDurationMs": 30000 },
//!   "stats": { "windowMs": 120000 },
//!   "routes": {
//!     "dashboard": {
//!       "nodes": [
//!         {
//!           "name": "user",
//!           "mandatory": true,
//!           "primary": { "url": "http://user-primary/user", "timeoutMs": 2000 },
//!           "alternate": { "url": "http://user-alternate/user" }
//!         }
//!       ]
//!     }
//!   }
//! }
//! ```
//!
//! Everything except `routes`, node names and primary URLs has a default.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use url::Url;

use super::{
    DownstreamEndpoint, DownstreamNode, PlannerPolicySettings, PlannerSettings, RouteSettings,
    stats::StatsStoreSettings,
};

/// Overrides the global `enabled` flag when set to `true` or `false`.
pub const ENABLED_ENV: &str = "BRAESS_ENABLED";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Failed to read planner config {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse planner config: {}", source))]
    Parse { source: serde_json::Error },

    #[snafu(display("Route {} is configured more than once", route))]
    DuplicateRoute { route: String },

    #[snafu(display("Node {} is configured more than once on route {}", node, route))]
    DuplicateNode { route: String, node: String },

    #[snafu(display("Invalid URL {:?} for node {}: {}", url, node, source))]
    InvalidUrl {
        node: String,
        url: String,
        source: url::ParseError,
    },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    pub routes: BTreeMap<String, RouteConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub degraded_p95_threshold: f64,
    pub recovery_p95_threshold: f64,
    pub error_rate_threshold: f64,
    pub degraded_latency_slope_threshold: f64,
    pub max_detour_share: f64,
    pub hysteresis_duration_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let settings = PlannerPolicySettings::default();
        Self {
            degraded_p95_threshold: settings.degraded_p95_threshold(),
            recovery_p95_threshold: settings.recovery_p95_threshold(),
            error_rate_threshold: settings.error_rate_threshold(),
            degraded_latency_slope_threshold: settings.degraded_latency_slope_threshold(),
            max_detour_share: settings.max_detour_share(),
            hysteresis_duration_ms: settings.hysteresis_duration().as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsConfig {
    pub window_ms: u64,
    pub max_samples: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        let settings = StatsStoreSettings::default();
        Self {
            window_ms: settings.window.as_millis() as u64,
            max_samples: settings.max_samples,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default = "default_max_detour_share")]
    pub max_detour_share: f64,
    pub primary: EndpointConfig,
    #[serde(default)]
    pub alternate: Option<EndpointConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_max_detour_share() -> f64 {
    0.2
}

const fn default_timeout_ms() -> u64 {
    DownstreamEndpoint::DEFAULT_TIMEOUT.as_millis() as u64
}

impl PlannerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).context(ParseSnafu)
    }

    /// Applies [`ENABLED_ENV`] from the process environment.
    pub fn apply_env_override(&mut self) {
        let value = std::env::var(ENABLED_ENV).ok();
        self.apply_enabled_override(value.as_deref());
    }

    /// Sets the global flag from a `true`/`false` string; anything else is
    /// ignored.
    pub fn apply_enabled_override(&mut self, value: Option<&str>) {
        let Some(value) = value else {
            return;
        };
        match value.trim().to_ascii_lowercase().parse::<bool>() {
            Ok(enabled) => {
                info!(enabled, "Planner enabled flag overridden from {}", ENABLED_ENV);
                self.enabled = enabled;
            }
            Err(_) => warn!(value, "Ignoring unparsable {}", ENABLED_ENV),
        }
    }

    pub fn policy_settings(&self) -> PlannerPolicySettings {
        let policy = &self.policy;
        PlannerPolicySettings::builder()
            .degraded_p95_threshold(policy.degraded_p95_threshold)
            .recovery_p95_threshold(policy.recovery_p95_threshold)
            .error_rate_threshold(policy.error_rate_threshold)
            .degraded_latency_slope_threshold(policy.degraded_latency_slope_threshold)
            .max_detour_share(policy.max_detour_share)
            .hysteresis_duration(Duration::from_millis(policy.hysteresis_duration_ms))
            .build()
    }

    pub fn stats_settings(&self) -> StatsStoreSettings {
        StatsStoreSettings::builder()
            .window(Duration::from_millis(self.stats.window_ms))
            .max_samples(self.stats.max_samples)
            .build()
    }

    /// Validates names and URLs and produces the route table. Nodes keep
    /// their configured order.
    pub fn into_settings(self) -> Result<PlannerSettings, ConfigError> {
        let mut seen_routes = HashSet::new();
        let mut routes = Vec::with_capacity(self.routes.len());

        for (name, route) in self.routes {
            if !seen_routes.insert(name.to_lowercase()) {
                return DuplicateRouteSnafu { route: name }.fail();
            }

            let mut seen_nodes = HashSet::new();
            let mut nodes = Vec::with_capacity(route.nodes.len());
            for node in route.nodes {
                if !seen_nodes.insert(node.name.to_lowercase()) {
                    return DuplicateNodeSnafu {
                        route: name,
                        node: node.name,
                    }
                    .fail();
                }
                nodes.push(node.into_node()?);
            }

            routes.push(
                RouteSettings::builder()
                    .name(name)
                    .enabled(route.enabled)
                    .nodes(nodes)
                    .build(),
            );
        }

        Ok(PlannerSettings::builder()
            .enabled(self.enabled)
            .routes(routes)
            .build())
    }
}

impl NodeConfig {
    fn into_node(self) -> Result<DownstreamNode, ConfigError> {
        let primary = self.primary.into_endpoint(&self.name)?;
        let alternate = self
            .alternate
            .map(|alternate| alternate.into_endpoint(&self.name))
            .transpose()?;

        Ok(DownstreamNode::builder()
            .name(self.name)
            .primary(primary)
            .maybe_alternate(alternate)
            .mandatory(self.mandatory)
            .max_detour_share(self.max_detour_share)
            .build())
    }
}

impl EndpointConfig {
    fn into_endpoint(self, node: &str) -> Result<DownstreamEndpoint, ConfigError> {
        let url = Url::parse(&self.url).context(InvalidUrlSnafu {
            node,
            url: self.url.as_str(),
        })?;
        Ok(DownstreamEndpoint::new(
            url,
            Duration::from_millis(self.timeout_ms),
        ))
    }
}

//! Braess-aware call planning for backend-for-frontend aggregators.
//!
//! For each downstream dependency ("node") of a route, the planner decides on
//! every request whether to call the node's primary endpoint or detour to its
//! alternate, based on live latency and error telemetry. Detours are sticky:
//! once a node starts detouring it stays there for a hysteresis window, so the
//! planner does not flap between endpoints on noisy signals.
//!
//! # Components
//!
//! 1. [`planner::stats`]: a concurrent sliding-window statistics store that
//!    produces per-node latency percentiles and all-time error/detour shares
//! 2. [`planner::policy`]: the hysteresis state machine that turns snapshots
//!    into a [`planner::PlannerPlan`]
//! 3. [`planner::service`]: the orchestrator that plans a route, executes
//!    planned calls through any `tower::Service<NodeCall>`, and feeds
//!    outcomes back into the store exactly once per call
//! 4. [`planner::aggregate`]: the per-request loop that applies
//!    mandatory/optional node semantics and builds the response envelope
//!
//! # Concurrency
//! - Per-(route, node) state is sharded in `DashMap`s; there is no global lock
//! - In-flight tracking is RAII-scoped and survives cancellation
//! - Stats and policy evaluation never await
//!
//! # Basic Usage
//! ```no_run
//! use braess_planner::planner::{
//!     aggregate::aggregate_route, config::PlannerConfig,
//!     reqwest_integration::ReqwestCaller, PlannerService,
//! };
//!
//! # async fn run() -> Result<(), braess_planner::Error> {
//! let config = PlannerConfig::from_path("braess.json")?;
//! let service = PlannerService::from_config(config)?;
//! let response = aggregate_route(&service, "dashboard", ReqwestCaller::new()).await?;
//! println!("{}", serde_json::to_string(&response)?);
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits metrics through the `metrics` facade via the `InternalEventHandle`
//! trait; installing a recorder is up to the host.
pub mod planner;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

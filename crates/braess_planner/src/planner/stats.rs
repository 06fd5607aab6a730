//! Per-(route, node) latency windows and request counters.
//!
//! Two independent data paths feed a [`NodeStatsSnapshot`]:
//!
//! - latency percentiles come from a sliding window of recent samples
//!   (2 minutes by default), so they track the node's current behaviour;
//! - error rate and detour share come from monotonic counters kept since the
//!   process started, so they move slowly.
//!
//! The policy gates new detours on the all-time shares while reacting to
//! windowed latency, so the two paths stay separate. The windowed
//! error/detour figures are exposed as `window_*` fields for observability
//! only.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bon::Builder;
use dashmap::DashMap;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;

use super::{
    DownstreamNode, EndpointSelection, instant_now,
    internal_event::{
        InternalEventHandle, NodeCallData, NodeCallObserved, NodeCallObservedHandle,
    },
};
use crate::register;

/// Point-in-time statistics for one (route, node). Never stored.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeStatsSnapshot {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    /// All-time failed / total requests, in `[0, 1]`.
    pub error_rate: f64,
    pub in_flight: u64,
    /// All-time alternate / total requests, in `[0, 1]`.
    pub detour_share: f64,
    /// All-time request count sent to the primary endpoint.
    pub primary_share: u64,
    /// All-time request count sent to the alternate endpoint.
    pub alternate_share: u64,
    pub window_samples: u64,
    pub window_error_rate: f64,
    pub window_detour_share: f64,
}

impl NodeStatsSnapshot {
    pub fn requests(&self) -> u64 {
        self.primary_share + self.alternate_share
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RouteCostSnapshot {
    pub current_cost: f64,
    pub target_cost: f64,
}

impl RouteCostSnapshot {
    pub fn new(current_cost: f64, target_cost: f64) -> Self {
        Self {
            current_cost,
            target_cost,
        }
    }
}

/// Telemetry sink and source for the planner.
///
/// Implementations must never block on I/O and never fail: recording is
/// best-effort and unseen keys read as [`NodeStatsSnapshot::default`].
pub trait NodeStatsStore: Send + Sync {
    /// Marks a call as in flight until the returned scope is dropped.
    fn begin_execution(
        &self,
        route: &str,
        node: &str,
        selection: EndpointSelection,
    ) -> ExecutionScope;

    fn record(
        &self,
        route: &str,
        node: &str,
        selection: EndpointSelection,
        duration: Duration,
        success: bool,
    );

    fn snapshot(&self, route: &str, node: &str) -> NodeStatsSnapshot;

    /// Both costs are the worst P95 across `nodes`; the policy may relax the
    /// target afterwards.
    fn route_snapshot(&self, route: &str, nodes: &[DownstreamNode]) -> RouteCostSnapshot {
        let worst = nodes
            .iter()
            .map(|node| self.snapshot(route, &node.name).p95)
            .fold(0.0, f64::max);
        RouteCostSnapshot::new(worst, worst)
    }
}

impl<T: NodeStatsStore + ?Sized> NodeStatsStore for Arc<T> {
    fn begin_execution(
        &self,
        route: &str,
        node: &str,
        selection: EndpointSelection,
    ) -> ExecutionScope {
        (**self).begin_execution(route, node, selection)
    }

    fn record(
        &self,
        route: &str,
        node: &str,
        selection: EndpointSelection,
        duration: Duration,
        success: bool,
    ) {
        (**self).record(route, node, selection, duration, success)
    }

    fn snapshot(&self, route: &str, node: &str) -> NodeStatsSnapshot {
        (**self).snapshot(route, node)
    }

    fn route_snapshot(&self, route: &str, nodes: &[DownstreamNode]) -> RouteCostSnapshot {
        (**self).route_snapshot(route, nodes)
    }
}

/// How an [`ExecutionScope`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeExit {
    /// The owner recorded the outcome and called [`ExecutionScope::complete`].
    Completed,
    /// The scope was dropped first, e.g. because the call future was cancelled.
    Abandoned { elapsed: Duration },
}

/// RAII in-flight marker returned by [`NodeStatsStore::begin_execution`].
///
/// The release callback runs exactly once, from `Drop`, on every exit path.
pub struct ExecutionScope {
    started: Instant,
    completed: bool,
    release: Option<Box<dyn FnOnce(ScopeExit) + Send>>,
}

impl ExecutionScope {
    pub fn new(release: impl FnOnce(ScopeExit) + Send + 'static) -> Self {
        Self {
            started: instant_now(),
            completed: false,
            release: Some(Box::new(release)),
        }
    }

    /// A scope that tracks nothing.
    pub fn detached() -> Self {
        Self {
            started: instant_now(),
            completed: false,
            release: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        instant_now().saturating_duration_since(self.started)
    }

    /// Ends the scope after its outcome has been recorded.
    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            let exit = if self.completed {
                ScopeExit::Completed
            } else {
                ScopeExit::Abandoned {
                    elapsed: self.elapsed(),
                }
            };
            release(exit);
        }
    }
}

impl fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("started", &self.started)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, Builder)]
pub struct StatsStoreSettings {
    /// Samples older than this are evicted.
    #[builder(default = Duration::from_secs(120))]
    pub window: Duration,
    /// Upper bound on retained samples per (route, node); the oldest sample
    /// is dropped when the window is full.
    #[builder(default = 4096)]
    pub max_samples: usize,
}

impl Default for StatsStoreSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The in-process [`NodeStatsStore`].
///
/// State is created on first touch of a key and kept for the process
/// lifetime; the set of configured nodes is small and static.
pub struct InMemoryNodeStatsStore {
    settings: StatsStoreSettings,
    nodes: DashMap<StatsKey, Arc<NodeState>>,
}

impl InMemoryNodeStatsStore {
    pub fn new() -> Self {
        Self::with_settings(StatsStoreSettings::default())
    }

    pub fn with_settings(settings: StatsStoreSettings) -> Self {
        Self {
            settings,
            nodes: DashMap::new(),
        }
    }

    pub fn settings(&self) -> StatsStoreSettings {
        self.settings
    }

    /// Number of (route, node) keys with state.
    pub fn tracked_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn get_or_create(&self, route: &str, node: &str) -> Arc<NodeState> {
        let key = StatsKey::new(route, node);
        if let Some(state) = self.nodes.get(&key) {
            return Arc::clone(state.value());
        }

        let settings = self.settings;
        let entry = self
            .nodes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(NodeState::new(&key, settings)));
        Arc::clone(entry.value())
    }
}

impl Default for InMemoryNodeStatsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStatsStore for InMemoryNodeStatsStore {
    fn begin_execution(
        &self,
        route: &str,
        node: &str,
        selection: EndpointSelection,
    ) -> ExecutionScope {
        let state = self.get_or_create(route, node);
        state.counters.begin(selection);

        ExecutionScope::new(move |exit| {
            if let ScopeExit::Abandoned { elapsed } = exit {
                debug!(
                    target: "braess_planner::stats",
                    route = %state.key.route,
                    node = %state.key.node,
                    %selection,
                    elapsed_ms = elapsed.as_millis(),
                    "Call abandoned before completion; recording failure"
                );
                state.record(selection, elapsed, false);
            }
            state.counters.end(selection);
        })
    }

    fn record(
        &self,
        route: &str,
        node: &str,
        selection: EndpointSelection,
        duration: Duration,
        success: bool,
    ) {
        self.get_or_create(route, node)
            .record(selection, duration, success);
    }

    fn snapshot(&self, route: &str, node: &str) -> NodeStatsSnapshot {
        let state = self.get_or_create(route, node);
        let window = state.window.lock().summarize(instant_now());
        let counts = state.counters.summarize();

        NodeStatsSnapshot {
            p50: window.p50,
            p95: window.p95,
            p99: window.p99,
            error_rate: counts.error_rate,
            in_flight: counts.in_flight,
            detour_share: counts.detour_share,
            primary_share: counts.primary_total,
            alternate_share: counts.alternate_total,
            window_samples: window.samples,
            window_error_rate: ratio(window.errors, window.samples),
            window_detour_share: ratio(window.detours, window.samples),
        }
    }
}

/// Case-insensitive (route, node) identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StatsKey {
    route: String,
    node: String,
}

impl StatsKey {
    fn new(route: &str, node: &str) -> Self {
        Self {
            route: route.to_lowercase(),
            node: node.to_lowercase(),
        }
    }
}

struct NodeState {
    key: StatsKey,
    window: Mutex<SlidingWindow>,
    counters: RequestCounters,
    primary_events: NodeCallObservedHandle,
    alternate_events: NodeCallObservedHandle,
}

impl NodeState {
    fn new(key: &StatsKey, settings: StatsStoreSettings) -> Self {
        let events = |selection| {
            register!(NodeCallObserved {
                route: key.route.clone(),
                node: key.node.clone(),
                selection,
            })
        };

        Self {
            key: key.clone(),
            window: Mutex::new(SlidingWindow::new(settings.window, settings.max_samples)),
            counters: RequestCounters::default(),
            primary_events: events(EndpointSelection::Primary),
            alternate_events: events(EndpointSelection::Alternate),
        }
    }

    fn record(&self, selection: EndpointSelection, duration: Duration, success: bool) {
        self.window.lock().push(duration, success, selection);
        self.counters.record(selection, success);

        let events = match selection {
            EndpointSelection::Primary => &self.primary_events,
            EndpointSelection::Alternate => &self.alternate_events,
        };
        events.emit(NodeCallData { duration, success });
    }
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    timestamp: Instant,
    latency_ms: f64,
    success: bool,
    selection: EndpointSelection,
}

/// Bounded FIFO of samples in arrival order.
///
/// Samples are stamped under the lock, so arrival order is also timestamp
/// order and expiry only ever pops from the front.
#[derive(Debug)]
struct SlidingWindow {
    retention: Duration,
    capacity: usize,
    samples: VecDeque<Sample>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct WindowSummary {
    p50: f64,
    p95: f64,
    p99: f64,
    samples: u64,
    errors: u64,
    detours: u64,
}

impl SlidingWindow {
    fn new(retention: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            retention,
            capacity,
            samples: VecDeque::with_capacity(capacity.min(256)),
        }
    }

    fn push(&mut self, duration: Duration, success: bool, selection: EndpointSelection) {
        let now = instant_now();
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            timestamp: now,
            latency_ms: duration.as_secs_f64() * 1000.0,
            success,
            selection,
        });
        self.trim(now);
    }

    fn trim(&mut self, now: Instant) {
        while let Some(oldest) = self.samples.front() {
            if now.saturating_duration_since(oldest.timestamp) <= self.retention {
                break;
            }
            self.samples.pop_front();
        }
    }

    fn summarize(&mut self, now: Instant) -> WindowSummary {
        self.trim(now);
        if self.samples.is_empty() {
            return WindowSummary::default();
        }

        let mut latencies: Vec<f64> = self.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable_by_key(|latency| OrderedFloat(*latency));

        WindowSummary {
            p50: percentile(&latencies, 50.0),
            p95: percentile(&latencies, 95.0),
            p99: percentile(&latencies, 99.0),
            samples: latencies.len() as u64,
            errors: self.samples.iter().filter(|s| !s.success).count() as u64,
            detours: self
                .samples
                .iter()
                .filter(|s| s.selection.is_alternate())
                .count() as u64,
        }
    }
}

/// Nearest-rank percentile over an ascending slice: index
/// `clamp(ceil(p/100 * n) - 1, 0, n - 1)`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p / 100.0 * n as f64).ceil() as i64 - 1;
    sorted[rank.clamp(0, n as i64 - 1) as usize]
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// All-time counters; relaxed ordering is enough for telemetry.
#[derive(Debug, Default)]
struct RequestCounters {
    primary_in_flight: AtomicU64,
    alternate_in_flight: AtomicU64,
    primary_success: AtomicU64,
    alternate_success: AtomicU64,
    primary_errors: AtomicU64,
    alternate_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug)]
struct CounterSummary {
    in_flight: u64,
    error_rate: f64,
    detour_share: f64,
    primary_total: u64,
    alternate_total: u64,
}

impl RequestCounters {
    fn in_flight(&self, selection: EndpointSelection) -> &AtomicU64 {
        match selection {
            EndpointSelection::Primary => &self.primary_in_flight,
            EndpointSelection::Alternate => &self.alternate_in_flight,
        }
    }

    fn begin(&self, selection: EndpointSelection) {
        self.in_flight(selection).fetch_add(1, Ordering::Relaxed);
    }

    fn end(&self, selection: EndpointSelection) {
        // Saturates at zero.
        let _ = self
            .in_flight(selection)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_sub(1)
            });
    }

    fn record(&self, selection: EndpointSelection, success: bool) {
        let counter = match (selection, success) {
            (EndpointSelection::Primary, true) => &self.primary_success,
            (EndpointSelection::Primary, false) => &self.primary_errors,
            (EndpointSelection::Alternate, true) => &self.alternate_success,
            (EndpointSelection::Alternate, false) => &self.alternate_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn summarize(&self) -> CounterSummary {
        let primary_success = self.primary_success.load(Ordering::Relaxed);
        let alternate_success = self.alternate_success.load(Ordering::Relaxed);
        let primary_errors = self.primary_errors.load(Ordering::Relaxed);
        let alternate_errors = self.alternate_errors.load(Ordering::Relaxed);

        let primary_total = primary_success + primary_errors;
        let alternate_total = alternate_success + alternate_errors;
        let total = primary_total + alternate_total;

        CounterSummary {
            in_flight: self.primary_in_flight.load(Ordering::Relaxed)
                + self.alternate_in_flight.load(Ordering::Relaxed),
            error_rate: ratio(primary_errors + alternate_errors, total),
            detour_share: ratio(alternate_total, total),
            primary_total,
            alternate_total,
        }
    }
}

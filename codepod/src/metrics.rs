use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use codepod_protocol::InstanceState;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::workspace::WorkspaceManager;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct InstanceStateLabels {
    state: InstanceStateLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum InstanceStateLabel {
    Creating,
    Running,
    Degraded,
    Stopping,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AcquireLabels {
    result: AcquireResult,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AcquireResult {
    Reused,
    Created,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EvictionLabels {
    reason: EvictionReason,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum EvictionReason {
    Idle,
    Capacity,
    Forced,
    Liveness,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FlushLabels {
    result: FlushResult,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FlushResult {
    Ok,
    Failed,
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Prometheus metrics registry for codepod.
///
/// All methods are cheap (atomic operations) and safe to call from any async context.
/// The struct is `Clone + Send + Sync` via internal `Arc`.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Mutex<Registry>,
    instances_total: Family<InstanceStateLabels, Gauge>,
    sessions_active: Gauge,
    acquire_total: Family<AcquireLabels, Counter>,
    evictions_total: Family<EvictionLabels, Counter>,
    restarts_total: Counter,
    resource_warnings_total: Counter,
    flush_total: Family<FlushLabels, Counter>,
    provision_duration_seconds: Histogram,
    start_time: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let instances_total = Family::<InstanceStateLabels, Gauge>::default();
        registry.register(
            "codepod_instances_total",
            "Current number of workspace instances by state",
            instances_total.clone(),
        );

        let sessions_active = Gauge::default();
        registry.register(
            "codepod_sessions_active",
            "Open terminal sessions across all instances",
            sessions_active.clone(),
        );

        let acquire_total = Family::<AcquireLabels, Counter>::default();
        registry.register(
            "codepod_acquire",
            "Workspace acquisitions by result",
            acquire_total.clone(),
        );

        let evictions_total = Family::<EvictionLabels, Counter>::default();
        registry.register(
            "codepod_evictions",
            "Instances removed, by reason",
            evictions_total.clone(),
        );

        let restarts_total = Counter::default();
        registry.register(
            "codepod_restarts",
            "Restart attempts made by the health monitor",
            restarts_total.clone(),
        );

        let resource_warnings_total = Counter::default();
        registry.register(
            "codepod_resource_warnings",
            "Health samples above the usage warning threshold",
            resource_warnings_total.clone(),
        );

        let flush_total = Family::<FlushLabels, Counter>::default();
        registry.register(
            "codepod_flush",
            "Write-back flushes by result",
            flush_total.clone(),
        );

        // Counters are exposed with a `_total` suffix added by the encoder.
        // Provisioning includes image start and bootstrap: 0.5s to ~64s
        let provision_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 8));
        registry.register(
            "codepod_provision_duration_seconds",
            "Time from acquire to a running instance",
            provision_duration_seconds.clone(),
        );

        Self {
            inner: Arc::new(MetricsInner {
                registry: Mutex::new(registry),
                instances_total,
                sessions_active,
                acquire_total,
                evictions_total,
                restarts_total,
                resource_warnings_total,
                flush_total,
                provision_duration_seconds,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_acquire(&self, result: AcquireResult) {
        self.inner
            .acquire_total
            .get_or_create(&AcquireLabels { result })
            .inc();
    }

    pub fn record_provision(&self, duration: std::time::Duration) {
        self.inner
            .provision_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_eviction(&self, reason: EvictionReason) {
        self.inner
            .evictions_total
            .get_or_create(&EvictionLabels { reason })
            .inc();
    }

    pub fn record_restart(&self) {
        self.inner.restarts_total.inc();
    }

    pub fn record_resource_warning(&self) {
        self.inner.resource_warnings_total.inc();
    }

    pub fn record_flush(&self, result: FlushResult) {
        self.inner
            .flush_total
            .get_or_create(&FlushLabels { result })
            .inc();
    }

    pub fn set_sessions(&self, count: i64) {
        self.inner.sessions_active.set(count);
    }

    /// Update instance gauges from the current set of instance states.
    pub fn set_instance_counts<I: IntoIterator<Item = InstanceState>>(&self, states: I) {
        let (mut creating, mut running, mut degraded, mut stopping) = (0i64, 0i64, 0i64, 0i64);
        for state in states {
            match state {
                InstanceState::Creating => creating += 1,
                InstanceState::Running => running += 1,
                InstanceState::Degraded => degraded += 1,
                InstanceState::Stopping => stopping += 1,
                InstanceState::Terminated => {}
            }
        }
        for (state, count) in [
            (InstanceStateLabel::Creating, creating),
            (InstanceStateLabel::Running, running),
            (InstanceStateLabel::Degraded, degraded),
            (InstanceStateLabel::Stopping, stopping),
        ] {
            self.inner
                .instances_total
                .get_or_create(&InstanceStateLabels { state })
                .set(count);
        }
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode_metrics(&self) -> String {
        let mut buf = String::new();
        if let Ok(registry) = self.inner.registry.lock() {
            if let Err(e) = encode(&mut buf, &registry) {
                tracing::warn!(error = %e, "failed to encode metrics");
            }
        }
        buf
    }

    /// Get uptime in seconds since the registry was created.
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

struct MetricsState {
    metrics: MetricsRegistry,
    manager: Arc<WorkspaceManager>,
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    // Refresh gauges before encoding
    let instances = state.manager.list().await;
    state
        .metrics
        .set_instance_counts(instances.iter().map(|i| i.state));
    state
        .metrics
        .set_sessions(state.manager.session_count() as i64);

    let body = state.metrics.encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        body,
    )
}

async fn healthz_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    let instances = state.manager.list().await;
    let running = instances
        .iter()
        .filter(|i| i.state == InstanceState::Running)
        .count();

    let body = serde_json::json!({
        "status": "ok",
        "instances": {
            "total": instances.len(),
            "running": running,
            "capacity": state.manager.capacity(),
        },
        "sessions": state.manager.session_count(),
        "uptime_seconds": state.metrics.uptime_seconds(),
    });

    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body.to_string(),
    )
}

/// Start the metrics HTTP server as a background tokio task.
pub fn start_metrics_server(
    addr: SocketAddr,
    metrics: MetricsRegistry,
    manager: Arc<WorkspaceManager>,
) -> tokio::task::JoinHandle<()> {
    let state = Arc::new(MetricsState { metrics, manager });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state);

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "failed to bind metrics server");
                return;
            }
        };
        tracing::info!(addr = %addr, "metrics server listening");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server error");
        }
    })
}

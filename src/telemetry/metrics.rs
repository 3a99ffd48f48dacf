use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use opentelemetry::metrics::MeterProvider;
use opentelemetry_prometheus::exporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatch::InFlightTracker;

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// HTTP endpoint address
    pub address: SocketAddr,
}

/// Dependency status for readiness checks
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Admin state for health/stats endpoints
#[derive(Debug)]
pub struct AdminState {
    start_time: Instant,
    healthy: AtomicBool,
    draining: AtomicBool,
    dispatch_submitted: AtomicU64,
    dispatch_delivered: AtomicU64,
    dispatch_failed: AtomicU64,
    webhooks_received: AtomicU64,
    /// Health of registered dependencies (storage, event sink)
    dependencies: RwLock<BTreeMap<String, bool>>,
    in_flight: OnceLock<InFlightTracker>,
}

impl AdminState {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            healthy: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            dispatch_submitted: AtomicU64::new(0),
            dispatch_delivered: AtomicU64::new(0),
            dispatch_failed: AtomicU64::new(0),
            webhooks_received: AtomicU64::new(0),
            dependencies: RwLock::new(BTreeMap::new()),
            in_flight: OnceLock::new(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Ready when not draining and every registered dependency is healthy.
    pub fn is_ready(&self) -> bool {
        if self.draining.load(Ordering::Relaxed) {
            return false;
        }
        self.dependencies
            .read()
            .map(|deps| deps.values().all(|healthy| *healthy))
            .unwrap_or(false)
    }

    /// Stop reporting ready; set once shutdown starts draining.
    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    pub fn inc_submitted(&self) {
        self.dispatch_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delivered(&self) {
        self.dispatch_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.dispatch_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhooks(&self) {
        self.webhooks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn webhooks_received(&self) -> u64 {
        self.webhooks_received.load(Ordering::Relaxed)
    }

    /// Expose the dispatch in-flight count on `/stats`.
    pub fn track_in_flight(&self, tracker: InFlightTracker) {
        let _ = self.in_flight.set(tracker);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.get().map(|t| t.count()).unwrap_or(0)
    }

    /// Register a dependency that must be healthy for readiness. Starts unhealthy.
    pub fn register_dependency(&self, name: &str) {
        if let Ok(mut deps) = self.dependencies.write() {
            deps.entry(name.to_string()).or_insert(false);
        }
    }

    pub fn set_dependency_health(&self, name: &str, healthy: bool) {
        if let Ok(mut deps) = self.dependencies.write() {
            deps.insert(name.to_string(), healthy);
        }
    }

    /// Get dependency status for readiness response
    pub fn get_dependency_status(&self) -> Vec<DependencyStatus> {
        let Ok(deps) = self.dependencies.read() else {
            return Vec::new();
        };
        deps.iter()
            .map(|(name, healthy)| DependencyStatus {
                name: name.clone(),
                healthy: *healthy,
                message: if *healthy {
                    None
                } else {
                    Some(format!("{} unavailable", name))
                },
            })
            .collect()
    }
}

impl Default for AdminState {
    fn default() -> Self {
        Self::new()
    }
}

/// OTEL Metrics with Prometheus exporter
pub struct Metrics {
    registry: Registry,
    meter_provider: SdkMeterProvider,
    address: SocketAddr,
    admin_state: Arc<AdminState>,
}

impl Metrics {
    /// Create metrics with OTEL → Prometheus pipeline
    pub fn new(config: &MetricsConfig) -> Result<Arc<Self>> {
        let registry = Registry::new();

        let exporter = exporter().with_registry(registry.clone()).build()?;

        let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();

        // Register as global meter provider
        opentelemetry::global::set_meter_provider(meter_provider.clone());

        info!(
            address = %config.address,
            "OTEL metrics configured with Prometheus exporter"
        );

        Ok(Arc::new(Self {
            registry,
            meter_provider,
            address: config.address,
            admin_state: Arc::new(AdminState::new()),
        }))
    }

    /// Get admin state for updating metrics from other components
    pub fn admin_state(&self) -> Arc<AdminState> {
        self.admin_state.clone()
    }

    /// Get a meter for recording metrics
    pub fn meter(&self, name: &'static str) -> opentelemetry::metrics::Meter {
        self.meter_provider.meter(name)
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).context("prometheus output is not utf-8")
    }

    /// Admin router: Prometheus scrape plus health, readiness and stats.
    pub fn router(self: &Arc<Self>) -> Router {
        let metrics = self.clone();

        Router::new()
            // Prometheus metrics
            .route(
                "/metrics",
                get(move || {
                    let m = metrics.clone();
                    async move {
                        match m.render() {
                            Ok(body) => (StatusCode::OK, body),
                            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        }
                    }
                }),
            )
            // Kubernetes-style health endpoints
            .route("/healthz", get(healthz_handler))
            .route("/livez", get(livez_handler))
            .route("/readyz", get(readyz_handler))
            .route("/stats", get(stats_handler))
            // Legacy endpoints
            .route("/health", get(|| async { "OK" }))
            .route("/ready", get(|| async { "OK" }))
            .with_state(self.admin_state.clone())
    }

    /// Start the admin HTTP server; returns when `shutdown` is cancelled.
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.address)
            .await
            .with_context(|| format!("failed to bind admin address {}", self.address))?;

        info!(address = %self.address, "admin server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

// ============================================================================
// Admin API Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    uptime_seconds: u64,
    dispatch: DispatchStats,
    webhooks_received: u64,
}

#[derive(Debug, Serialize)]
struct DispatchStats {
    submitted: u64,
    delivered: u64,
    failed: u64,
    in_flight: usize,
}

/// Readiness response with dependency details
#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    dependencies: Vec<DependencyStatus>,
}

// ============================================================================
// Admin API Handlers
// ============================================================================

async fn healthz_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: if state.is_healthy() { "healthy".to_string() } else { "unhealthy".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if state.is_healthy() {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let response = ReadinessResponse {
        ready: state.is_ready(),
        dependencies: state.get_dependency_status(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn stats_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(StatsResponse {
        uptime_seconds: state.uptime_secs(),
        dispatch: DispatchStats {
            submitted: state.dispatch_submitted.load(Ordering::Relaxed),
            delivered: state.dispatch_delivered.load(Ordering::Relaxed),
            failed: state.dispatch_failed.load(Ordering::Relaxed),
            in_flight: state.in_flight(),
        },
        webhooks_received: state.webhooks_received.load(Ordering::Relaxed),
    })
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.shutdown() {
            warn!(error = %e, "failed to shutdown meter provider");
        }
    }
}

/// Dispatch metrics with dispatch_* prefix.
/// Every recording function is a no-op until `init` runs.
pub mod counters {
    use opentelemetry::metrics::{Counter, Gauge, Histogram};
    use opentelemetry::KeyValue;
    use std::sync::OnceLock;

    // ============================================================================
    // DISPATCH METRICS
    // ============================================================================

    static DISPATCH_SUBMITTED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static DISPATCH_REJECTED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static DISPATCH_RETRIES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static DISPATCH_DEAD_LETTERS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static DISPATCH_CANCELLED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static DISPATCH_IN_FLIGHT: OnceLock<Gauge<i64>> = OnceLock::new();

    // ============================================================================
    // VENDOR METRICS
    // ============================================================================

    static VENDOR_RESPONSES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static VENDOR_REQUEST_DURATION: OnceLock<Histogram<f64>> = OnceLock::new();

    // ============================================================================
    // ACKNOWLEDGEMENT STORE METRICS
    // ============================================================================

    static STORE_OPERATIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static STORE_VERSION_CONFLICTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static STORE_CODEC_ERRORS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // EVENT / WEBHOOK METRICS
    // ============================================================================

    static EVENTS_PUBLISHED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static EVENTS_DERIVE_FAILURES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static WEBHOOK_EVENTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static WEBHOOK_ORPHANS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static OPTIN_TRANSITIONS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // PROCESS METRICS
    // ============================================================================

    static CONFIG_RELOADS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SERVER_INFO: OnceLock<Gauge<i64>> = OnceLock::new();

    /// Initialize all metrics
    pub fn init(meter: &opentelemetry::metrics::Meter) {
        // ========================================================================
        // Dispatch metrics
        // ========================================================================
        let _ = DISPATCH_SUBMITTED_TOTAL.set(
            meter.u64_counter("dispatch_submitted_total")
                .with_description("Dispatch attempts handed to the vendor transport")
                .build(),
        );
        let _ = DISPATCH_REJECTED_TOTAL.set(
            meter.u64_counter("dispatch_rejected_total")
                .with_description("Sends rejected before submission, by reason")
                .build(),
        );
        let _ = DISPATCH_RETRIES_TOTAL.set(
            meter.u64_counter("dispatch_retries_total")
                .with_description("Retry attempts by channel and next vendor")
                .build(),
        );
        let _ = DISPATCH_DEAD_LETTERS_TOTAL.set(
            meter.u64_counter("dispatch_dead_letters_total")
                .with_description("Messages dead-lettered after exhausting retries")
                .build(),
        );
        let _ = DISPATCH_CANCELLED_TOTAL.set(
            meter.u64_counter("dispatch_cancelled_total")
                .with_description("Dispatch attempts cancelled before completion")
                .build(),
        );
        let _ = DISPATCH_IN_FLIGHT.set(
            meter.i64_gauge("dispatch_in_flight")
                .with_description("Outstanding asynchronous dispatch attempts")
                .build(),
        );

        // ========================================================================
        // Vendor metrics
        // ========================================================================
        let _ = VENDOR_RESPONSES_TOTAL.set(
            meter.u64_counter("dispatch_vendor_responses_total")
                .with_description("Vendor responses by channel, vendor and outcome")
                .build(),
        );
        let _ = VENDOR_REQUEST_DURATION.set(
            meter.f64_histogram("dispatch_vendor_request_duration_seconds")
                .with_description("Vendor HTTP round-trip latency")
                .build(),
        );

        // ========================================================================
        // Store metrics
        // ========================================================================
        let _ = STORE_OPERATIONS_TOTAL.set(
            meter.u64_counter("dispatch_store_operations_total")
                .with_description("Acknowledgement store operations by result")
                .build(),
        );
        let _ = STORE_VERSION_CONFLICTS_TOTAL.set(
            meter.u64_counter("dispatch_store_version_conflicts_total")
                .with_description("Optimistic version conflicts on acknowledgement writes")
                .build(),
        );
        let _ = STORE_CODEC_ERRORS_TOTAL.set(
            meter.u64_counter("dispatch_store_codec_errors_total")
                .with_description("Acknowledgement fields skipped due to decode errors")
                .build(),
        );

        // ========================================================================
        // Event and webhook metrics
        // ========================================================================
        let _ = EVENTS_PUBLISHED_TOTAL.set(
            meter.u64_counter("dispatch_events_published_total")
                .with_description("Downstream publishes by topic and result")
                .build(),
        );
        let _ = EVENTS_DERIVE_FAILURES_TOTAL.set(
            meter.u64_counter("dispatch_derive_failures_total")
                .with_description("Inbound events or channels that failed derivation")
                .build(),
        );
        let _ = WEBHOOK_EVENTS_TOTAL.set(
            meter.u64_counter("dispatch_webhook_events_total")
                .with_description("Vendor webhook callbacks by channel and resulting state")
                .build(),
        );
        let _ = WEBHOOK_ORPHANS_TOTAL.set(
            meter.u64_counter("dispatch_webhook_orphans_total")
                .with_description("Webhook callbacks with no matching acknowledgement")
                .build(),
        );
        let _ = OPTIN_TRANSITIONS_TOTAL.set(
            meter.u64_counter("dispatch_optin_transitions_total")
                .with_description("WhatsApp opt-in status changes")
                .build(),
        );

        // ========================================================================
        // Process metrics
        // ========================================================================
        let _ = CONFIG_RELOADS_TOTAL.set(
            meter.u64_counter("dispatch_config_reloads_total")
                .with_description("Configuration reloads by result")
                .build(),
        );
        let _ = SERVER_INFO.set(
            meter.i64_gauge("dispatch_server_info")
                .with_description("Server build information")
                .build(),
        );

        if let Some(g) = SERVER_INFO.get() {
            g.record(1, &[KeyValue::new("version", env!("CARGO_PKG_VERSION"))]);
        }
    }

    // ============================================================================
    // DISPATCH RECORDING FUNCTIONS
    // ============================================================================

    pub fn dispatch_submitted(channel: &str, vendor: &str) {
        if let Some(c) = DISPATCH_SUBMITTED_TOTAL.get() {
            c.add(1, &[kv("channel", channel), kv("vendor", vendor)]);
        }
    }

    pub fn dispatch_rejected(channel: &str, reason: &str) {
        if let Some(c) = DISPATCH_REJECTED_TOTAL.get() {
            c.add(1, &[kv("channel", channel), kv("reason", reason)]);
        }
    }

    pub fn dispatch_retry(channel: &str, vendor: &str) {
        if let Some(c) = DISPATCH_RETRIES_TOTAL.get() {
            c.add(1, &[kv("channel", channel), kv("vendor", vendor)]);
        }
    }

    pub fn dispatch_dead_letter(channel: &str) {
        if let Some(c) = DISPATCH_DEAD_LETTERS_TOTAL.get() {
            c.add(1, &[kv("channel", channel)]);
        }
    }

    pub fn dispatch_cancelled(channel: &str) {
        if let Some(c) = DISPATCH_CANCELLED_TOTAL.get() {
            c.add(1, &[kv("channel", channel)]);
        }
    }

    pub fn in_flight_set(count: usize) {
        if let Some(g) = DISPATCH_IN_FLIGHT.get() {
            g.record(count as i64, &[]);
        }
    }

    // ============================================================================
    // VENDOR RECORDING FUNCTIONS
    // ============================================================================

    /// Outcomes: `delivered`, `vendor_error`, `client_error`, `server_error`, `transport_error`.
    pub fn vendor_response(channel: &str, vendor: &str, outcome: &str, duration_secs: f64) {
        if let Some(c) = VENDOR_RESPONSES_TOTAL.get() {
            c.add(1, &[kv("channel", channel), kv("vendor", vendor), kv("outcome", outcome)]);
        }
        if let Some(h) = VENDOR_REQUEST_DURATION.get() {
            h.record(duration_secs, &[kv("channel", channel), kv("vendor", vendor)]);
        }
    }

    // ============================================================================
    // STORE RECORDING FUNCTIONS
    // ============================================================================

    pub fn store_op(op: &str, result: &str) {
        if let Some(c) = STORE_OPERATIONS_TOTAL.get() {
            c.add(1, &[kv("op", op), kv("result", result)]);
        }
    }

    pub fn version_conflict(op: &str) {
        if let Some(c) = STORE_VERSION_CONFLICTS_TOTAL.get() {
            c.add(1, &[kv("op", op)]);
        }
    }

    pub fn codec_error(field: &str) {
        if let Some(c) = STORE_CODEC_ERRORS_TOTAL.get() {
            c.add(1, &[kv("field", field)]);
        }
    }

    // ============================================================================
    // EVENT / WEBHOOK RECORDING FUNCTIONS
    // ============================================================================

    pub fn event_published(topic: &str, result: &str) {
        if let Some(c) = EVENTS_PUBLISHED_TOTAL.get() {
            c.add(1, &[kv("topic", topic), kv("result", result)]);
        }
    }

    pub fn derive_failure(channel: &str, reason: &str) {
        if let Some(c) = EVENTS_DERIVE_FAILURES_TOTAL.get() {
            c.add(1, &[kv("channel", channel), kv("reason", reason)]);
        }
    }

    pub fn webhook_event(channel: &str, state: &str) {
        if let Some(c) = WEBHOOK_EVENTS_TOTAL.get() {
            c.add(1, &[kv("channel", channel), kv("state", state)]);
        }
    }

    pub fn webhook_orphan(channel: &str, vendor: &str) {
        if let Some(c) = WEBHOOK_ORPHANS_TOTAL.get() {
            c.add(1, &[kv("channel", channel), kv("vendor", vendor)]);
        }
    }

    pub fn opt_in_transition(from: &str, to: &str) {
        if let Some(c) = OPTIN_TRANSITIONS_TOTAL.get() {
            c.add(1, &[kv("from", from), kv("to", to)]);
        }
    }

    // ============================================================================
    // PROCESS RECORDING FUNCTIONS
    // ============================================================================

    pub fn config_reload(success: bool) {
        if let Some(c) = CONFIG_RELOADS_TOTAL.get() {
            c.add(1, &[kv("result", if success { "success" } else { "failure" })]);
        }
    }

    // Helper function to create KeyValue
    #[inline]
    fn kv(key: &'static str, value: &str) -> KeyValue {
        KeyValue::new(key, value.to_string())
    }
}

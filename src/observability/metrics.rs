// observability/metrics.rs - Prometheus Metrics

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for metrics
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Address to expose metrics endpoint
    pub listen_addr: SocketAddr,

    /// Histogram buckets for request latency (in seconds)
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            latency_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ],
        }
    }
}

/// Handle to the Prometheus metrics exporter
#[derive(Clone)]
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Inbound request metrics
pub struct RequestMetrics;

impl RequestMetrics {
    pub const HANDLED_TOTAL: &'static str = "agency_requests_total";
    pub const LATENCY_SECONDS: &'static str = "agency_request_latency_seconds";
}

/// Routing metrics
pub struct RoutingMetrics;

impl RoutingMetrics {
    pub const ROUTED_TOTAL: &'static str = "agency_messages_routed_total";
    pub const UNRESOLVED_TOTAL: &'static str = "agency_unresolved_recipients_total";
}

/// Entity and message storage metrics
pub struct StorageMetrics;

impl StorageMetrics {
    pub const ENTITIES_CREATED_TOTAL: &'static str = "agency_entities_created_total";
    pub const MESSAGES_STORED_TOTAL: &'static str = "agency_messages_stored_total";
    pub const STATUS_UPDATES_TOTAL: &'static str = "agency_status_updates_total";
}

/// Notification and webhook metrics
pub struct NotificationMetrics;

impl NotificationMetrics {
    pub const LONG_POLLS_TOTAL: &'static str = "agency_long_polls_total";
    pub const WEBHOOKS_TOTAL: &'static str = "agency_webhooks_total";
}

/// Initialize the metrics system
///
/// Installs the Prometheus recorder and serves `/metrics` on the configured
/// address.
pub fn init_metrics(
    config: MetricsConfig,
) -> Result<MetricsHandle, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(RequestMetrics::LATENCY_SECONDS.into()),
            &config.latency_buckets,
        )?
        .install_recorder()?;
    let metrics_handle = MetricsHandle {
        handle: handle.clone(),
    };

    let listen_addr = config.listen_addr;
    let shared_handle = Arc::new(handle);

    tokio::spawn(async move {
        use axum::{Json, Router, routing::get};

        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let h = shared_handle.clone();
                    async move { h.render() }
                }),
            )
            .route(
                "/health",
                get(|| async { Json(serde_json::json!({ "status": "healthy" })) }),
            );

        match tokio::net::TcpListener::bind(listen_addr).await {
            Ok(listener) => {
                tracing::info!(addr = %listen_addr, "Metrics HTTP server started");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "Metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, addr = %listen_addr, "Failed to bind metrics server");
            }
        }
    });

    describe_counter!(
        RequestMetrics::HANDLED_TOTAL,
        "Inbound agency requests by outcome"
    );
    describe_histogram!(
        RequestMetrics::LATENCY_SECONDS,
        "Time to handle one inbound envelope in seconds"
    );
    describe_counter!(
        RoutingMetrics::ROUTED_TOTAL,
        "Messages routed to an entity"
    );
    describe_counter!(
        RoutingMetrics::UNRESOLVED_TOTAL,
        "Routing attempts whose recipient was not found"
    );
    describe_counter!(
        StorageMetrics::ENTITIES_CREATED_TOTAL,
        "Entities provisioned"
    );
    describe_counter!(
        StorageMetrics::MESSAGES_STORED_TOTAL,
        "Inbound messages stored for an agent-connection"
    );
    describe_counter!(
        StorageMetrics::STATUS_UPDATES_TOTAL,
        "Message status updates by outcome"
    );
    describe_counter!(
        NotificationMetrics::LONG_POLLS_TOTAL,
        "Notification long-polls by outcome"
    );
    describe_counter!(
        NotificationMetrics::WEBHOOKS_TOTAL,
        "Webhook deliveries by outcome"
    );

    tracing::info!(addr = %config.listen_addr, "Metrics initialized");

    Ok(metrics_handle)
}

// Recording functions

/// Record one inbound request
pub fn record_request(latency: Duration, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!(RequestMetrics::HANDLED_TOTAL, "outcome" => outcome).increment(1);
    histogram!(RequestMetrics::LATENCY_SECONDS, "outcome" => outcome).record(latency.as_secs_f64());
}

/// Record a message routed to an entity
pub fn record_message_routed(entity_type: &'static str) {
    counter!(RoutingMetrics::ROUTED_TOTAL, "entity_type" => entity_type).increment(1);
}

/// Record a routing attempt with no recipient
pub fn record_recipient_not_found() {
    counter!(RoutingMetrics::UNRESOLVED_TOTAL).increment(1);
}

/// Record an entity being provisioned
pub fn record_entity_created(entity_type: &'static str) {
    counter!(StorageMetrics::ENTITIES_CREATED_TOTAL, "entity_type" => entity_type).increment(1);
}

/// Record an inbound message stored
pub fn record_message_stored() {
    counter!(StorageMetrics::MESSAGES_STORED_TOTAL).increment(1);
}

/// Record the outcome of a status update
pub fn record_status_update(updated: usize, failed: usize) {
    counter!(StorageMetrics::STATUS_UPDATES_TOTAL, "outcome" => "updated").increment(updated as u64);
    counter!(StorageMetrics::STATUS_UPDATES_TOTAL, "outcome" => "failed").increment(failed as u64);
}

/// Record a finished long-poll
pub fn record_long_poll(notified: bool) {
    let outcome = if notified { "notified" } else { "timeout" };
    counter!(NotificationMetrics::LONG_POLLS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a webhook delivery attempt
pub fn record_webhook(delivered: bool) {
    let outcome = if delivered { "delivered" } else { "failed" };
    counter!(NotificationMetrics::WEBHOOKS_TOTAL, "outcome" => outcome).increment(1);
}

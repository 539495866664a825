// observability/mod.rs - Tracing and Metrics

//! Structured logging and Prometheus metrics for the agency.
//!
//! # Example
//!
//! ```ignore
//! use ssi_agency::observability::{init_metrics, init_tracing, MetricsConfig, TracingConfig};
//!
//! init_tracing(&TracingConfig::default())?;
//! let handle = init_metrics(MetricsConfig::default())?;
//! ```

mod metrics;
mod tracing_setup;

pub use metrics::{
    MetricsConfig, MetricsHandle, NotificationMetrics, RequestMetrics, RoutingMetrics,
    StorageMetrics, init_metrics, record_entity_created, record_long_poll, record_message_routed,
    record_message_stored, record_recipient_not_found, record_request, record_status_update,
    record_webhook,
};

pub use tracing_setup::{TracingConfig, TracingFormat, init_tracing};

use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::time::Duration;

/// Handles for every metric the engine emits.
///
/// Handles resolve against the recorder installed at construction time and are
/// no-ops when none is installed, so components can always create one.
pub struct CollectorMetrics {
    pub pages_fetched: Counter,
    pub items_fetched: Counter,
    pub fetch_failures: Counter,
    pub fetch_duration: Histogram,
    pub buffered_items: Gauge,
    pub items_dispatched: Counter,
    pub handler_failures: Counter,
    pub resources_created: Counter,
    pub resources_destroyed: Counter,
    pub leases_on_loan: Gauge,
    pub lease_duration: Histogram,
}

impl CollectorMetrics {
    pub fn new() -> Self {
        Self {
            pages_fetched: register_counter!("collector_pages_fetched_total"),
            items_fetched: register_counter!("collector_items_fetched_total"),
            fetch_failures: register_counter!("collector_fetch_failures_total"),
            fetch_duration: register_histogram!("collector_fetch_duration_seconds"),
            buffered_items: register_gauge!("collector_buffered_items"),
            items_dispatched: register_counter!("collector_items_dispatched_total"),
            handler_failures: register_counter!("collector_handler_failures_total"),
            resources_created: register_counter!("collector_resources_created_total"),
            resources_destroyed: register_counter!("collector_resources_destroyed_total"),
            leases_on_loan: register_gauge!("collector_leases_on_loan"),
            lease_duration: register_histogram!("collector_lease_duration_seconds"),
        }
    }

    pub fn record_page(&self, items: usize, duration: Duration) {
        self.pages_fetched.increment(1);
        self.items_fetched.increment(items as u64);
        self.fetch_duration.record(duration.as_secs_f64());
    }

    pub fn record_fetch_failure(&self, duration: Duration) {
        self.fetch_failures.increment(1);
        self.fetch_duration.record(duration.as_secs_f64());
    }

    pub fn set_buffered(&self, items: usize) {
        self.buffered_items.set(items as f64);
    }

    pub fn record_dispatch(&self) {
        self.items_dispatched.increment(1);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.increment(1);
    }

    pub fn record_resource_created(&self) {
        self.resources_created.increment(1);
    }

    pub fn record_resource_destroyed(&self) {
        self.resources_destroyed.increment(1);
    }

    pub fn record_lease_taken(&self) {
        self.leases_on_loan.increment(1.0);
    }

    pub fn record_lease_returned(&self, held_for: Duration) {
        self.leases_on_loan.decrement(1.0);
        self.lease_duration.record(held_for.as_secs_f64());
    }
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder; must run before any [`CollectorMetrics`] is built.
pub fn install_prometheus_recorder(
) -> Result<metrics_exporter_prometheus::PrometheusHandle, CollectorMetricsError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CollectorMetricsError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Metrics recorder installation failed: {0}")]
pub struct CollectorMetricsError(String);

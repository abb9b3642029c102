//! Telemetry instruments for the health registry

use opentelemetry::{
    metrics::{Gauge, Meter, UpDownCounter},
    KeyValue,
};

use super::ServingStatus;

/// Instruments recording health registry activity
///
/// Built once from a [`Meter`] and shared by the registry. Recording against
/// a meter with no provider behind it is a no-op, so the instruments are safe
/// to construct in tests.
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    status_gauge: Gauge<i64>,
    check_counter: UpDownCounter<i64>,
    watcher_counter: UpDownCounter<i64>,
}

impl HealthMetrics {
    /// Create the health instruments on the given meter
    pub fn new(meter: &Meter) -> Self {
        let status_gauge = meter
            .i64_gauge("grpc_health_status")
            .with_unit("{status}")
            .with_description(
                "Current health status of gRPC services (0=UNKNOWN, 1=SERVING, 2=NOT_SERVING, 3=SERVICE_UNKNOWN).",
            )
            .build();

        let check_counter = meter
            .i64_up_down_counter("grpc_health_checks_total")
            .with_unit("{count}")
            .with_description("Total number of health check requests received.")
            .build();

        let watcher_counter = meter
            .i64_up_down_counter("grpc_health_watchers")
            .with_unit("{count}")
            .with_description("Number of active health check watchers.")
            .build();

        Self {
            status_gauge,
            check_counter,
            watcher_counter,
        }
    }

    /// Record the current health status for a service
    pub(crate) fn record_status(&self, service: &str, status: ServingStatus) {
        self.status_gauge.record(
            status as i64,
            &[
                KeyValue::new("service", service.to_string()),
                KeyValue::new("status", status.to_string()),
            ],
        );
    }

    /// Record a health check request and whether the service was known
    pub(crate) fn record_check(&self, service: &str, status: ServingStatus, success: bool) {
        self.check_counter.add(
            1,
            &[
                KeyValue::new("service", service.to_string()),
                KeyValue::new("status", status.to_string()),
                KeyValue::new("success", success),
            ],
        );
    }

    /// Record a change in the number of active watchers for a service
    pub(crate) fn record_watcher_change(&self, service: &str, delta: i64) {
        self.watcher_counter
            .add(delta, &[KeyValue::new("service", service.to_string())]);
    }
}

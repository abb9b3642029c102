//! Health status registry with point-in-time checks and streaming watchers
//!
//! The registry maps service names to a [`ServingStatus`] and fans every
//! transition out to the watchers subscribed to that service. One write lock
//! serializes status transitions with watcher notification, so a subscriber
//! sees every transition in the order it was applied, with nothing skipped
//! and nothing duplicated. The empty service name is reserved for the overall
//! server status.

use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    task::{Context, Poll},
};

use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::error::{Error, Result};

mod metrics;

pub use metrics::HealthMetrics;

/// Health state reported for a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ServingStatus {
    /// Status has not been determined
    Unknown = 0,
    /// The service is healthy and accepting work
    Serving = 1,
    /// The service is known but currently unavailable
    NotServing = 2,
    /// The service is not registered with the registry
    ServiceUnknown = 3,
}

impl fmt::Display for ServingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::Serving => "SERVING",
            Self::NotServing => "NOT_SERVING",
            Self::ServiceUnknown => "SERVICE_UNKNOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Watcher {
    id: u64,
    sink: mpsc::UnboundedSender<ServingStatus>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    statuses: HashMap<String, ServingStatus>,
    watchers: HashMap<String, Vec<Watcher>>,
}

#[derive(Debug)]
struct Shared {
    inner: RwLock<RegistryInner>,
    metrics: Option<HealthMetrics>,
    next_watcher_id: AtomicU64,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().expect("health registry lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().expect("health registry lock poisoned")
    }

    fn deregister(&self, service: &str, id: u64) {
        let removed = {
            let mut inner = self.write();
            match inner.watchers.get_mut(service) {
                Some(watchers) => {
                    let before = watchers.len();
                    watchers.retain(|watcher| watcher.id != id);
                    let removed = watchers.len() != before;
                    if watchers.is_empty() {
                        inner.watchers.remove(service);
                    }
                    removed
                }
                None => false,
            }
        };

        // A shutdown may already have severed this watcher; only the path
        // that actually removed the entry records the change.
        if removed {
            if let Some(metrics) = &self.metrics {
                metrics.record_watcher_change(service, -1);
            }
            tracing::debug!(service, watcher_id = id, "health watch ended");
        }
    }
}

/// Registry of service health statuses
///
/// Cheap to clone; all clones share the same state. The surrounding process
/// updates statuses through [`set_status`](Self::set_status) while clients
/// query them through [`check`](Self::check) and [`watch`](Self::watch),
/// typically via the gRPC health service.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    shared: Arc<Shared>,
}

impl HealthRegistry {
    /// Create an empty registry without telemetry
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty registry that records to the given instruments
    pub fn with_metrics(metrics: HealthMetrics) -> Self {
        Self::build(Some(metrics))
    }

    fn build(metrics: Option<HealthMetrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(RegistryInner::default()),
                metrics,
                next_watcher_id: AtomicU64::new(0),
            }),
        }
    }

    /// Mark a service as serving
    pub fn set_serving(&self, service: &str) {
        self.set_status(service, ServingStatus::Serving);
    }

    /// Mark a service as not serving
    pub fn set_not_serving(&self, service: &str) {
        self.set_status(service, ServingStatus::NotServing);
    }

    /// Set the status for a service, creating the entry on first use
    ///
    /// Every watcher of the service is notified before this returns. A push
    /// to a watcher whose stream has gone away is logged and skipped; the
    /// watcher's own cancellation path removes the entry. Use the empty
    /// string for the overall server status.
    pub fn set_status(&self, service: &str, status: ServingStatus) {
        let mut inner = self.shared.write();

        let old = inner.statuses.insert(service.to_string(), status);
        tracing::debug!(service, status = %status, "health status updated");

        if let Some(metrics) = &self.shared.metrics {
            metrics.record_status(service, status);
        }

        if let Some(old) = old {
            if old != status {
                tracing::info!(
                    service,
                    old_status = %old,
                    new_status = %status,
                    "health status changed"
                );
            }
        }

        if let Some(watchers) = inner.watchers.get(service) {
            for watcher in watchers {
                if watcher.sink.send(status).is_err() {
                    tracing::warn!(
                        service,
                        watcher_id = watcher.id,
                        "failed to send health status to watcher"
                    );
                }
            }
        }
    }

    /// Return the current status of a service
    ///
    /// Fails with [`Error::NotFound`] if no status has been set for the
    /// service.
    pub fn check(&self, service: &str) -> Result<ServingStatus> {
        let inner = self.shared.read();

        match inner.statuses.get(service) {
            Some(status) => {
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_check(service, *status, true);
                }
                tracing::debug!(service, status = %status, "health check performed");
                Ok(*status)
            }
            None => {
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_check(service, ServingStatus::ServiceUnknown, false);
                }
                tracing::debug!(service, "health check for unknown service");
                Err(Error::NotFound(format!("service {service:?}")))
            }
        }
    }

    /// Subscribe to status changes for a service
    ///
    /// Fails with [`Error::NotFound`] if no status has been set for the
    /// service. On success the stream yields the current status immediately,
    /// then every subsequent transition in order. Dropping the stream cancels
    /// the subscription.
    pub fn watch(&self, service: &str) -> Result<StatusStream> {
        let mut inner = self.shared.write();

        let status = match inner.statuses.get(service) {
            Some(status) => *status,
            None => {
                tracing::debug!(service, "watch request for unknown service");
                return Err(Error::NotFound(format!("service {service:?}")));
            }
        };

        let id = self.shared.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let (sink, updates) = mpsc::unbounded_channel();

        // Queue the snapshot and register the watcher under the same write
        // lock so no transition can land between the two.
        let _ = sink.send(status);
        inner
            .watchers
            .entry(service.to_string())
            .or_default()
            .push(Watcher { id, sink });
        drop(inner);

        if let Some(metrics) = &self.shared.metrics {
            metrics.record_watcher_change(service, 1);
        }
        tracing::debug!(service, watcher_id = id, "health watch started");

        Ok(StatusStream {
            updates,
            _guard: WatchGuard {
                shared: Arc::downgrade(&self.shared),
                service: service.to_string(),
                id,
            },
        })
    }

    /// Drive every known service to `NOT_SERVING` and end all watch streams
    ///
    /// Each remaining watcher receives the final `NOT_SERVING` push before
    /// its stream is severed. Intended to be called once during server
    /// teardown; calling it again is a no-op over the already-empty watcher
    /// set.
    pub fn shutdown(&self) {
        let mut inner = self.shared.write();

        let services: Vec<String> = inner.statuses.keys().cloned().collect();
        for service in &services {
            inner
                .statuses
                .insert(service.clone(), ServingStatus::NotServing);

            if let Some(metrics) = &self.shared.metrics {
                metrics.record_status(service, ServingStatus::NotServing);
            }

            if let Some(watchers) = inner.watchers.get(service) {
                for watcher in watchers {
                    if watcher.sink.send(ServingStatus::NotServing).is_err() {
                        tracing::warn!(
                            service = %service,
                            watcher_id = watcher.id,
                            "failed to send shutdown status to watcher"
                        );
                    }
                }
            }
        }

        // Dropping the sinks ends every watch stream, letting in-flight
        // watch calls finish instead of holding graceful stop open.
        let severed: Vec<(String, Vec<Watcher>)> = inner.watchers.drain().collect();
        drop(inner);

        if let Some(metrics) = &self.shared.metrics {
            for (service, watchers) in &severed {
                metrics.record_watcher_change(service, -(watchers.len() as i64));
            }
        }

        tracing::info!("health registry shutdown complete");
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct WatchGuard {
    shared: Weak<Shared>,
    service: String,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.deregister(&self.service, self.id);
        }
    }
}

/// Stream of status updates for one watched service
///
/// Yields the subscription-time snapshot first, then every later transition.
/// Ends when the registry shuts down. Dropping it deregisters the watcher.
#[derive(Debug)]
pub struct StatusStream {
    updates: mpsc::UnboundedReceiver<ServingStatus>,
    _guard: WatchGuard,
}

impl Stream for StatusStream {
    type Item = ServingStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_stream::StreamExt;

    use super::*;

    #[test]
    fn test_serving_status_display() {
        assert_eq!(ServingStatus::Unknown.to_string(), "UNKNOWN");
        assert_eq!(ServingStatus::Serving.to_string(), "SERVING");
        assert_eq!(ServingStatus::NotServing.to_string(), "NOT_SERVING");
        assert_eq!(ServingStatus::ServiceUnknown.to_string(), "SERVICE_UNKNOWN");
    }

    #[test]
    fn test_check_unknown_service_not_found() {
        let registry = HealthRegistry::new();

        let err = registry.check("nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.to_string(), "Not found: service \"nope\"");
    }

    #[test]
    fn test_set_status_then_check() {
        let registry = HealthRegistry::new();

        registry.set_serving("db");
        assert_eq!(registry.check("db").unwrap(), ServingStatus::Serving);

        registry.set_not_serving("db");
        assert_eq!(registry.check("db").unwrap(), ServingStatus::NotServing);

        registry.set_status("db", ServingStatus::Unknown);
        assert_eq!(registry.check("db").unwrap(), ServingStatus::Unknown);
    }

    #[test]
    fn test_overall_status_uses_empty_key() {
        let registry = HealthRegistry::new();

        registry.set_serving("");
        assert_eq!(registry.check("").unwrap(), ServingStatus::Serving);
    }

    #[test]
    fn test_watch_unknown_service_not_found() {
        let registry = HealthRegistry::new();

        let err = registry.watch("ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // The rejected watch must leave no bookkeeping behind.
        let inner = registry.shared.read();
        assert!(inner.watchers.is_empty());
    }

    #[tokio::test]
    async fn test_watch_receives_snapshot_then_update() {
        let registry = HealthRegistry::new();
        registry.set_serving("db");

        let mut stream = registry.watch("db").unwrap();
        registry.set_not_serving("db");

        assert_eq!(stream.next().await, Some(ServingStatus::Serving));
        assert_eq!(stream.next().await, Some(ServingStatus::NotServing));

        // Exactly two pushes: the snapshot and the single transition.
        let extra = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(extra.is_err());

        assert_eq!(registry.check("db").unwrap(), ServingStatus::NotServing);
    }

    #[tokio::test]
    async fn test_watch_delivers_updates_in_order() {
        let registry = HealthRegistry::new();
        registry.set_status("api", ServingStatus::Unknown);

        let mut stream = registry.watch("api").unwrap();
        registry.set_serving("api");
        registry.set_not_serving("api");
        registry.set_serving("api");

        assert_eq!(stream.next().await, Some(ServingStatus::Unknown));
        assert_eq!(stream.next().await, Some(ServingStatus::Serving));
        assert_eq!(stream.next().await, Some(ServingStatus::NotServing));
        assert_eq!(stream.next().await, Some(ServingStatus::Serving));
    }

    #[tokio::test]
    async fn test_multiple_watchers_receive_same_updates() {
        let registry = HealthRegistry::new();
        registry.set_serving("db");

        let mut first = registry.watch("db").unwrap();
        let mut second = registry.watch("db").unwrap();
        registry.set_not_serving("db");

        for stream in [&mut first, &mut second] {
            assert_eq!(stream.next().await, Some(ServingStatus::Serving));
            assert_eq!(stream.next().await, Some(ServingStatus::NotServing));
        }
    }

    #[test]
    fn test_dropping_stream_deregisters_watcher() {
        let registry = HealthRegistry::new();
        registry.set_serving("db");

        let stream = registry.watch("db").unwrap();
        drop(stream);

        let inner = registry.shared.read();
        assert!(inner.watchers.is_empty());
    }

    #[test]
    fn test_closed_sink_is_left_for_guard_cleanup() {
        let registry = HealthRegistry::new();
        registry.set_serving("db");

        let mut stream = registry.watch("db").unwrap();
        stream.updates.close();

        // The failed push is logged but the entry stays until the stream
        // itself goes away.
        registry.set_not_serving("db");
        {
            let inner = registry.shared.read();
            assert_eq!(inner.watchers.get("db").map(Vec::len), Some(1));
        }

        drop(stream);
        let inner = registry.shared.read();
        assert!(inner.watchers.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_then_ends_streams() {
        let registry = HealthRegistry::new();
        registry.set_serving("db");
        registry.set_serving("cache");

        let mut stream = registry.watch("db").unwrap();
        registry.shutdown();

        assert_eq!(stream.next().await, Some(ServingStatus::Serving));
        assert_eq!(stream.next().await, Some(ServingStatus::NotServing));
        assert_eq!(stream.next().await, None);

        assert_eq!(registry.check("db").unwrap(), ServingStatus::NotServing);
        assert_eq!(registry.check("cache").unwrap(), ServingStatus::NotServing);
    }

    #[test]
    fn test_shutdown_twice_is_harmless() {
        let registry = HealthRegistry::new();
        registry.set_serving("db");

        registry.shutdown();
        registry.shutdown();

        assert_eq!(registry.check("db").unwrap(), ServingStatus::NotServing);
    }

    #[test]
    fn test_concurrent_updates_across_services() {
        let registry = HealthRegistry::new();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let service = format!("service-{i}");
                    for _ in 0..100 {
                        registry.set_serving(&service);
                        registry.set_not_serving(&service);
                    }
                    registry.set_serving(&service);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..8 {
            let service = format!("service-{i}");
            assert_eq!(registry.check(&service).unwrap(), ServingStatus::Serving);
        }
    }

    #[test]
    fn test_registry_with_metrics_smoke() {
        let meter = opentelemetry::global::meter("vigil-service-test");
        let registry = HealthRegistry::with_metrics(HealthMetrics::new(&meter));

        registry.set_serving("db");
        assert_eq!(registry.check("db").unwrap(), ServingStatus::Serving);
        assert!(registry.check("ghost").is_err());

        let stream = registry.watch("db").unwrap();
        drop(stream);
        registry.shutdown();
    }
}

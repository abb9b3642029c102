//! HTTP server with a cached liveness endpoint and graceful shutdown

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    extract::{MatchedPath, Request, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    server::{AbortableListener, Listener, ServerBase, SHUTDOWN_TIMEOUT},
};

const LIVENESS_CACHE_TTL: Duration = Duration::from_secs(1);

/// Payload served by the liveness endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub status: &'static str,
    pub service: String,
    pub version: String,
    pub checked_at: DateTime<Utc>,
}

/// Cached liveness probe
///
/// A lighter-weight up/down signal than the gRPC health registry. Results
/// are cached for one second so aggressive probing stays cheap.
#[derive(Debug, Clone)]
pub struct Liveness {
    service: String,
    version: String,
    cached: Arc<Mutex<Option<(Instant, LivenessReport)>>>,
}

impl Liveness {
    fn new(config: &ServerConfig) -> Self {
        Self {
            service: config.service_name.clone(),
            version: config.version.clone(),
            cached: Arc::new(Mutex::new(None)),
        }
    }

    fn probe(&self) -> LivenessReport {
        self.probe_with_ttl(LIVENESS_CACHE_TTL)
    }

    fn probe_with_ttl(&self, ttl: Duration) -> LivenessReport {
        let mut cached = self.cached.lock().expect("liveness cache lock poisoned");
        if let Some((at, report)) = &*cached {
            if at.elapsed() < ttl {
                return report.clone();
            }
        }

        let report = LivenessReport {
            status: "up",
            service: self.service.clone(),
            version: self.version.clone(),
            checked_at: Utc::now(),
        };
        *cached = Some((Instant::now(), report.clone()));
        report
    }
}

async fn health(State(liveness): State<Liveness>) -> Json<LivenessReport> {
    Json(liveness.probe())
}

/// HTTP server wired to the shared lifecycle machinery
///
/// Comes with a `GET /health` liveness endpoint; application routes are
/// merged in builder-style before serving starts. Every request runs inside
/// a traced span and behind panic recovery.
pub struct HttpServer {
    base: ServerBase,
    router: Mutex<Option<Router>>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("config", self.base.config())
            .finish_non_exhaustive()
    }
}

impl HttpServer {
    /// Validate the config, bind the listener, and prepare the router
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let liveness = Liveness::new(&config);
        let base = ServerBase::bind(config).await?;

        let router = Router::new()
            .route("/health", get(health))
            .with_state(liveness);

        Ok(Self {
            base,
            router: Mutex::new(Some(router)),
        })
    }

    /// Merge application routes into the server
    ///
    /// Must be called before [`listen_and_serve`](Self::listen_and_serve).
    pub fn with_routes(self, routes: Router) -> Self {
        {
            let mut router = self.router.lock().expect("http router lock poisoned");
            if let Some(inner) = router.take() {
                *router = Some(inner.merge(routes));
            }
        }
        self
    }

    /// Bound TCP address, available until serving starts
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.base.local_addr()
    }

    /// Accept connections until the serve loop fails or `cancel` fires
    ///
    /// The accept loop runs on its own task. Cancellation returns cleanly
    /// without stopping the server; [`close`](Self::close) remains
    /// responsible for shutdown. A second call fails with
    /// [`Error::AlreadyServing`].
    pub async fn listen_and_serve(&self, cancel: CancellationToken) -> Result<()> {
        let router = self
            .router
            .lock()
            .expect("http router lock poisoned")
            .take()
            .ok_or(Error::AlreadyServing)?;
        let listener = self.base.take_listener()?;
        let shutdown = self.base.graceful_signal();
        let kill = self.base.force_signal();

        // Route-layer middleware runs after routing, so the span can carry
        // the matched route. The panic recovery layer goes on last, making
        // it outermost.
        let app = router
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request| {
                    let path = request
                        .extensions()
                        .get::<MatchedPath>()
                        .map(MatchedPath::as_str);
                    tracing::info_span!("http_request", method = %request.method(), path)
                }),
            )
            .layer(CatchPanicLayer::new());

        let serve = async move {
            let result = match listener {
                Listener::Tcp(listener) => {
                    axum::serve(AbortableListener::new(listener, kill), app)
                        .with_graceful_shutdown(shutdown)
                        .await
                }
                #[cfg(unix)]
                Listener::Unix(listener) => {
                    axum::serve(AbortableListener::new(listener, kill), app)
                        .with_graceful_shutdown(shutdown)
                        .await
                }
            };
            if let Err(err) = &result {
                tracing::error!(error = %err, "http server terminated");
            }
            result.map_err(Error::from)
        };

        let handle = self.base.spawn_serve(serve);
        tracing::info!("http server started");
        self.base.await_serve(cancel, handle).await
    }

    /// Shut the server down
    ///
    /// Stops accepting connections and waits up to 20 seconds for in-flight
    /// requests before forcing the stop.
    pub async fn close(&self) {
        self.close_with_deadline(SHUTDOWN_TIMEOUT).await;
    }

    async fn close_with_deadline(&self, grace: Duration) {
        if !self.base.close_with_deadline(grace).await {
            tracing::warn!("http server graceful shutdown timeout, forcing stop");
        }
        tracing::info!("http server closed");
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_liveness_probe_is_cached() {
        let liveness = Liveness::new(&ServerConfig::default());

        let first = liveness.probe();
        assert_eq!(first.status, "up");
        assert_eq!(first.service, "vigil-service");

        let second = liveness.probe();
        assert_eq!(second.checked_at, first.checked_at);

        std::thread::sleep(Duration::from_millis(60));
        let third = liveness.probe_with_ttl(Duration::from_millis(50));
        assert_ne!(third.checked_at, first.checked_at);
    }

    #[tokio::test]
    async fn test_health_route_returns_liveness_report() {
        let liveness = Liveness::new(&ServerConfig::default());
        let app = Router::new()
            .route("/health", get(health))
            .with_state(liveness);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["status"], "up");
        assert_eq!(report["service"], "vigil-service");
        assert_eq!(report["version"], "0.0.1");
    }

    #[tokio::test]
    async fn test_serve_health_endpoint() {
        let server = Arc::new(HttpServer::new(test_config()).await.unwrap());
        let addr = server.local_addr().unwrap();

        let serve = Arc::clone(&server);
        tokio::spawn(async move { serve.listen_and_serve(CancellationToken::new()).await });

        let response = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let report: serde_json::Value = response.json().await.unwrap();
        assert_eq!(report["status"], "up");

        server.close().await;
    }

    #[tokio::test]
    async fn test_merged_routes_are_served() {
        let server = HttpServer::new(test_config())
            .await
            .unwrap()
            .with_routes(Router::new().route("/ping", get(|| async { "pong" })));
        let server = Arc::new(server);
        let addr = server.local_addr().unwrap();

        let serve = Arc::clone(&server);
        tokio::spawn(async move { serve.listen_and_serve(CancellationToken::new()).await });

        let response = reqwest::get(format!("http://{addr}/ping")).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "pong");

        server.close().await;
    }

    async fn boom() -> &'static str {
        panic!("handler exploded");
    }

    #[tokio::test]
    async fn test_panicking_route_does_not_kill_server() {
        let server = HttpServer::new(test_config())
            .await
            .unwrap()
            .with_routes(Router::new().route("/boom", get(boom)));
        let server = Arc::new(server);
        let addr = server.local_addr().unwrap();

        let serve = Arc::clone(&server);
        tokio::spawn(async move { serve.listen_and_serve(CancellationToken::new()).await });

        let response = reqwest::get(format!("http://{addr}/boom")).await.unwrap();
        assert_eq!(
            response.status(),
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        );

        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        server.close().await;
    }

    #[tokio::test]
    async fn test_listen_and_serve_twice_fails() {
        let server = Arc::new(HttpServer::new(test_config()).await.unwrap());

        let serve = Arc::clone(&server);
        let cancel = CancellationToken::new();
        let watch = cancel.clone();
        tokio::spawn(async move { serve.listen_and_serve(watch).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = server
            .listen_and_serve(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyServing));

        cancel.cancel();
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_forces_stop_with_hanging_request() {
        let server = HttpServer::new(test_config())
            .await
            .unwrap()
            .with_routes(Router::new().route(
                "/stall",
                get(|| async {
                    std::future::pending::<()>().await;
                }),
            ));
        let server = Arc::new(server);
        let addr = server.local_addr().unwrap();

        let serve = Arc::clone(&server);
        tokio::spawn(async move { serve.listen_and_serve(CancellationToken::new()).await });

        let hang =
            tokio::spawn(async move { reqwest::get(format!("http://{addr}/stall")).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        server.close_with_deadline(Duration::from_millis(200)).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The stalled request's connection is severed by the forced stop,
        // so the client sees an error instead of a response that never
        // arrives.
        let outcome = tokio::time::timeout(Duration::from_secs(2), hang)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_err());
    }
}

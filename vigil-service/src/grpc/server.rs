//! gRPC server implementation

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::server::NamedService;
use tonic::transport::{server::Router, Server};
use tower::layer::util::{Identity, Stack};

#[cfg(unix)]
use tokio_stream::wrappers::UnixListenerStream;

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    grpc::{health::HealthService, middleware::GrpcRecoverLayer},
    health::{HealthRegistry, ServingStatus},
    server::{AbortableIo, Listener, ServerBase, SHUTDOWN_TIMEOUT},
};

/// Service name of the server itself in the health registry
///
/// Makes call sites more readable than a bare empty string.
pub const OVERALL: &str = "";

type GrpcRouter = Router<Stack<GrpcRecoverLayer, Identity>>;

/// gRPC server with health checking and panic containment
///
/// Binds its listener at construction, registers the health registry under
/// the standard health checking protocol, and wraps every routed call in
/// [`GrpcRecoverLayer`]. Additional services are added builder-style before
/// serving starts.
pub struct GrpcServer {
    base: ServerBase,
    registry: HealthRegistry,
    router: Mutex<Option<GrpcRouter>>,
}

impl std::fmt::Debug for GrpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcServer")
            .field("config", self.base.config())
            .finish_non_exhaustive()
    }
}

impl GrpcServer {
    /// Validate the config, bind the listener, and prepare the router
    ///
    /// The overall server status is set to `SERVING` in the registry as part
    /// of construction.
    pub async fn new(config: ServerConfig, registry: HealthRegistry) -> Result<Self> {
        let base = ServerBase::bind(config).await?;

        let router = Server::builder()
            .layer(GrpcRecoverLayer::new())
            .add_service(HealthService::new(registry.clone()).into_server());

        registry.set_status(OVERALL, ServingStatus::Serving);

        Ok(Self {
            base,
            registry,
            router: Mutex::new(Some(router)),
        })
    }

    /// Add a gRPC service to the server
    ///
    /// Must be called before [`listen_and_serve`](Self::listen_and_serve).
    pub fn add_service<S>(self, service: S) -> Self
    where
        S: tower::Service<
                http::Request<tonic::body::Body>,
                Response = http::Response<tonic::body::Body>,
                Error = std::convert::Infallible,
            > + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        {
            let mut router = self.router.lock().expect("grpc router lock poisoned");
            if let Some(inner) = router.take() {
                *router = Some(inner.add_service(service));
            }
        }
        self
    }

    /// Health registry backing this server's health service
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Set the health status for a service
    ///
    /// Use [`OVERALL`] for the overall server health status.
    pub fn set_health_status(&self, service: &str, status: ServingStatus) {
        self.registry.set_status(service, status);
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
            .expect("grpc router lock poisoned")
            .take()
            .ok_or(Error::AlreadyServing)?;
        let listener = self.base.take_listener()?;
        let shutdown = self.base.graceful_signal();
        let kill = self.base.force_signal();

        let serve = async move {
            let result = match listener {
                Listener::Tcp(listener) => {
                    let incoming = TcpListenerStream::new(listener)
                        .map(move |conn| conn.map(|sock| AbortableIo::new(sock, kill.clone())));
                    router.serve_with_incoming_shutdown(incoming, shutdown).await
                }
                #[cfg(unix)]
                Listener::Unix(listener) => {
                    let incoming = UnixListenerStream::new(listener)
                        .map(move |conn| conn.map(|sock| AbortableIo::new(sock, kill.clone())));
                    router.serve_with_incoming_shutdown(incoming, shutdown).await
                }
            };
            if let Err(err) = &result {
                tracing::error!(error = %err, "grpc server terminated");
            }
            result.map_err(Error::from)
        };

        let handle = self.base.spawn_serve(serve);
        tracing::info!("grpc server started");
        self.base.await_serve(cancel, handle).await
    }

    /// Shut the server down
    ///
    /// Drives every registry entry to `NOT_SERVING` and ends all watch
    /// streams, then waits up to 20 seconds for in-flight calls before
    /// forcing the stop.
    pub async fn close(&self) {
        self.close_with_deadline(SHUTDOWN_TIMEOUT).await;
    }

    async fn close_with_deadline(&self, grace: Duration) {
        self.registry.shutdown();

        if self.base.close_with_deadline(grace).await {
            tracing::info!("grpc server stopped gracefully");
        } else {
            tracing::warn!("grpc server graceful shutdown timeout, forcing stop");
        }

        tracing::info!("grpc server shutdown complete");
    }
}

//! # vigil-service
//!
//! Health-checked gRPC and HTTP serving for long-running backend services.
//!
//! ## Features
//!
//! - **gRPC health checking**: the full gRPC Health Checking Protocol with
//!   per-service statuses, unary checks, and streaming watches
//! - **HTTP liveness**: a cached `GET /health` endpoint for load balancer probes
//! - **Panic recovery**: a handler that panics answers `INTERNAL` / `500`
//!   instead of taking the process down
//! - **Graceful shutdown**: in-flight requests drain within a 20 second
//!   deadline, then the server stops regardless
//! - **Unix sockets**: both servers accept a socket path in place of TCP
//! - **Observability**: structured logs via `tracing` and optional
//!   OpenTelemetry metrics for health activity
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use vigil_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration
//!     let config = ServerConfig::load()?;
//!
//!     // Initialize tracing
//!     init_tracing(&config)?;
//!
//!     // Shared health registry
//!     let registry = HealthRegistry::new();
//!     registry.set_serving("mypkg.v1.MyService");
//!
//!     // gRPC server with health checking and panic recovery
//!     let grpc = Arc::new(GrpcServer::new(config.clone(), registry.clone()).await?);
//!
//!     // HTTP server with the liveness endpoint on another port
//!     let mut http_config = config;
//!     http_config.port = 8081;
//!     let http = Arc::new(
//!         HttpServer::new(http_config)
//!             .await?
//!             .with_routes(Router::new().route("/hello", get(|| async { "hi" }))),
//!     );
//!
//!     let cancel = CancellationToken::new();
//!
//!     let serve = Arc::clone(&grpc);
//!     let token = cancel.clone();
//!     tokio::spawn(async move { serve.listen_and_serve(token).await });
//!
//!     let serve = Arc::clone(&http);
//!     let token = cancel.clone();
//!     tokio::spawn(async move { serve.listen_and_serve(token).await });
//!
//!     // ... run the application ...
//!
//!     cancel.cancel();
//!     grpc.close().await;
//!     http.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod grpc;
pub mod health;
pub mod http;
pub mod observability;
mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ConfigError, ServerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::grpc::{GrpcServer, HealthService, OVERALL};
    pub use crate::health::{HealthMetrics, HealthRegistry, ServingStatus, StatusStream};
    pub use crate::http::{HttpServer, LivenessReport};
    pub use crate::observability::init_tracing;

    // Re-export tonic types for service implementations
    pub use tonic::{Code, Request, Response, Status};

    // Re-export the cancellation token the serve loops take
    pub use tokio_util::sync::CancellationToken;

    // Re-export axum types for route building
    pub use axum::{
        routing::{delete, get, patch, post, put},
        Json, Router,
    };

    // Re-export tracing macros
    pub use tracing::{debug, error, info, trace, warn};

    // Re-export tokio for async runtime
    pub use tokio;
}

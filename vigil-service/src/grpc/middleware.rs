//! gRPC middleware
//!
//! Tower middleware installed around every routed gRPC call.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use http::{header::CONTENT_TYPE, HeaderValue};
use tonic::Code;
use tower::{Layer, Service};

/// Panic containment middleware for gRPC handlers
///
/// A panic raised inside a handler is caught at this boundary, logged with
/// the call's method path and a captured backtrace, and converted into an
/// `Internal` status for that one call. The server and every other in-flight
/// call keep running. Sitting in the transport stack, the same wrapper
/// covers unary and streaming handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcRecoverLayer;

impl GrpcRecoverLayer {
    /// Create a new panic containment layer
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for GrpcRecoverLayer {
    type Service = GrpcRecoverService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcRecoverService { inner }
    }
}

/// Panic containment service implementation
#[derive(Debug, Clone)]
pub struct GrpcRecoverService<S> {
    inner: S,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for GrpcRecoverService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<tonic::body::Body>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let method = req.uri().path().to_string();

        Box::pin(async move {
            // The dispatch itself runs inside the guarded future so a panic
            // thrown before the handler's first await is contained too.
            let call = std::panic::AssertUnwindSafe(async move { inner.call(req).await });

            match call.catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let backtrace = std::backtrace::Backtrace::force_capture();
                    tracing::error!(
                        method = %method,
                        panic = %panic_message(panic.as_ref()),
                        stack = %backtrace,
                        "panic recovered in gRPC handler"
                    );
                    Ok(internal_error_response())
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Trailers-only `Internal` response in the gRPC wire format
fn internal_error_response() -> http::Response<tonic::body::Body> {
    let mut response = http::Response::new(tonic::body::Body::empty());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    response
        .headers_mut()
        .insert("grpc-status", HeaderValue::from(Code::Internal as i32));
    response
        .headers_mut()
        .insert("grpc-message", HeaderValue::from_static("internal server error"));
    response
}

//! gRPC server support
//!
//! Provides a tonic server wired to the shared lifecycle machinery, with
//! panic containment around every routed call and the standard gRPC health
//! checking protocol backed by the crate's health registry.
//! See: https://github.com/grpc/grpc/blob/master/doc/health-checking.md

pub mod health;
pub mod middleware;
pub mod server;

// Re-exports
pub use health::HealthService;
pub use middleware::{GrpcRecoverLayer, GrpcRecoverService};
pub use server::{GrpcServer, OVERALL};

// Re-export tonic types for convenience
pub use tonic::{Code, Request, Response, Status};

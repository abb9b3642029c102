//! gRPC health check service
//!
//! Implements the standard gRPC health checking protocol on top of
//! [`HealthRegistry`], translating between the registry's status type and
//! the protocol's wire representation.

use std::pin::Pin;

use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tonic_health::pb::{
    health_check_response::ServingStatus as PbServingStatus,
    health_server::{Health, HealthServer},
    HealthCheckRequest, HealthCheckResponse,
};

use crate::health::{HealthRegistry, ServingStatus};

impl From<ServingStatus> for PbServingStatus {
    fn from(status: ServingStatus) -> Self {
        match status {
            ServingStatus::Unknown => PbServingStatus::Unknown,
            ServingStatus::Serving => PbServingStatus::Serving,
            ServingStatus::NotServing => PbServingStatus::NotServing,
            ServingStatus::ServiceUnknown => PbServingStatus::ServiceUnknown,
        }
    }
}

fn health_response(status: ServingStatus) -> HealthCheckResponse {
    HealthCheckResponse {
        status: PbServingStatus::from(status).into(),
    }
}

/// Health check service backed by a [`HealthRegistry`]
///
/// `Check` answers from the registry's current state; `Watch` opens a stream
/// that yields the status at subscription time followed by every later
/// transition. Both fail with `NotFound` for services the registry has never
/// seen.
#[derive(Debug, Clone)]
pub struct HealthService {
    registry: HealthRegistry,
}

impl HealthService {
    /// Create a health service over the given registry
    pub fn new(registry: HealthRegistry) -> Self {
        Self { registry }
    }

    /// Wrap this service in the generated transport server
    pub fn into_server(self) -> HealthServer<Self> {
        HealthServer::new(self)
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;

        match self.registry.check(&service) {
            Ok(status) => Ok(Response::new(health_response(status))),
            Err(_) => Err(Status::not_found(format!("service {service:?} not found"))),
        }
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let service = request.into_inner().service;

        match self.registry.watch(&service) {
            Ok(updates) => {
                let responses = updates.map(|status| Ok(health_response(status)));
                Ok(Response::new(Box::pin(responses)))
            }
            Err(_) => Err(Status::not_found(format!("service {service:?} not found"))),
        }
    }
}

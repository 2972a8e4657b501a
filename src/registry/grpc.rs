use super::{Operation, RegistryClient, TransportKind};
use crate::api::ServiceInstance;
use crate::error::{CallError, RegistrarError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, warn};

pub mod pb {
    tonic::include_proto!("registry.v1");
}

use pb::service_registry_client::ServiceRegistryClient;

/// Registry client for the `registry.v1.ServiceRegistry` gRPC service.
///
/// The channel is created lazily, so construction only fails on a malformed
/// address. Connection problems surface per call as [`CallError::Unreachable`].
pub struct GrpcRegistryClient {
    address: String,
    client: Mutex<Option<ServiceRegistryClient<Channel>>>,
}

impl GrpcRegistryClient {
    pub fn new(registry_address: &str, timeout: Duration) -> Result<Self, RegistrarError> {
        let address = if registry_address.contains("://") {
            registry_address.to_string()
        } else {
            format!("http://{}", registry_address)
        };

        let endpoint = Endpoint::from_shared(address.clone())
            .map_err(|e| RegistrarError::transport(TransportKind::Grpc, e))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .tcp_keepalive(Some(Duration::from_secs(30)));
        let channel = endpoint.connect_lazy();

        Ok(Self {
            address,
            client: Mutex::new(Some(ServiceRegistryClient::new(channel))),
        })
    }

    async fn handle(&self, operation: Operation) -> Result<ServiceRegistryClient<Channel>, CallError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| CallError::unreachable(operation, "registry client is closed"))
    }
}

fn status_error(operation: Operation, status: Status) -> CallError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
            CallError::unreachable(operation, status.message())
        }
        code => CallError::rejected(operation, format!("{:?}: {}", code, status.message())),
    }
}

fn acknowledge(operation: Operation, success: bool, message: String) -> Result<(), CallError> {
    if success {
        Ok(())
    } else {
        Err(CallError::rejected(
            operation,
            format!("service registry response: {}", message),
        ))
    }
}

impl From<&ServiceInstance> for pb::ServiceInstance {
    fn from(instance: &ServiceInstance) -> Self {
        pb::ServiceInstance {
            id: instance.id.clone(),
            service_name: instance.service_name.clone(),
            host: instance.host.clone(),
            port: i32::from(instance.port),
            url: instance.url.clone(),
            health_path: instance.health_path.clone(),
        }
    }
}

impl TryFrom<pb::ServiceInstance> for ServiceInstance {
    type Error = std::num::TryFromIntError;

    fn try_from(instance: pb::ServiceInstance) -> Result<Self, Self::Error> {
        Ok(ServiceInstance {
            port: u16::try_from(instance.port)?,
            id: instance.id,
            service_name: instance.service_name,
            host: instance.host,
            url: instance.url,
            health_path: instance.health_path,
        })
    }
}

#[async_trait]
impl RegistryClient for GrpcRegistryClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Grpc
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<(), CallError> {
        let op = Operation::Register;
        let request = pb::RegisterServiceRequest {
            instance: Some(instance.into()),
        };
        let resp = self
            .handle(op)
            .await?
            .register_service(request)
            .await
            .map_err(|s| status_error(op, s))?
            .into_inner();
        acknowledge(op, resp.success, resp.message)
    }

    async fn send_heartbeat(&self, instance_id: &str) -> Result<(), CallError> {
        let op = Operation::Heartbeat;
        let request = pb::SendHeartbeatRequest {
            instance_id: instance_id.to_string(),
        };
        let resp = self
            .handle(op)
            .await?
            .send_heartbeat(request)
            .await
            .map_err(|s| status_error(op, s))?
            .into_inner();
        acknowledge(op, resp.success, resp.message)
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), CallError> {
        let op = Operation::Deregister;
        let request = pb::DeregisterServiceRequest {
            instance_id: instance_id.to_string(),
        };
        let resp = self
            .handle(op)
            .await?
            .deregister_service(request)
            .await
            .map_err(|s| status_error(op, s))?
            .into_inner();
        acknowledge(op, resp.success, resp.message)
    }

    async fn list_healthy_instances(
        &self,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>, CallError> {
        let op = Operation::ListHealthy;
        let request = pb::GetHealthyServicesRequest {
            service_name: service_name.to_string(),
        };
        let resp = self
            .handle(op)
            .await?
            .get_healthy_services(request)
            .await
            .map_err(|s| status_error(op, s))?
            .into_inner();

        let mut instances = Vec::with_capacity(resp.instances.len());
        for instance in resp.instances {
            let id = instance.id.clone();
            match ServiceInstance::try_from(instance) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!("Skipping instance {} with invalid port: {}", id, e),
            }
        }
        Ok(instances)
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            debug!("gRPC registry channel to {} closed", self.address);
        }
    }
}

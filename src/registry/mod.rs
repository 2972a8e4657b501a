pub mod etcd;
pub mod grpc;
pub mod http;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

use crate::api::ServiceInstance;
use crate::config::RegistrarConfig;
use crate::error::{CallError, RegistrarError};

/// Protocol used to talk to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Http,
    Grpc,
    Etcd,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Grpc => "grpc",
            TransportKind::Etcd => "etcd",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = RegistrarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "grpc" => Ok(TransportKind::Grpc),
            "etcd" => Ok(TransportKind::Etcd),
            other => Err(RegistrarError::Configuration(format!(
                "unsupported registry client type '{}', must be 'http', 'grpc' or 'etcd'",
                other
            ))),
        }
    }
}

/// Registry operation, used for error context and call outcome signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Register,
    Heartbeat,
    Deregister,
    ListHealthy,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Register => "register",
            Operation::Heartbeat => "heartbeat",
            Operation::Deregister => "deregister",
            Operation::ListHealthy => "list_healthy_instances",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client side of a service registry.
///
/// Implementations do not enforce deadlines themselves beyond their transport
/// timeout: callers bound each call and cancel it by dropping the future.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Announce the instance to the registry
    async fn register(&self, instance: &ServiceInstance) -> Result<(), CallError>;

    /// Refresh the liveness of a registered instance
    async fn send_heartbeat(&self, instance_id: &str) -> Result<(), CallError>;

    /// Remove the instance from the registry
    async fn deregister(&self, instance_id: &str) -> Result<(), CallError>;

    /// Query the healthy instances of a service, when the transport supports it
    async fn list_healthy_instances(
        &self,
        _service_name: &str,
    ) -> Result<Vec<ServiceInstance>, CallError> {
        Err(CallError::Unsupported {
            operation: Operation::ListHealthy,
            transport: self.kind(),
        })
    }

    /// Release the underlying connection. Safe to call more than once.
    async fn close(&self);
}

/// Build the client selected by `config.transport`.
pub async fn connect(config: &RegistrarConfig) -> Result<Box<dyn RegistryClient>, RegistrarError> {
    let client: Box<dyn RegistryClient> = match config.transport {
        TransportKind::Http => Box::new(http::HttpRegistryClient::new(
            &config.registry_address,
            config.call_timeout,
        )?),
        TransportKind::Grpc => Box::new(grpc::GrpcRegistryClient::new(
            &config.registry_address,
            config.call_timeout,
        )?),
        TransportKind::Etcd => {
            let endpoints = config
                .registry_address
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
            Box::new(etcd::EtcdRegistryClient::new(endpoints, config.heartbeat_interval).await?)
        }
    };
    Ok(client)
}

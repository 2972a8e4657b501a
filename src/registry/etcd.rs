use super::{Operation, RegistryClient, TransportKind};
use crate::api::ServiceInstance;
use crate::error::{CallError, RegistrarError};
use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions};
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::Code;
use tracing::{debug, info, warn};

const KEY_PREFIX: &str = "/registrar/services";
const MIN_LEASE_TTL_SECS: i64 = 5;

struct Lease {
    id: i64,
    key: String,
}

/// Registry client backed by etcd leases.
///
/// Registration writes the descriptor under a lease, a heartbeat is one lease
/// keep-alive, and deregistration deletes the key and revokes the lease.
pub struct EtcdRegistryClient {
    client: Mutex<Option<Client>>,
    lease: Mutex<Option<Lease>>,
    lease_ttl: i64,
}

impl EtcdRegistryClient {
    pub async fn new(endpoints: Vec<String>, heartbeat_interval: Duration) -> Result<Self, RegistrarError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| RegistrarError::transport(TransportKind::Etcd, e))?;

        Ok(Self {
            client: Mutex::new(Some(client)),
            lease: Mutex::new(None),
            lease_ttl: lease_ttl_for(heartbeat_interval),
        })
    }

    fn service_key(service_name: &str, instance_id: &str) -> String {
        format!("{}/{}/{}", KEY_PREFIX, service_name, instance_id)
    }

    async fn handle(&self, operation: Operation) -> Result<Client, CallError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| CallError::unreachable(operation, "registry client is closed"))
    }
}

/// A lease must outlive a few missed heartbeats before etcd drops the key.
fn lease_ttl_for(heartbeat_interval: Duration) -> i64 {
    let secs = i64::try_from(heartbeat_interval.as_secs()).unwrap_or(i64::MAX / 3);
    secs.saturating_mul(3).max(MIN_LEASE_TTL_SECS)
}

fn etcd_error(operation: Operation, err: etcd_client::Error) -> CallError {
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
                CallError::unreachable(operation, status.message())
            }
            code => CallError::rejected(operation, format!("{:?}: {}", code, status.message())),
        },
        // the registry answered, the lease is gone
        etcd_client::Error::LeaseKeepAliveError(reason) => CallError::rejected(operation, reason),
        other => CallError::unreachable(operation, other),
    }
}

/// Best-effort revoke of a lease this client no longer tracks.
async fn revoke_stale_lease(client: &Client, lease_id: i64) {
    match client.lease_client().revoke(lease_id).await {
        Ok(_) => debug!("Revoked stale etcd lease {}", lease_id),
        Err(e) => warn!("Failed to revoke stale etcd lease {}: {}", lease_id, e),
    }
}

#[async_trait]
impl RegistryClient for EtcdRegistryClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Etcd
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<(), CallError> {
        let op = Operation::Register;
        let mut client = self.handle(op).await?;

        // Create lease
        let lease_id = client
            .lease_client()
            .grant(self.lease_ttl, None)
            .await
            .map_err(|e| etcd_error(op, e))?
            .id();

        // Put service info with lease
        let key = Self::service_key(&instance.service_name, &instance.id);
        let value = serde_json::to_string(instance).map_err(|e| CallError::unreachable(op, e))?;
        let options = PutOptions::new().with_lease(lease_id);
        if let Err(e) = client.put(key.clone(), value, Some(options)).await {
            revoke_stale_lease(&client, lease_id).await;
            return Err(etcd_error(op, e));
        }

        let previous = self.lease.lock().await.replace(Lease {
            id: lease_id,
            key: key.clone(),
        });
        // the new put already owns the key, the old lease only holds it up
        if let Some(previous) = previous.filter(|p| p.id != lease_id) {
            revoke_stale_lease(&client, previous.id).await;
        }
        info!("Registered service to etcd: {} (lease {})", key, lease_id);
        Ok(())
    }

    async fn send_heartbeat(&self, instance_id: &str) -> Result<(), CallError> {
        let op = Operation::Heartbeat;
        let lease_id = self
            .lease
            .lock()
            .await
            .as_ref()
            .map(|lease| lease.id)
            .ok_or_else(|| CallError::rejected(op, format!("no lease held for '{}'", instance_id)))?;

        // keep_alive sends one refresh and waits for its reply before returning
        let client = self.handle(op).await?;
        client
            .lease_client()
            .keep_alive(lease_id)
            .await
            .map_err(|e| etcd_error(op, e))?;
        debug!("Refreshed etcd lease {} for {}", lease_id, instance_id);
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), CallError> {
        let op = Operation::Deregister;
        let Some(lease) = self.lease.lock().await.take() else {
            debug!(instance_id, "No etcd lease held, nothing to deregister");
            return Ok(());
        };

        // Delete service info
        let mut client = self.handle(op).await?;
        client
            .delete(lease.key.clone(), None)
            .await
            .map_err(|e| etcd_error(op, e))?;

        // Revoke lease
        client
            .lease_client()
            .revoke(lease.id)
            .await
            .map_err(|e| etcd_error(op, e))?;

        info!("Deregistered service from etcd: {}", lease.key);
        Ok(())
    }

    async fn list_healthy_instances(
        &self,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>, CallError> {
        let op = Operation::ListHealthy;
        let mut client = self.handle(op).await?;
        let prefix = format!("{}/{}/", KEY_PREFIX, service_name);
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| etcd_error(op, e))?;

        let mut instances = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<ServiceInstance>(kv.value()) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!(key = ?kv.key_str(), error = %e, "Skipping malformed registry entry"),
            }
        }
        Ok(instances)
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            debug!("etcd registry client closed");
        }
    }
}

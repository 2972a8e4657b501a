use super::{Operation, RegistryClient, TransportKind};
use crate::api::ServiceInstance;
use crate::error::{CallError, RegistrarError};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Registry client speaking the JSON/HTTP registry API.
pub struct HttpRegistryClient {
    base_url: String,
    client: reqwest::Client,
    closed: AtomicBool,
}

impl HttpRegistryClient {
    pub fn new(registry_url: &str, timeout: Duration) -> Result<Self, RegistrarError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistrarError::transport(TransportKind::Http, e))?;

        Ok(Self {
            base_url: registry_url.trim_end_matches('/').to_string(),
            client,
            closed: AtomicBool::new(false),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/services/{}", self.base_url, path)
    }

    async fn send(
        &self,
        operation: Operation,
        request: RequestBuilder,
        expected: StatusCode,
    ) -> Result<(), CallError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::unreachable(operation, "registry client is closed"));
        }

        let resp = request.send().await.map_err(|e| {
            CallError::unreachable(
                operation,
                format!("failed to send request to {}: {}", self.base_url, e),
            )
        })?;

        let status = resp.status();
        if status != expected {
            let body = resp.text().await.unwrap_or_default();
            return Err(CallError::rejected(
                operation,
                format!(
                    "registry returned status {} (expected {}), body: {}",
                    status.as_u16(),
                    expected.as_u16(),
                    body
                ),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<(), CallError> {
        let request = self.client.post(self.endpoint("register")).json(instance);
        self.send(Operation::Register, request, StatusCode::CREATED).await
    }

    async fn send_heartbeat(&self, instance_id: &str) -> Result<(), CallError> {
        let request = self
            .client
            .post(self.endpoint(&format!("heartbeat/{}", instance_id)));
        self.send(Operation::Heartbeat, request, StatusCode::OK).await
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), CallError> {
        let request = self
            .client
            .delete(self.endpoint(&format!("deregister/{}", instance_id)));
        self.send(Operation::Deregister, request, StatusCode::NO_CONTENT)
            .await
    }

    // connections are pooled by reqwest; closing only stops further calls
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("HTTP registry client for {} closed", self.base_url);
        }
    }
}

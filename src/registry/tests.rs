use super::grpc::pb;
use super::grpc::pb::service_registry_server::{ServiceRegistry, ServiceRegistryServer};
use super::grpc::GrpcRegistryClient;
use super::http::HttpRegistryClient;
use super::*;
use crate::registration::{Phase, Registrar};
use crate::signals::NoopSignals;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

fn create_test_instance(name: &str) -> ServiceInstance {
    ServiceInstance::new(format!("{}-test-node", name), name, "127.0.0.1", 8080)
        .with_health_path("/healthz")
}

/// Address nothing listens on.
async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

// ---- HTTP ----

type HttpStore = Arc<Mutex<HashMap<String, ServiceInstance>>>;

async fn http_register(
    State(store): State<HttpStore>,
    Json(instance): Json<ServiceInstance>,
) -> StatusCode {
    store.lock().unwrap().insert(instance.id.clone(), instance);
    StatusCode::CREATED
}

async fn http_heartbeat(State(store): State<HttpStore>, Path(id): Path<String>) -> StatusCode {
    if store.lock().unwrap().contains_key(&id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn http_deregister(State(store): State<HttpStore>, Path(id): Path<String>) -> StatusCode {
    match store.lock().unwrap().remove(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn spawn_http_registry() -> (String, HttpStore) {
    let store = HttpStore::default();
    let app = Router::new()
        .route("/api/v1/services/register", post(http_register))
        .route("/api/v1/services/heartbeat/:id", post(http_heartbeat))
        .route("/api/v1/services/deregister/:id", delete(http_deregister))
        .with_state(store.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/", addr), store)
}

#[tokio::test]
async fn test_http_basic_lifecycle() {
    let (url, store) = spawn_http_registry().await;
    let client = HttpRegistryClient::new(&url, Duration::from_secs(2)).unwrap();
    let instance = create_test_instance("http-service");

    client.register(&instance).await.expect("Failed to register service");
    {
        let stored = store.lock().unwrap();
        let registered = stored.get(&instance.id).expect("instance stored");
        assert_eq!(registered.service_name, "http-service");
        assert_eq!(registered.health_path, "/healthz");
        assert_eq!(registered.port, 8080);
    }

    client
        .send_heartbeat(&instance.id)
        .await
        .expect("Failed to send heartbeat");
    client
        .deregister(&instance.id)
        .await
        .expect("Failed to deregister service");
    assert!(store.lock().unwrap().is_empty());

    // the registry no longer knows the instance
    match client.send_heartbeat(&instance.id).await {
        Err(err @ CallError::Rejected { .. }) => {
            assert!(err.reached_registry());
            assert!(err.to_string().contains("404"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_http_unreachable_registry() {
    let url = closed_address().await;
    let client = HttpRegistryClient::new(&url, Duration::from_secs(2)).unwrap();

    let err = client
        .register(&create_test_instance("http-down"))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Unreachable { operation: Operation::Register, .. }));
    assert!(!err.reached_registry());
}

#[tokio::test]
async fn test_http_close_is_idempotent() {
    let (url, _store) = spawn_http_registry().await;
    let client = HttpRegistryClient::new(&url, Duration::from_secs(2)).unwrap();

    assert!(matches!(
        client.list_healthy_instances("any").await,
        Err(CallError::Unsupported { transport: TransportKind::Http, .. })
    ));

    client.close().await;
    client.close().await;
    assert!(matches!(
        client.send_heartbeat("any").await,
        Err(CallError::Unreachable { .. })
    ));
}

#[tokio::test]
async fn test_registrar_over_http() {
    let (url, store) = spawn_http_registry().await;
    let instance = create_test_instance("registrar-http");
    let config = RegistrarConfig::new(url, TransportKind::Http)
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_call_timeout(Duration::from_secs(1))
        .with_retry_base_delay(Duration::from_millis(10));

    let mut registrar = Registrar::new(instance.clone(), config, Arc::new(NoopSignals))
        .await
        .expect("Failed to build registrar");
    let ctx = CancellationToken::new();

    registrar.start(&ctx).await;
    assert_eq!(registrar.phase(), Phase::Registered);
    assert!(store.lock().unwrap().contains_key(&instance.id));

    // the registry forgets us; the next failed heartbeat re-registers
    store.lock().unwrap().clear();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(store.lock().unwrap().contains_key(&instance.id));
    assert_eq!(registrar.phase(), Phase::Registered);

    registrar.stop(&ctx).await;
    assert!(store.lock().unwrap().is_empty());
    assert_eq!(registrar.phase(), Phase::Stopped);
}

// ---- gRPC ----

#[derive(Default, Clone)]
struct StubRegistry {
    instances: Arc<Mutex<HashMap<String, pb::ServiceInstance>>>,
}

#[tonic::async_trait]
impl ServiceRegistry for StubRegistry {
    async fn register_service(
        &self,
        request: Request<pb::RegisterServiceRequest>,
    ) -> Result<Response<pb::RegisterServiceResponse>, Status> {
        let Some(instance) = request.into_inner().instance else {
            return Err(Status::invalid_argument("missing instance"));
        };
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance);
        Ok(Response::new(pb::RegisterServiceResponse {
            success: true,
            message: "registered".to_string(),
        }))
    }

    async fn send_heartbeat(
        &self,
        request: Request<pb::SendHeartbeatRequest>,
    ) -> Result<Response<pb::SendHeartbeatResponse>, Status> {
        let id = request.into_inner().instance_id;
        let known = self.instances.lock().unwrap().contains_key(&id);
        Ok(Response::new(pb::SendHeartbeatResponse {
            success: known,
            message: if known { "ok" } else { "unknown instance" }.to_string(),
        }))
    }

    async fn deregister_service(
        &self,
        request: Request<pb::DeregisterServiceRequest>,
    ) -> Result<Response<pb::DeregisterServiceResponse>, Status> {
        let id = request.into_inner().instance_id;
        let removed = self.instances.lock().unwrap().remove(&id).is_some();
        Ok(Response::new(pb::DeregisterServiceResponse {
            success: removed,
            message: String::new(),
        }))
    }

    async fn get_healthy_services(
        &self,
        request: Request<pb::GetHealthyServicesRequest>,
    ) -> Result<Response<pb::GetHealthyServicesResponse>, Status> {
        let name = request.into_inner().service_name;
        let instances = self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.service_name == name)
            .cloned()
            .collect();
        Ok(Response::new(pb::GetHealthyServicesResponse { instances }))
    }
}

async fn spawn_grpc_registry() -> (String, StubRegistry) {
    let stub = StubRegistry::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = ServiceRegistryServer::new(stub.clone());

    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    (format!("http://{}", addr), stub)
}

#[tokio::test]
async fn test_grpc_basic_lifecycle() {
    let (address, stub) = spawn_grpc_registry().await;
    let client = GrpcRegistryClient::new(&address, Duration::from_secs(2)).unwrap();
    let instance = create_test_instance("grpc-service");

    client.register(&instance).await.expect("Failed to register service");

    let healthy = client
        .list_healthy_instances("grpc-service")
        .await
        .expect("Failed to list instances");
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0], instance);
    assert_eq!(healthy[0].health_path, "/healthz");
    assert_eq!(healthy[0].port, 8080);

    client
        .send_heartbeat(&instance.id)
        .await
        .expect("Failed to send heartbeat");
    client
        .deregister(&instance.id)
        .await
        .expect("Failed to deregister service");
    assert!(stub.instances.lock().unwrap().is_empty());

    // success=false from the registry is a rejection
    let err = client.send_heartbeat(&instance.id).await.unwrap_err();
    assert!(err.reached_registry());
    assert!(err.to_string().contains("unknown instance"));
}

#[tokio::test]
async fn test_grpc_accepts_address_without_scheme() {
    let (address, stub) = spawn_grpc_registry().await;
    let bare = address.trim_start_matches("http://");
    let client = GrpcRegistryClient::new(bare, Duration::from_secs(2)).unwrap();

    client
        .register(&create_test_instance("grpc-bare"))
        .await
        .expect("Failed to register service");
    assert_eq!(stub.instances.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_grpc_unreachable_registry() {
    let address = closed_address().await;
    let client = GrpcRegistryClient::new(&address, Duration::from_secs(2)).unwrap();

    let err = client.send_heartbeat("nobody").await.unwrap_err();
    assert!(matches!(err, CallError::Unreachable { operation: Operation::Heartbeat, .. }));
}

#[tokio::test]
async fn test_grpc_invalid_address_fails_construction() {
    let result = GrpcRegistryClient::new("not a uri", Duration::from_secs(1));
    assert!(matches!(
        result,
        Err(RegistrarError::TransportConstruction { kind: TransportKind::Grpc, .. })
    ));
}

#[tokio::test]
async fn test_grpc_close_is_idempotent() {
    let (address, _stub) = spawn_grpc_registry().await;
    let config = RegistrarConfig::new(address, TransportKind::Grpc);
    let client = connect(&config).await.expect("Failed to build client");
    assert_eq!(client.kind(), TransportKind::Grpc);

    client.close().await;
    client.close().await;
    let err = client
        .register(&create_test_instance("grpc-closed"))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Unreachable { .. }));
    assert!(err.to_string().contains("closed"));
}

// ---- transport selection ----

#[test]
fn test_transport_kind_parsing() {
    assert_eq!("http".parse::<TransportKind>().unwrap(), TransportKind::Http);
    assert_eq!(" GRPC ".parse::<TransportKind>().unwrap(), TransportKind::Grpc);
    assert_eq!("etcd".parse::<TransportKind>().unwrap(), TransportKind::Etcd);
    assert!(matches!(
        "consul".parse::<TransportKind>(),
        Err(RegistrarError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_connect_builds_selected_transport() {
    let http = connect(&RegistrarConfig::new("http://localhost:1", TransportKind::Http))
        .await
        .expect("Failed to build http client");
    assert_eq!(http.kind(), TransportKind::Http);
    http.close().await;
}

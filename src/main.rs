#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use clap::Parser;
use registrar_rs::signals::TracingSignals;
use registrar_rs::{init_env, utils::logger, Registrar, RegistrarConfig, ServiceInstance, TransportKind};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Keep one service instance registered with a service registry until interrupted.
#[derive(Parser, Debug)]
#[command(name = "registrar")]
struct Args {
    /// Registry address: base URL (http), host:port (grpc), or comma separated endpoints (etcd)
    #[arg(long, env = "REGISTRAR_REGISTRY_ADDRESS")]
    registry_address: String,

    /// http, grpc or etcd
    #[arg(long, env = "REGISTRAR_TRANSPORT", default_value = "http")]
    transport: String,

    #[arg(long, env = "REGISTRAR_SERVICE_NAME")]
    service_name: String,

    #[arg(long, env = "REGISTRAR_INSTANCE_ID", default_value_t = Uuid::new_v4().to_string())]
    instance_id: String,

    /// Advertised host, defaults to the first local IP address
    #[arg(long, env = "REGISTRAR_HOST")]
    host: Option<String>,

    #[arg(long, env = "REGISTRAR_PORT")]
    port: u16,

    #[arg(long, env = "REGISTRAR_HEALTH_PATH", default_value = "/health")]
    health_path: String,

    #[arg(long, env = "REGISTRAR_HEARTBEAT_SECS", default_value = "10")]
    heartbeat_secs: u64,

    #[arg(long, env = "REGISTRAR_TIMEOUT_SECS", default_value = "5")]
    timeout_secs: u64,

    #[arg(long, env = "REGISTRAR_MAX_RETRIES", default_value = "5")]
    max_retries: u32,

    #[arg(long, env = "REGISTRAR_RETRY_DELAY_MS", default_value = "1000")]
    retry_delay_ms: u64,

    #[arg(long, env = "REGISTRAR_LOG_DIR", default_value = "./logs")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    let args = Args::parse();

    let _guard = logger::init(args.log_dir.clone())?;

    let transport: TransportKind = args.transport.parse()?;
    let host = match args.host {
        Some(host) => host,
        None => local_ip_address::local_ip()
            .context("Failed to detect local IP address")?
            .to_string(),
    };

    let instance = ServiceInstance::new(args.instance_id, args.service_name, host, args.port)
        .with_health_path(args.health_path);
    let config = RegistrarConfig::new(args.registry_address, transport)
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_secs))
        .with_call_timeout(Duration::from_secs(args.timeout_secs))
        .with_max_retries(args.max_retries)
        .with_retry_base_delay(Duration::from_millis(args.retry_delay_ms));

    info!(
        service = %instance.service_name,
        instance_id = %instance.id,
        url = %instance.url,
        transport = %transport,
        "Starting registrar"
    );

    let mut registrar = Registrar::new(instance, config, Arc::new(TracingSignals)).await?;
    let ctx = CancellationToken::new();
    registrar.start(&ctx).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    registrar.stop(&ctx).await;
    Ok(())
}

use std::panic;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use lesson_runner::{
    Config, SandboxHost,
    grpc::{
        models::execution_service_server::ExecutionServiceServer,
        services::{ExecutionServiceImpl, HostFactory},
    },
};

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let config = Config::from_env()?;
    let addr = config.server.addr.parse()?;

    let host_config = config.clone();
    let factory: HostFactory = Arc::new(move || SandboxHost::from_config(&host_config));
    let sessions = ExecutionServiceImpl::new(
        factory,
        Duration::from_millis(config.limits.session_idle_ms),
    );
    let _reaper = sessions.spawn_reaper();
    let service = ExecutionServiceServer::new(sessions);

    tracing::info!("gRPC server listening on {}", addr);
    Server::builder().add_service(service).serve(addr).await?;

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}

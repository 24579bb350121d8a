//! Entry point for the `breakfix-gateway` HTTP server.

use std::path::PathBuf;
use std::sync::Arc;

use breakfix_core::MemoryStore;
use breakfix_executor::{
    HypervisorConfig, ProxmoxClient, SessionConfig, SessionOrchestrator, SshExecutor, TaskQueue,
};
use breakfix_gateway::{
    catalog::{load_exercises, CATALOG_VAR},
    routes::create_router,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Log `message` with `error` and exit non-zero.
fn fail(message: &str, error: &dyn std::fmt::Display) -> ! {
    tracing::error!(error = %error, "{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("BREAKFIX_LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3456".to_owned());

    let hypervisor_config = match HypervisorConfig::from_env() {
        Ok(c) => c,
        Err(e) => fail("invalid hypervisor configuration", &e),
    };
    let session_config = match SessionConfig::from_env() {
        Ok(c) => c,
        Err(e) => fail("invalid session configuration", &e),
    };
    if session_config.ssh.is_none() {
        tracing::warn!("BREAKFIX_SSH_KEY not set; scripts cannot reach student VMs");
    }

    let exercises = match std::env::var(CATALOG_VAR) {
        Ok(path) => match load_exercises(&PathBuf::from(path)).await {
            Ok(e) => e,
            Err(e) => fail("failed to load exercises", &e),
        },
        Err(_) => {
            tracing::warn!("{CATALOG_VAR} not set; starting with no exercises");
            Vec::new()
        }
    };

    let hypervisor = match ProxmoxClient::new(&hypervisor_config) {
        Ok(h) => h,
        Err(e) => fail("failed to build hypervisor client", &e),
    };

    let sessions = SessionOrchestrator::new(
        Arc::new(hypervisor),
        Arc::new(SshExecutor::default()),
        Arc::new(MemoryStore::with_exercises(exercises)),
        TaskQueue::new(),
        session_config,
    );
    let app = create_router(Arc::new(sessions));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => fail("failed to bind", &e),
    };

    info!(addr = %addr, node = %hypervisor_config.node, "breakfix-gateway listening");

    if let Err(e) = axum::serve(listener, app).await {
        fail("server error", &e);
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harbor_core::metrics;
use harbor_core::telemetry::init_tracing;
use harbor_session_registrar::config::{AppConfig, Cli};
use harbor_session_registrar::registrar::SessionRegistrar;
use harbor_session_registrar::routes;
use harbor_session_registrar::state::AppState;
use harbor_transport::{HttpTransport, Transport};
use tokio::signal;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::try_from(Cli::parse())?;
    init_tracing(&config.log_filter);
    metrics::BOOT_COUNTER.inc();

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new());
    let registrar = SessionRegistrar::new(config.registrar_settings(), transport);
    let lss_monitor = registrar.spawn_lss_monitor(config.lss_health_interval);
    let sweeper = registrar.spawn_reservation_sweep(config.reservation_sweep_interval);

    let instance_id = Uuid::new_v4().to_string();
    let app = routes::router(AppState::new(Arc::clone(&registrar), instance_id.clone()));

    info!(
        addr = %config.bind_addr,
        url = %config.public_url,
        instance = %instance_id,
        gds = %config.gds_url.as_deref().unwrap_or("unset"),
        "starting harbor-session-registrar"
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    lss_monitor.stop().await;
    sweeper.stop().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

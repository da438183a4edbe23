use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harbor_core::metrics;
use harbor_core::telemetry::init_tracing;
use harbor_directory_service::config::{AppConfig, Cli};
use harbor_directory_service::directory::DirectoryService;
use harbor_directory_service::routes;
use harbor_directory_service::state::AppState;
use harbor_directory_service::upstream;
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
    let directory = DirectoryService::new(config.directory_settings(), transport);
    let mut workers = vec![directory.spawn_node_monitor(config.node_health_interval)];

    if let Some(gds_url) = &config.gds_url {
        upstream::register(&directory, gds_url, config.retry, config.send_timeout)
            .await
            .context("failed to register with the global directory")?;
        workers.push(upstream::spawn_monitor(
            &directory,
            gds_url,
            config.link_health_interval,
            config.send_timeout,
        ));
        workers.push(upstream::spawn_load_reporter(
            &directory,
            gds_url,
            config.load_report_interval,
            config.send_timeout,
        ));
    }

    let instance_id = Uuid::new_v4().to_string();
    let app = routes::router(AppState::new(Arc::clone(&directory), instance_id.clone()));

    info!(
        addr = %config.bind_addr,
        url = %config.public_url,
        instance = %instance_id,
        region = %config.region,
        gds = %config.gds_url.as_deref().unwrap_or("unset"),
        "starting harbor-directory-service"
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    for worker in workers {
        worker.stop().await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

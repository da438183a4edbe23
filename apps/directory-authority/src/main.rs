use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harbor_core::metrics;
use harbor_core::telemetry::init_tracing;
use harbor_directory_authority::config::{AppConfig, Cli};
use harbor_directory_authority::directory::DirectoryAuthority;
use harbor_directory_authority::routes;
use harbor_directory_authority::state::AppState;
use harbor_directory_authority::upstream;
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
    let authority = DirectoryAuthority::new(config.authority_settings(), transport);
    let mut workers = vec![authority.spawn_directory_monitor(config.directory_health_interval)];

    let instance_id = Uuid::new_v4().to_string();
    let app = routes::router(AppState::new(Arc::clone(&authority), instance_id.clone()));

    info!(
        addr = %config.bind_addr,
        url = %config.public_url,
        instance = %instance_id,
        gss = %config.gss_url.as_deref().unwrap_or("unset"),
        "starting harbor-directory-authority"
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;

    // Listener must be bound before the registrar hands out our url.
    if let Some(gss_url) = &config.gss_url {
        upstream::announce(&authority, gss_url, config.retry, config.send_timeout)
            .await
            .context("failed to announce to the session registrar")?;
        workers.push(upstream::spawn_monitor(
            &authority,
            gss_url,
            config.link_health_interval,
            config.send_timeout,
        ));
    }

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

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harbor_core::metrics;
use harbor_core::telemetry::init_tracing;
use harbor_session_authority::authority::SessionAuthority;
use harbor_session_authority::config::{AppConfig, Cli};
use harbor_session_authority::routes;
use harbor_session_authority::state::AppState;
use harbor_session_authority::upstream;
use harbor_transport::{HttpTransport, Transport};
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::try_from(cli)?;
    init_tracing(&config.log_filter);
    metrics::BOOT_COUNTER.inc();

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new());
    let authority = SessionAuthority::new(config.authority_settings(), transport);
    for name in &config.debug_services {
        if let Err(err) = authority.enable_service_debug(name) {
            warn!(service = %name, error = %err, "ignoring debug service");
        }
    }

    let mut monitor = None;
    if let Some(gss_url) = &config.gss_url {
        upstream::register(&authority, gss_url, config.retry, config.send_timeout)
            .await
            .context("failed to register with the session registrar")?;
        monitor = Some(upstream::spawn_monitor(
            &authority,
            gss_url,
            config.link_health_interval,
            config.send_timeout,
        ));
    }

    let instance_id = Uuid::new_v4().to_string();
    let app = routes::router(AppState::new(Arc::clone(&authority), instance_id.clone()));

    info!(
        addr = %config.bind_addr,
        url = %config.public_url,
        instance = %instance_id,
        gss = %config.gss_url.as_deref().unwrap_or("unset"),
        directory = %authority.directory_url().as_deref().unwrap_or("unset"),
        session_health_secs = config.session_health_interval.as_secs(),
        "starting harbor-session-authority"
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    authority.stop_health_loops().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

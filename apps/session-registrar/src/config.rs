use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::registrar::RegistrarSettings;

#[derive(Debug, Parser)]
#[command(
    name = "harbor-session-registrar",
    version,
    about = "Global session registrar for the harbor control plane"
)]
pub struct Cli {
    #[arg(long, env = "HARBOR_GSS_BIND_ADDR", default_value = "0.0.0.0:8090")]
    pub bind_addr: String,

    #[arg(long, env = "HARBOR_GSS_PUBLIC_URL", default_value = "http://127.0.0.1:8090")]
    pub public_url: String,

    /// Global directory handed to session authorities, until one registers itself.
    #[arg(long, env = "HARBOR_GDS_URL")]
    pub gds_url: Option<String>,

    #[arg(long, env = "HARBOR_GSS_LSS_HEALTH_SECS", default_value_t = 60)]
    pub lss_health_secs: u64,

    /// Unconfirmed reservations are dropped after this many seconds.
    #[arg(long, env = "HARBOR_GSS_RESERVATION_TIMEOUT_SECS", default_value_t = 15)]
    pub reservation_timeout_secs: u64,

    #[arg(long, env = "HARBOR_GSS_RESERVATION_SWEEP_MS", default_value_t = 500)]
    pub reservation_sweep_ms: u64,

    #[arg(long, env = "HARBOR_SEND_TIMEOUT_MS", default_value_t = 3000)]
    pub send_timeout_ms: u64,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub public_url: String,
    pub gds_url: Option<String>,
    pub lss_health_interval: Duration,
    pub reservation_timeout: Duration,
    pub reservation_sweep_interval: Duration,
    pub send_timeout: Duration,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            public_url: "http://127.0.0.1:8090".into(),
            gds_url: None,
            lss_health_interval: Duration::from_secs(60),
            reservation_timeout: Duration::from_secs(15),
            reservation_sweep_interval: Duration::from_millis(500),
            send_timeout: Duration::from_secs(3),
            log_filter: "info".into(),
        }
    }
}

impl TryFrom<Cli> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let bind_addr: SocketAddr = cli
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address: {}", cli.bind_addr))?;
        Ok(AppConfig {
            bind_addr,
            public_url: cli.public_url,
            gds_url: cli.gds_url.filter(|u| !u.is_empty()),
            lss_health_interval: Duration::from_secs(cli.lss_health_secs.max(1)),
            reservation_timeout: Duration::from_secs(cli.reservation_timeout_secs),
            reservation_sweep_interval: Duration::from_millis(cli.reservation_sweep_ms.max(1)),
            send_timeout: Duration::from_millis(cli.send_timeout_ms),
            log_filter: cli.log_filter,
        })
    }
}

impl AppConfig {
    pub fn registrar_settings(&self) -> RegistrarSettings {
        RegistrarSettings {
            local_url: self.public_url.clone(),
            gds_url: self.gds_url.clone(),
            reservation_timeout: self.reservation_timeout,
            send_timeout: self.send_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_app_defaults() {
        let config = AppConfig::try_from(Cli::parse_from(["harbor-session-registrar"])).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.reservation_timeout, defaults.reservation_timeout);
        assert_eq!(
            config.reservation_sweep_interval,
            defaults.reservation_sweep_interval
        );
        assert_eq!(config.gds_url, None);
    }
}

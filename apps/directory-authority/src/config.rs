use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use harbor_core::link::RetryPolicy;

use crate::directory::AuthoritySettings;

#[derive(Debug, Parser)]
#[command(
    name = "harbor-directory-authority",
    version,
    about = "Global directory for the harbor control plane"
)]
pub struct Cli {
    #[arg(long, env = "HARBOR_GDS_BIND_ADDR", default_value = "0.0.0.0:8092")]
    pub bind_addr: String,

    #[arg(long, env = "HARBOR_GDS_PUBLIC_URL", default_value = "http://127.0.0.1:8092")]
    pub public_url: String,

    /// Session registrar to announce this directory to.
    #[arg(long, env = "HARBOR_GSS_URL")]
    pub gss_url: Option<String>,

    #[arg(long, env = "HARBOR_GDS_DIRECTORY_HEALTH_SECS", default_value_t = 60)]
    pub directory_health_secs: u64,

    #[arg(long, env = "HARBOR_GDS_LINK_HEALTH_SECS", default_value_t = 60)]
    pub link_health_secs: u64,

    #[arg(long, env = "HARBOR_REGISTRATION_RETRY_MS", default_value_t = 500)]
    pub registration_retry_ms: u64,

    #[arg(long, env = "HARBOR_REGISTRATION_MAX_ATTEMPTS", default_value_t = 40)]
    pub registration_max_attempts: u32,

    #[arg(long, env = "HARBOR_SEND_TIMEOUT_MS", default_value_t = 3000)]
    pub send_timeout_ms: u64,

    #[arg(long, env = "HARBOR_RELAY_SERVICE_TYPE", default_value = "relay")]
    pub relay_type: String,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub public_url: String,
    pub gss_url: Option<String>,
    pub directory_health_interval: Duration,
    pub link_health_interval: Duration,
    pub retry: RetryPolicy,
    pub send_timeout: Duration,
    pub relay_type: String,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8092)),
            public_url: "http://127.0.0.1:8092".into(),
            gss_url: None,
            directory_health_interval: Duration::from_secs(60),
            link_health_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(3),
            relay_type: "relay".into(),
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
            gss_url: cli.gss_url.filter(|u| !u.is_empty()),
            directory_health_interval: Duration::from_secs(cli.directory_health_secs.max(1)),
            link_health_interval: Duration::from_secs(cli.link_health_secs.max(1)),
            retry: RetryPolicy {
                interval: Duration::from_millis(cli.registration_retry_ms),
                max_attempts: cli.registration_max_attempts,
            },
            send_timeout: Duration::from_millis(cli.send_timeout_ms),
            relay_type: cli.relay_type,
            log_filter: cli.log_filter,
        })
    }
}

impl AppConfig {
    pub fn authority_settings(&self) -> AuthoritySettings {
        AuthoritySettings {
            local_url: self.public_url.clone(),
            send_timeout: self.send_timeout,
            relay_type: self.relay_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_app_defaults() {
        let config = AppConfig::try_from(Cli::parse_from(["harbor-directory-authority"])).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.directory_health_interval, defaults.directory_health_interval);
        assert_eq!(config.retry, defaults.retry);
        assert!(config.gss_url.is_none());
    }

    #[test]
    fn rejects_bad_bind_address() {
        let cli = Cli::parse_from(["harbor-directory-authority", "--bind-addr", "nowhere"]);
        assert!(AppConfig::try_from(cli).is_err());
    }
}

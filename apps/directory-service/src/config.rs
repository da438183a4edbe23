use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use harbor_core::link::RetryPolicy;

use crate::directory::DirectorySettings;

#[derive(Debug, Parser)]
#[command(
    name = "harbor-directory-service",
    version,
    about = "Local directory service for the harbor control plane"
)]
pub struct Cli {
    #[arg(long, env = "HARBOR_LDS_BIND_ADDR", default_value = "0.0.0.0:8093")]
    pub bind_addr: String,

    #[arg(long, env = "HARBOR_LDS_PUBLIC_URL", default_value = "http://127.0.0.1:8093")]
    pub public_url: String,

    /// Global directory to register with. Runs standalone when unset.
    #[arg(long, env = "HARBOR_GDS_URL")]
    pub gds_url: Option<String>,

    #[arg(long, env = "HARBOR_REGION", default_value = "")]
    pub region: String,

    #[arg(long, env = "HARBOR_LDS_NODE_HEALTH_SECS", default_value_t = 10)]
    pub node_health_secs: u64,

    /// Nodes without a successful check for this long are not placed on.
    #[arg(long, env = "HARBOR_LDS_NODE_STALE_SECS", default_value_t = 30)]
    pub node_stale_secs: u64,

    #[arg(long, env = "HARBOR_LDS_LINK_HEALTH_SECS", default_value_t = 60)]
    pub link_health_secs: u64,

    #[arg(long, env = "HARBOR_LDS_LOAD_REPORT_SECS", default_value_t = 5)]
    pub load_report_secs: u64,

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
    pub gds_url: Option<String>,
    pub region: String,
    pub node_health_interval: Duration,
    pub node_stale_after: Duration,
    pub link_health_interval: Duration,
    pub load_report_interval: Duration,
    pub retry: RetryPolicy,
    pub send_timeout: Duration,
    pub relay_type: String,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8093)),
            public_url: "http://127.0.0.1:8093".into(),
            gds_url: None,
            region: String::new(),
            node_health_interval: Duration::from_secs(10),
            node_stale_after: Duration::from_secs(30),
            link_health_interval: Duration::from_secs(60),
            load_report_interval: Duration::from_secs(5),
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
            gds_url: cli.gds_url.filter(|u| !u.is_empty()),
            region: cli.region,
            node_health_interval: Duration::from_secs(cli.node_health_secs.max(1)),
            node_stale_after: Duration::from_secs(cli.node_stale_secs),
            link_health_interval: Duration::from_secs(cli.link_health_secs.max(1)),
            load_report_interval: Duration::from_secs(cli.load_report_secs.max(1)),
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
    pub fn directory_settings(&self) -> DirectorySettings {
        DirectorySettings {
            local_url: self.public_url.clone(),
            region: self.region.clone(),
            stale_after: self.node_stale_after,
            send_timeout: self.send_timeout,
            relay_type: self.relay_type.clone(),
        }
    }
}

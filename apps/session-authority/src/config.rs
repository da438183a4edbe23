use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use harbor_core::link::RetryPolicy;

use crate::authority::{default_tab_order, AuthoritySettings};

#[derive(Debug, Parser)]
#[command(
    name = "harbor-session-authority",
    version,
    about = "Local session authority for the harbor control plane"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "HARBOR_LSS_BIND_ADDR", default_value = "0.0.0.0:8091")]
    pub bind_addr: String,

    /// Url other processes use to reach this authority.
    #[arg(long, env = "HARBOR_LSS_PUBLIC_URL", default_value = "http://127.0.0.1:8091")]
    pub public_url: String,

    /// Global session registrar to register with.
    #[arg(long, env = "HARBOR_GSS_URL")]
    pub gss_url: Option<String>,

    /// Directory service used for placement until the registrar provides one.
    #[arg(long, env = "HARBOR_DIRECTORY_URL")]
    pub directory_url: Option<String>,

    #[arg(long, env = "HARBOR_REGION")]
    pub region: Option<String>,

    #[arg(long, env = "HARBOR_LSS_SESSION_HEALTH_SECS", default_value_t = 10)]
    pub session_health_secs: u64,

    #[arg(long, env = "HARBOR_LSS_LINK_HEALTH_SECS", default_value_t = 60)]
    pub link_health_secs: u64,

    #[arg(long, env = "HARBOR_REGISTRATION_RETRY_MS", default_value_t = 500)]
    pub registration_retry_ms: u64,

    #[arg(long, env = "HARBOR_REGISTRATION_MAX_ATTEMPTS", default_value_t = 40)]
    pub registration_max_attempts: u32,

    #[arg(long, env = "HARBOR_SEND_TIMEOUT_MS", default_value_t = 3000)]
    pub send_timeout_ms: u64,

    /// Comma separated mandatory service names to host under a debugger.
    #[arg(long, env = "HARBOR_DEBUG_SERVICES", value_delimiter = ',')]
    pub debug_services: Vec<String>,

    #[arg(long, env = "HARBOR_UI_SERVICE_TYPES", value_delimiter = ',', default_value = "UI")]
    pub ui_service_types: Vec<String>,

    /// Tab layout returned to UI services; built-in order when empty.
    #[arg(long, env = "HARBOR_UI_TAB_ORDER", value_delimiter = ',')]
    pub tab_order: Vec<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub public_url: String,
    pub gss_url: Option<String>,
    pub directory_url: Option<String>,
    pub region: Option<String>,
    pub session_health_interval: Duration,
    pub link_health_interval: Duration,
    pub retry: RetryPolicy,
    pub send_timeout: Duration,
    pub debug_services: Vec<String>,
    pub ui_service_types: Vec<String>,
    pub tab_order: Vec<String>,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8091)),
            public_url: "http://127.0.0.1:8091".into(),
            gss_url: None,
            directory_url: None,
            region: None,
            session_health_interval: Duration::from_secs(10),
            link_health_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(3),
            debug_services: Vec::new(),
            ui_service_types: vec!["UI".into()],
            tab_order: default_tab_order(),
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
        let tab_order = if cli.tab_order.is_empty() {
            default_tab_order()
        } else {
            cli.tab_order
        };
        Ok(AppConfig {
            bind_addr,
            public_url: cli.public_url,
            gss_url: cli.gss_url.filter(|u| !u.is_empty()),
            directory_url: cli.directory_url.filter(|u| !u.is_empty()),
            region: cli.region.filter(|r| !r.is_empty()),
            session_health_interval: Duration::from_secs(cli.session_health_secs.max(1)),
            link_health_interval: Duration::from_secs(cli.link_health_secs.max(1)),
            retry: RetryPolicy {
                interval: Duration::from_millis(cli.registration_retry_ms),
                max_attempts: cli.registration_max_attempts,
            },
            send_timeout: Duration::from_millis(cli.send_timeout_ms),
            debug_services: cli.debug_services,
            ui_service_types: cli.ui_service_types,
            tab_order,
            log_filter: cli.log_filter,
        })
    }
}

impl AppConfig {
    pub fn authority_settings(&self) -> AuthoritySettings {
        AuthoritySettings {
            local_url: self.public_url.clone(),
            region: self.region.clone(),
            directory_url: self.directory_url.clone(),
            session_health_interval: self.session_health_interval,
            send_timeout: self.send_timeout,
            ui_service_types: self.ui_service_types.clone(),
            tab_order: self.tab_order.clone(),
        }
    }
}

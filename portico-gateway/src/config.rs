use std::path::Path;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

/// Portico reverse-tunnel gateway.
///
/// Publicly reachable server that lets agents behind NAT expose a local
/// service through a persistent outbound websocket. Public requests to
/// `<subdomain>.<base_domain>` are multiplexed as frames over the agent
/// socket and answered from the correlated response frame.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Base domain under which tunnel subdomains are published (e.g. portico.dev)
    #[arg(long, env = "PORTICO_BASE_DOMAIN")]
    pub base_domain: String,

    /// Port to listen on for the public edge and the admin API
    #[arg(long, env = "PORTICO_LISTEN_PORT", default_value_t = 8080)]
    pub listen_port: u16,

    /// Maximum simultaneous tunnels per user
    #[arg(long, env = "PORTICO_MAX_TUNNELS_PER_USER", default_value_t = 5)]
    pub max_tunnels_per_user: usize,

    /// Tunnel lifetime in seconds
    #[arg(long, env = "PORTICO_TUNNEL_EXPIRATION", default_value_t = 86_400)]
    pub tunnel_expiration_secs: u64,

    /// Local ports agents may expose (empty = allow all)
    #[arg(
        long,
        env = "PORTICO_ALLOWED_PORTS",
        value_delimiter = ',',
        default_values_t = vec![3000, 3001, 4000, 5000, 8000, 8080, 8081, 9000]
    )]
    pub allowed_ports: Vec<u16>,

    /// Local ports that are always refused
    #[arg(
        long,
        env = "PORTICO_RESTRICTED_PORTS",
        value_delimiter = ',',
        default_values_t = vec![22, 23, 25, 53, 80, 110, 143, 443, 993, 995]
    )]
    pub restricted_ports: Vec<u16>,

    /// Per-request deadline in seconds
    #[arg(long, env = "PORTICO_REQUEST_DEADLINE", default_value_t = 30)]
    pub request_deadline_secs: u64,

    /// Heartbeat emit interval in seconds
    #[arg(long, env = "PORTICO_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Seconds of agent silence before the heartbeat loop declares the
    /// session dead
    #[arg(long, env = "PORTICO_LIVENESS_THRESHOLD", default_value_t = 60)]
    pub liveness_threshold_secs: u64,

    /// Seconds of agent silence before the liveness sweep calls a session
    /// stale (also the health-check bound)
    #[arg(long, env = "PORTICO_STALE_THRESHOLD", default_value_t = 120)]
    pub stale_threshold_secs: u64,

    /// Liveness sweep interval in seconds
    #[arg(long, env = "PORTICO_STALE_SWEEP_INTERVAL", default_value_t = 300)]
    pub stale_sweep_interval_secs: u64,

    /// Expiry sweep interval in seconds
    #[arg(long, env = "PORTICO_EXPIRY_SWEEP_INTERVAL", default_value_t = 600)]
    pub expiry_sweep_interval_secs: u64,

    /// Seconds a created tunnel may wait for its agent before being reaped
    #[arg(long, env = "PORTICO_CONNECT_GRACE", default_value_t = 60)]
    pub connect_grace_secs: u64,

    /// Maximum frame size in bytes; bounds the buffered request and
    /// response bodies
    #[arg(long, env = "PORTICO_MAX_FRAME_BYTES", default_value_t = 4_194_304)]
    pub max_frame_bytes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PORTICO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "PORTICO_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn tunnel_expiration(&self) -> Duration {
        Duration::from_secs(self.tunnel_expiration_secs)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.liveness_threshold_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_secs(self.connect_grace_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_domain.is_empty() {
            anyhow::bail!("base_domain must not be empty");
        }
        if self.base_domain.starts_with('.') || self.base_domain.contains("://") {
            anyhow::bail!("base_domain must be a bare domain name (e.g. portico.dev)");
        }
        if self.max_frame_bytes == 0 {
            anyhow::bail!("max_frame_bytes must be positive");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval must be positive");
        }
        Ok(())
    }

    /// Check a requested local port against the range, the restricted
    /// list, and the allow-list (empty allow-list permits everything).
    pub fn validate_port(&self, port: u32) -> Result<u16, PortError> {
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p >= 1)
            .ok_or(PortError::OutOfRange)?;
        if self.restricted_ports.contains(&port) {
            return Err(PortError::Restricted(port));
        }
        if !self.allowed_ports.is_empty() && !self.allowed_ports.contains(&port) {
            return Err(PortError::NotAllowed(port));
        }
        Ok(port)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port must be between 1 and 65535")]
    OutOfRange,
    #[error("port {0} is restricted")]
    Restricted(u16),
    #[error("port {0} is not allowed")]
    NotAllowed(u16),
}

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Optional TOML configuration. Values are injected as environment
/// variables before clap parses, preserving the precedence
/// CLI > env > config file.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub base_domain: Option<String>,
    pub listen_port: Option<u16>,
    pub max_tunnels_per_user: Option<usize>,
    pub tunnel_expiration_secs: Option<u64>,
    pub allowed_ports: Option<Vec<u16>>,
    pub restricted_ports: Option<Vec<u16>>,
    pub request_deadline_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub liveness_threshold_secs: Option<u64>,
    pub stale_threshold_secs: Option<u64>,
    pub stale_sweep_interval_secs: Option<u64>,
    pub expiry_sweep_interval_secs: Option<u64>,
    pub connect_grace_secs: Option<u64>,
    pub max_frame_bytes: Option<usize>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Inject values that are not already present in the environment.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("PORTICO_BASE_DOMAIN", self.base_domain);
        set!("PORTICO_LISTEN_PORT", self.listen_port);
        set!("PORTICO_MAX_TUNNELS_PER_USER", self.max_tunnels_per_user);
        set!("PORTICO_TUNNEL_EXPIRATION", self.tunnel_expiration_secs);
        set!("PORTICO_REQUEST_DEADLINE", self.request_deadline_secs);
        set!("PORTICO_HEARTBEAT_INTERVAL", self.heartbeat_interval_secs);
        set!("PORTICO_LIVENESS_THRESHOLD", self.liveness_threshold_secs);
        set!("PORTICO_STALE_THRESHOLD", self.stale_threshold_secs);
        set!("PORTICO_STALE_SWEEP_INTERVAL", self.stale_sweep_interval_secs);
        set!("PORTICO_EXPIRY_SWEEP_INTERVAL", self.expiry_sweep_interval_secs);
        set!("PORTICO_CONNECT_GRACE", self.connect_grace_secs);
        set!("PORTICO_MAX_FRAME_BYTES", self.max_frame_bytes);
        set!("PORTICO_LOG_LEVEL", self.log_level);
        set!("PORTICO_LOG_JSON", self.log_json);

        // port lists need comma joining
        for (env, ports) in [
            ("PORTICO_ALLOWED_PORTS", &self.allowed_ports),
            ("PORTICO_RESTRICTED_PORTS", &self.restricted_ports),
        ] {
            if let Some(ports) = ports {
                if std::env::var(env).is_err() {
                    let joined = ports
                        .iter()
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    std::env::set_var(env, joined);
                }
            }
        }
    }
}

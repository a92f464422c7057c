//! Configuration module for the tunnel session
//!
//! This module provides TOML-based configuration parsing and validation.
//! Every field has a default, so a missing or empty file yields a usable
//! configuration for the usual PdaNet+ tethering setup.

use crate::error::{Result, RwtError};
use crate::proxy::TargetKind;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming an alternate config file
pub const CONFIG_ENV: &str = "PDANET_RWT_CONFIG";

/// Config file read when [`CONFIG_ENV`] is unset
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pdanet-rwt/config.toml";

/// Proxy endpoint exposed by the tethering phone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host (the phone's address on the tether link)
    #[serde(default = "default_proxy_host")]
    pub host: String,
    /// Proxy port
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// URL scheme written into proxy directives
    #[serde(default = "default_proxy_scheme")]
    pub scheme: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            scheme: default_proxy_scheme(),
        }
    }
}

/// Tunnel device settings handed to the tunnel binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// TUN device name
    #[serde(default = "default_tunnel_name")]
    pub name: String,
    /// Tunnel address with prefix, e.g. `198.18.0.1/15`
    #[serde(default = "default_tunnel_address")]
    pub address: String,
    /// MTU value
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// UDP relay mode passed as `socks5.udp`
    #[serde(default = "default_udp_mode")]
    pub udp: String,
    /// Log level of the tunnel binary
    #[serde(default = "default_tunnel_log_level")]
    pub log_level: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: default_tunnel_name(),
            address: default_tunnel_address(),
            mtu: default_mtu(),
            udp: default_udp_mode(),
            log_level: default_tunnel_log_level(),
        }
    }
}

impl TunnelConfig {
    /// Parsed tunnel network
    pub fn network(&self) -> Result<Ipv4Net> {
        self.address
            .parse::<Ipv4Net>()
            .map_err(|e| RwtError::Config(format!("Invalid tunnel address '{}': {e}", self.address)))
    }
}

/// Default route metrics and kernel knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Metric of the default route through the tunnel (preferred)
    #[serde(default = "default_tunnel_metric")]
    pub tunnel_metric: u32,
    /// Metric of the fallback default route via the original gateway
    #[serde(default = "default_fallback_metric")]
    pub fallback_metric: u32,
    /// rp_filter value restored when the prior value cannot be read
    #[serde(default = "default_rp_filter_fallback")]
    pub rp_filter_fallback: u8,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            tunnel_metric: default_tunnel_metric(),
            fallback_metric: default_fallback_metric(),
            rp_filter_fallback: default_rp_filter_fallback(),
        }
    }
}

/// Where the tunnel binary is published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Release index (GitHub "latest release" API URL)
    #[serde(default = "default_index_url")]
    pub index_url: String,
    /// Project prefix of asset names
    #[serde(default = "default_project")]
    pub project: String,
    /// OS token matched against asset names
    #[serde(default = "default_os_token")]
    pub os: String,
    /// Timeout for the index query and for the download, in seconds
    #[serde(default = "default_download_timeout")]
    pub timeout: u64,
    /// Attempts for the index query and for the download
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Route release traffic through the phone proxy
    #[serde(default = "default_true")]
    pub use_proxy: bool,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            index_url: default_index_url(),
            project: default_project(),
            os: default_os_token(),
            timeout: default_download_timeout(),
            attempts: default_attempts(),
            use_proxy: true,
        }
    }
}

/// Tunnel process supervision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds to wait for the tunnel binary to become ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,
    /// Readiness poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: default_startup_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Session-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Workspace holding the binary, emitted config and logs
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// PID lock file guarding against concurrent sessions
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    /// Timeout for each service-manager call, in seconds
    #[serde(default = "default_service_timeout")]
    pub service_timeout: u64,
    /// Attempts for each service-manager call
    #[serde(default = "default_attempts")]
    pub service_attempts: u32,
    /// Desktop user to configure instead of auto-detecting one
    #[serde(default)]
    pub desktop_user: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            lock_file: default_lock_file(),
            service_timeout: default_service_timeout(),
            service_attempts: default_attempts(),
            desktop_user: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Minimum delay between printed status records, in milliseconds
    #[serde(default = "default_record_pace")]
    pub record_pace_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            record_pace_ms: default_record_pace(),
        }
    }
}

/// Proxy targets left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetsConfig {
    #[serde(default)]
    pub disabled: Vec<TargetKind>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| RwtError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Load from `$PDANET_RWT_CONFIG` or the default path, falling back to
    /// defaults when no file exists.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if path.exists() {
            log::debug!("Loading configuration from {}", path.display());
            Self::from_file(&path)
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RwtError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.proxy.host.is_empty() {
            return Err(RwtError::Config("Proxy host cannot be empty".to_string()));
        }

        if self.proxy.port == 0 {
            return Err(RwtError::Config("Proxy port cannot be zero".to_string()));
        }

        if self.tunnel.name.is_empty() || self.tunnel.name.len() >= 16 {
            return Err(RwtError::Config(
                "Tunnel name must be 1 to 15 characters".to_string(),
            ));
        }

        if self.tunnel.mtu < 576 || self.tunnel.mtu > 65535 {
            return Err(RwtError::Config(
                "MTU must be between 576 and 65535".to_string(),
            ));
        }

        // The tunnel subnet must not swallow the route to the phone
        let net = self.tunnel.network()?;
        if let Ok(host) = self.proxy.host.parse::<Ipv4Addr>() {
            if net.contains(&host) {
                return Err(RwtError::Config(format!(
                    "Tunnel subnet {net} contains the proxy host {host}"
                )));
            }
        }

        url::Url::parse(&self.release.index_url)
            .map_err(|e| RwtError::Config(format!("Invalid release index URL: {e}")))?;

        if self.release.attempts == 0 || self.session.service_attempts == 0 {
            return Err(RwtError::Config("Attempt counts must be at least 1".to_string()));
        }

        Ok(())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.release.timeout)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.session.service_timeout)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.startup_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor.poll_interval_ms)
    }

    pub fn record_pace(&self) -> Duration {
        Duration::from_millis(self.logging.record_pace_ms)
    }
}

impl FromStr for Config {
    type Err = RwtError;

    fn from_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_proxy_host() -> String {
    "192.168.49.1".to_string()
}

fn default_proxy_port() -> u16 {
    8000
}

fn default_proxy_scheme() -> String {
    "http".to_string()
}

fn default_tunnel_name() -> String {
    "tun0".to_string()
}

fn default_tunnel_address() -> String {
    "198.18.0.1/15".to_string()
}

fn default_mtu() -> u32 {
    8500
}

fn default_udp_mode() -> String {
    "udp".to_string()
}

fn default_tunnel_log_level() -> String {
    "debug".to_string()
}

fn default_tunnel_metric() -> u32 {
    1
}

fn default_fallback_metric() -> u32 {
    10
}

fn default_rp_filter_fallback() -> u8 {
    2
}

fn default_index_url() -> String {
    "https://api.github.com/repos/heiher/hev-socks5-tunnel/releases/latest".to_string()
}

fn default_project() -> String {
    "hev-socks5-tunnel".to_string()
}

fn default_os_token() -> String {
    "linux".to_string()
}

fn default_download_timeout() -> u64 {
    120
}

fn default_attempts() -> u32 {
    3
}

fn default_startup_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    100
}

fn default_workspace() -> PathBuf {
    PathBuf::from("/usr/local/bin/pdanet-rwt-bin")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/run/pdanet-rwt.pid")
}

fn default_service_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_record_pace() -> u64 {
    50
}

//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (`RIPPLE_HOST`, `RIPPLE_PORT`, `RIPPLE_BUS_URL`)
//! - TOML configuration file

use anyhow::{Context, Result};
use ripple_core::{Backoff, RelayConfig, RoomConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// First port to try.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of consecutive ports tried when the first one is taken.
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Keepalive configuration.
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Pub/sub bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum rooms per connection.
    #[serde(default = "default_max_rooms_per_connection")]
    pub max_rooms_per_connection: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Keepalive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Probe interval in milliseconds; 0 disables the probe.
    #[serde(default = "default_keepalive_interval")]
    pub interval_ms: u64,
}

/// Pub/sub bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus URL, e.g. `redis://127.0.0.1:6379`. Without one the server
    /// delivers to its own connections only.
    #[serde(default = "default_bus_url")]
    pub url: Option<String>,

    /// Delay before the first resubscription attempt.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound of the resubscription delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay.
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,

    /// Time allowed for one publish before the broadcast is dropped.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RIPPLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RIPPLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_port_attempts() -> u16 {
    10
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_rooms() -> usize {
    10_000
}

fn default_max_rooms_per_connection() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_keepalive_interval() -> u64 {
    25_000
}

fn default_bus_url() -> Option<String> {
    std::env::var("RIPPLE_BUS_URL")
        .ok()
        .filter(|url| !url.is_empty())
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_publish_timeout() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_attempts: default_port_attempts(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            keepalive: KeepaliveConfig::default(),
            bus: BusConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms: default_max_rooms(),
            max_rooms_per_connection: default_max_rooms_per_connection(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_keepalive_interval(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter_factor: default_jitter(),
            publish_timeout_ms: default_publish_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "ripple.toml",
            "/etc/ripple/ripple.toml",
            "~/.config/ripple/ripple.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Socket addresses to try, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn bind_addrs(&self) -> Result<Vec<SocketAddr>> {
        let ip: IpAddr = self
            .host
            .parse()
            .with_context(|| format!("Invalid host: {}", self.host))?;
        let attempts = self.port_attempts.max(1);
        Ok((0..attempts)
            .filter_map(|offset| self.port.checked_add(offset))
            .map(|port| SocketAddr::new(ip, port))
            .collect())
    }

    /// Settings of the server instance.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            rooms: RoomConfig {
                max_rooms: self.limits.max_rooms,
                max_rooms_per_connection: self.limits.max_rooms_per_connection,
            },
            keepalive_interval: (self.keepalive.interval_ms > 0)
                .then(|| Duration::from_millis(self.keepalive.interval_ms)),
            max_connections: self.limits.max_connections,
        }
    }

    /// Settings of the bus relay.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            backoff: Backoff {
                base_delay: Duration::from_millis(self.bus.base_delay_ms),
                max_delay: Duration::from_millis(self.bus.max_delay_ms.max(self.bus.base_delay_ms)),
                jitter_factor: self.bus.jitter_factor.clamp(0.0, 1.0),
            },
            publish_timeout: Duration::from_millis(self.bus.publish_timeout_ms.max(1)),
            ..RelayConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.port_attempts, 10);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.keepalive.interval_ms, 25_000);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addrs() {
        let config: Config = toml::from_str(
            r#"
            host = "127.0.0.1"
            port = 3000
            port_attempts = 3
        "#,
        )
        .unwrap();
        let ports: Vec<u16> = config.bind_addrs().unwrap().iter().map(SocketAddr::port).collect();
        assert_eq!(ports, vec![3000, 3001, 3002]);
    }

    #[test]
    fn test_bind_addrs_stop_at_last_port() {
        let config: Config = toml::from_str(
            r#"
            host = "0.0.0.0"
            port = 65535
        "#,
        )
        .unwrap();
        assert_eq!(config.bind_addrs().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_host() {
        let config: Config = toml::from_str(r#"host = "not an ip""#).unwrap();
        assert!(config.bind_addrs().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000
            max_rooms_per_connection = 5

            [keepalive]
            interval_ms = 0

            [bus]
            url = "redis://127.0.0.1:6379"
            base_delay_ms = 100
            max_delay_ms = 2000
            publish_timeout_ms = 250
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.bus.url.as_deref(), Some("redis://127.0.0.1:6379"));

        let server = config.server_config();
        assert_eq!(server.max_connections, 50000);
        assert_eq!(server.rooms.max_rooms_per_connection, 5);
        assert_eq!(server.keepalive_interval, None);

        let relay = config.relay_config();
        assert_eq!(relay.backoff.base_delay, Duration::from_millis(100));
        assert_eq!(relay.backoff.max_delay, Duration::from_secs(2));
        assert_eq!(relay.publish_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_relay_config_sanitized() {
        let mut config: Config = toml::from_str("").unwrap();
        config.bus.base_delay_ms = 1000;
        config.bus.max_delay_ms = 10;
        config.bus.jitter_factor = 3.0;
        config.bus.publish_timeout_ms = 0;

        let relay = config.relay_config();
        assert_eq!(relay.backoff.max_delay, Duration::from_secs(1));
        assert_eq!(relay.publish_timeout, Duration::from_millis(1));
        assert!((relay.backoff.jitter_factor - 1.0).abs() < f64::EPSILON);
    }
}

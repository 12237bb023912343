use octofhir_core::IdStrategy;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Criteria subscriptions and notification delivery
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        self.subscriptions.validate()
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Returns the base URL for the server.
    /// If `base_url` is configured, returns that; otherwise computes from host:port.
    pub fn base_url(&self) -> String {
        self.server
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}/fhir", self.server.host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// FHIR base URL; absolute references under it are treated as local.
    /// If not set, defaults to http://{host}:{port}/fhir
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How ids are assigned to subscriptions and written resources
    #[serde(default)]
    pub id_strategy: IdStrategy,
    /// Consecutive transport failures before a subscription moves to `error`
    #[serde(default = "default_max_delivery_failures")]
    pub max_delivery_failures: u32,
    /// Channel types accepted at registration
    #[serde(default = "default_supported_channels")]
    pub supported_channels: Vec<String>,
    #[serde(default)]
    pub store: SubscriptionStoreConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

fn default_true() -> bool {
    true
}
fn default_max_delivery_failures() -> u32 {
    3
}
fn default_supported_channels() -> Vec<String> {
    vec!["websocket".into()]
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            id_strategy: IdStrategy::default(),
            max_delivery_failures: default_max_delivery_failures(),
            supported_channels: default_supported_channels(),
            store: SubscriptionStoreConfig::default(),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl SubscriptionsConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_delivery_failures == 0 {
            return Err("subscriptions.max_delivery_failures must be > 0".into());
        }
        let known = ["websocket", "rest-hook", "email", "message"];
        if let Some(bad) = self
            .supported_channels
            .iter()
            .find(|c| !known.contains(&c.as_str()))
        {
            return Err(format!(
                "subscriptions.supported_channels: unknown channel type '{bad}'"
            ));
        }
        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            return Err("subscriptions.store.kind=file requires subscriptions.store.path".into());
        }
        if self.websocket.send_timeout_ms == 0 {
            return Err("subscriptions.websocket.send_timeout_ms must be > 0".into());
        }
        if self.websocket.outbound_buffer == 0 {
            return Err("subscriptions.websocket.outbound_buffer must be > 0".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubscriptionStoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// Directory holding one JSON document per subscription (file store only)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Interval between protocol-level pings; 0 disables heartbeats
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// How long a push waits for the frame to be written
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Frames queued per connection before pushes fail with backpressure
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_heartbeat_secs() -> u64 {
    30
}
fn default_send_timeout_ms() -> u64 {
    5_000
}
fn default_outbound_buffer() -> usize {
    64
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            send_timeout_ms: default_send_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl WebSocketConfig {
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("octofhir.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., OCTOFHIR__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("subscriptions.supported_channels"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

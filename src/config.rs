use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub udp: UdpConfig,

    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Bearer token sent to the receiver; optional.
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Global tenant applied to listeners that do not override it.
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    #[serde(default)]
    pub spooling: SpoolingConfig,

    #[serde(default)]
    pub soc: SocConfig,

    #[serde(default)]
    pub dev: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            udp: UdpConfig::default(),
            receiver: ReceiverConfig::default(),
            bearer_token: None,
            tenant_id: default_tenant_id(),
            spooling: SpoolingConfig::default(),
            soc: SocConfig::default(),
            dev: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,

    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

fn default_app_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_tenant_id() -> String {
    "default-tenant".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
        }
    }
}

fn default_api_port() -> u16 {
    8085
}

#[derive(Debug, Clone, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_udp_host")]
    pub host: String,

    /// Deprecated single-port form; expanded into `listeners` on load.
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub listeners: Vec<ListenerEntry>,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size_bytes: usize,

    /// 0 disables the line trigger.
    #[serde(default)]
    pub max_batch_lines: u64,

    /// 0 disables the byte trigger.
    #[serde(default)]
    pub max_batch_bytes: u64,

    #[serde(default = "default_batch_timeout_seconds")]
    pub batch_timeout_seconds: u64,

    #[serde(default = "default_true")]
    pub enable_compression: bool,

    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_udp_host(),
            port: 0,
            listeners: Vec::new(),
            read_buffer_size_bytes: default_read_buffer_size(),
            max_batch_lines: 0,
            max_batch_bytes: 0,
            batch_timeout_seconds: default_batch_timeout_seconds(),
            enable_compression: true,
            compression_level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerEntry {
    pub port: u16,

    pub dataset_id: String,

    /// Overrides the global tenant for this port when set.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_udp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_read_buffer_size() -> usize {
    64 * 1024
}

fn default_batch_timeout_seconds() -> u64 {
    30
}

fn default_compression_level() -> u32 {
    6
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// May contain literal `{tenantid}` and `{datasetid}` placeholders.
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_receiver_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_seconds: default_receiver_timeout_seconds(),
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

fn default_receiver_timeout_seconds() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpoolingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_spool_directory")]
    pub directory: String,

    #[serde(default = "default_spool_max_size")]
    pub max_size_bytes: u64,

    #[serde(default = "default_spool_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_spool_retry_interval")]
    pub retry_interval_seconds: u64,

    #[serde(default = "default_spool_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    /// When true, cleanup also removes records that exhausted their retries.
    /// Default keeps them on disk for manual recovery.
    #[serde(default)]
    pub cleanup_failed_records: bool,
}

impl Default for SpoolingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_spool_directory(),
            max_size_bytes: default_spool_max_size(),
            retry_attempts: default_spool_retry_attempts(),
            retry_interval_seconds: default_spool_retry_interval(),
            cleanup_interval_seconds: default_spool_cleanup_interval(),
            cleanup_failed_records: false,
        }
    }
}

fn default_spool_directory() -> String {
    "/var/lib/udp-spool-proxy/spool".to_string()
}

fn default_spool_max_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_spool_retry_attempts() -> u32 {
    5
}

fn default_spool_retry_interval() -> u64 {
    60
}

fn default_spool_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SocConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub endpoint: String,

    /// Request timeout in seconds; 0 falls back to 30.
    #[serde(default)]
    pub timeout: u64,
}

impl Config {
    /// Load config from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.apply_legacy_listener();
        config.validate()?;
        Ok(config)
    }

    /// Old configs name a single `udp.port`; expand it to one listener entry.
    fn apply_legacy_listener(&mut self) {
        if self.udp.listeners.is_empty() && self.udp.port > 0 {
            self.udp.listeners.push(ListenerEntry {
                port: self.udp.port,
                dataset_id: "default-dataset".to_string(),
                tenant_id: None,
            });
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.udp.enabled {
            if self.udp.listeners.is_empty() {
                return Err(ConfigError::Validation(
                    "udp is enabled but no listeners are configured".to_string(),
                ));
            }
            for entry in &self.udp.listeners {
                if entry.port == 0 {
                    return Err(ConfigError::Validation(
                        "listener port must be non-zero".to_string(),
                    ));
                }
                if entry.dataset_id.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "listener on port {} has an empty dataset_id",
                        entry.port
                    )));
                }
            }
            if self.receiver.base_url.is_empty() {
                return Err(ConfigError::Validation(
                    "receiver.base_url is required when udp is enabled".to_string(),
                ));
            }
            // Placeholders are not valid URL characters; validate the shape
            // with them substituted out.
            let probe = self
                .receiver
                .base_url
                .replace("{tenantid}", "t")
                .replace("{datasetid}", "d");
            url::Url::parse(&probe).map_err(|e| {
                ConfigError::Validation(format!("receiver.base_url is not a valid URL: {e}"))
            })?;
            if self.udp.compression_level > 9 {
                return Err(ConfigError::Validation(format!(
                    "compression_level must be 0-9, got {}",
                    self.udp.compression_level
                )));
            }
            if self.udp.read_buffer_size_bytes == 0 {
                return Err(ConfigError::Validation(
                    "read_buffer_size_bytes must be non-zero".to_string(),
                ));
            }
        }

        if self.soc.enabled && self.soc.endpoint.is_empty() {
            return Err(ConfigError::Validation(
                "soc.endpoint is required when soc is enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.udp.batch_timeout_seconds)
    }

    pub fn receiver_timeout(&self) -> Duration {
        Duration::from_secs(self.receiver.timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.receiver.retry_delay_seconds)
    }

    pub fn spool_retry_interval(&self) -> Duration {
        Duration::from_secs(self.spooling.retry_interval_seconds)
    }

    pub fn spool_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.spooling.cleanup_interval_seconds)
    }

    pub fn soc_timeout(&self) -> Duration {
        if self.soc.timeout == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(self.soc.timeout)
        }
    }

    /// Print the effective configuration (masking secrets).
    pub fn print_config(&self) {
        info!("App: {} {}", self.app.name, self.app.version);
        info!("API port: {}", self.server.api_port);
        if self.udp.enabled {
            info!(
                "UDP host: {}, read buffer: {} bytes, batch: lines={}, bytes={}, timeout={}s, gzip={} (level {})",
                self.udp.host,
                self.udp.read_buffer_size_bytes,
                self.udp.max_batch_lines,
                self.udp.max_batch_bytes,
                self.udp.batch_timeout_seconds,
                self.udp.enable_compression,
                self.udp.compression_level,
            );
            for entry in &self.udp.listeners {
                info!(
                    "  listener :{} -> dataset {} (tenant {})",
                    entry.port,
                    entry.dataset_id,
                    mask_secret(entry.tenant_id.as_deref().unwrap_or(&self.tenant_id)),
                );
            }
            info!(
                "Receiver: {} (timeout {}s, {} retries, {}s delay)",
                self.receiver.base_url,
                self.receiver.timeout_seconds,
                self.receiver.retry_count,
                self.receiver.retry_delay_seconds,
            );
        } else {
            info!("UDP ingest is disabled");
        }
        if self.spooling.enabled {
            info!(
                "Spool: {} (max {} bytes, {} attempts, retry every {}s, cleanup every {}s)",
                self.spooling.directory,
                self.spooling.max_size_bytes,
                self.spooling.retry_attempts,
                self.spooling.retry_interval_seconds,
                self.spooling.cleanup_interval_seconds,
            );
        } else {
            info!("Spooling is disabled");
        }
        info!("SOC alerts enabled: {}", self.soc.enabled);
    }
}

/// Mask a sensitive value for the config echo: `<first4>***<last4>`.
/// Values too short to keep anything secret are masked entirely.
pub fn mask_secret(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.chars().count() <= 8 {
        return "***".to_string();
    }
    let head: String = value.chars().take(4).collect();
    let tail: String = value
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{head}***{tail}")
}

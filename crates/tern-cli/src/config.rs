//! Configuration system for the Tern CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tern_reactor::{ConnectOptions, ReactorConfig};
use tern_transport::BindOptions;

/// Tern configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Reactor tuning
    #[serde(default)]
    pub reactor: ReactorConfig,
    /// Outbound connection (consume, ni-provide)
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Listening server (provide)
    #[serde(default)]
    pub server: ServerConfig,
    /// Handshake settings
    #[serde(default)]
    pub role: RoleConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Outbound connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Host to connect to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port or service name
    #[serde(default = "default_service")]
    pub service: String,
    /// Ping timeout requested from the server, in seconds
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Time allowed for the transport to become active, in seconds
    #[serde(default = "default_init_timeout_secs")]
    pub initialization_timeout_secs: u64,
    /// Reconnect attempts; -1 retries forever
    #[serde(default = "default_reconnect_attempt_limit")]
    pub reconnect_attempt_limit: i32,
    /// First reconnect delay, in milliseconds
    #[serde(default = "default_reconnect_min_delay_ms")]
    pub reconnect_min_delay_ms: u64,
    /// Largest reconnect delay, in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Send buffers the application may hold
    #[serde(default = "default_guaranteed_output_buffers")]
    pub guaranteed_output_buffers: usize,
    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

/// Listening server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Largest ping timeout granted, in seconds
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    /// Smallest ping timeout granted, in seconds
    #[serde(default = "default_min_ping_timeout_secs")]
    pub min_ping_timeout_secs: u64,
    /// Fragment size announced to clients
    #[serde(default = "default_max_fragment_size")]
    pub max_fragment_size: usize,
}

/// Handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Login user name
    #[serde(default = "default_user_name")]
    pub user_name: String,
    /// Login application id
    #[serde(default = "default_application_id")]
    pub application_id: String,
    /// Login stream id
    #[serde(default = "default_login_stream_id")]
    pub login_stream_id: i32,
    /// Directory stream id; 0 skips the directory request
    #[serde(default = "default_directory_stream_id")]
    pub directory_stream_id: i32,
    /// Download the dictionaries of the first service that lists any
    #[serde(default)]
    pub download_dictionaries: bool,
    /// Services offered by `provide` and published by `ni-provide`
    #[serde(default = "default_services")]
    pub services: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_host() -> String {
    "localhost".to_string()
}

fn default_service() -> String {
    "14002".to_string()
}

fn default_ping_timeout_secs() -> u64 {
    60
}

fn default_min_ping_timeout_secs() -> u64 {
    1
}

fn default_init_timeout_secs() -> u64 {
    60
}

fn default_reconnect_attempt_limit() -> i32 {
    -1
}

fn default_reconnect_min_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    5000
}

fn default_guaranteed_output_buffers() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:14002".to_string()
}

fn default_max_fragment_size() -> usize {
    tern_transport::tcp::DEFAULT_MAX_FRAGMENT_SIZE
}

fn default_user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "tern".to_string())
}

fn default_application_id() -> String {
    "256".to_string()
}

fn default_login_stream_id() -> i32 {
    1
}

fn default_directory_stream_id() -> i32 {
    2
}

fn default_services() -> Vec<String> {
    vec!["DIRECT_FEED".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            service: default_service(),
            ping_timeout_secs: default_ping_timeout_secs(),
            initialization_timeout_secs: default_init_timeout_secs(),
            reconnect_attempt_limit: default_reconnect_attempt_limit(),
            reconnect_min_delay_ms: default_reconnect_min_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            guaranteed_output_buffers: default_guaranteed_output_buffers(),
            tcp_nodelay: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ping_timeout_secs: default_ping_timeout_secs(),
            min_ping_timeout_secs: default_min_ping_timeout_secs(),
            max_fragment_size: default_max_fragment_size(),
        }
    }
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            user_name: default_user_name(),
            application_id: default_application_id(),
            login_stream_id: default_login_stream_id(),
            directory_stream_id: default_directory_stream_id(),
            download_dictionaries: false,
            services: default_services(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = self.to_toml()?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tern/config.toml")
    }

    /// Load from `path`, or from the default path if it exists, or defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be loaded.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Connect options described by `[connection]`
    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        let c = &self.connection;
        let mut opts = ConnectOptions::new(&c.host, &c.service);
        opts.ping_timeout = Duration::from_secs(c.ping_timeout_secs);
        opts.initialization_timeout = Duration::from_secs(c.initialization_timeout_secs);
        opts.reconnect_attempt_limit = c.reconnect_attempt_limit;
        opts.reconnect_min_delay = Duration::from_millis(c.reconnect_min_delay_ms);
        opts.reconnect_max_delay = Duration::from_millis(c.reconnect_max_delay_ms);
        opts.guaranteed_output_buffers = c.guaranteed_output_buffers;
        opts.tcp_nodelay = c.tcp_nodelay;
        opts
    }

    /// Bind options described by `[server]`
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be parsed.
    pub fn bind_options(&self) -> anyhow::Result<BindOptions> {
        let mut opts = BindOptions::new(self.parse_listen_addr()?);
        opts.ping_timeout = Duration::from_secs(self.server.ping_timeout_secs);
        opts.min_ping_timeout = Duration::from_secs(self.server.min_ping_timeout_secs);
        opts.max_fragment_size = self.server.max_fragment_size;
        Ok(opts)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.reactor.validate()?;
        self.connect_options().validate()?;
        self.parse_listen_addr()?;

        if self.server.min_ping_timeout_secs > self.server.ping_timeout_secs {
            anyhow::bail!("server min_ping_timeout_secs exceeds ping_timeout_secs");
        }
        if self.server.max_fragment_size == 0 {
            anyhow::bail!("server max_fragment_size must be positive");
        }

        if self.role.login_stream_id <= 0 {
            anyhow::bail!("login_stream_id must be positive");
        }
        if self.role.directory_stream_id < 0
            || self.role.directory_stream_id == self.role.login_stream_id
        {
            anyhow::bail!("directory_stream_id must be 0 (none) or a positive id other than the login stream");
        }
        if self.role.download_dictionaries && self.role.directory_stream_id == 0 {
            anyhow::bail!("download_dictionaries requires a directory stream");
        }
        if self.role.services.iter().any(String::is_empty) {
            anyhow::bail!("service names must not be empty");
        }
        if self.role.services.len() > usize::from(u16::MAX) {
            anyhow::bail!("too many services");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.server.listen_addr, "0.0.0.0:14002");
        assert_eq!(config.role.login_stream_id, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        config.role.directory_stream_id = config.role.login_stream_id;
        assert!(config.validate().is_err());
        config.role.directory_stream_id = 2;

        config.connection.reconnect_min_delay_ms = 10_000;
        assert!(config.validate().is_err());
        config.connection.reconnect_min_delay_ms = 100;

        config.server.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            host = "feed.example.com"

            [role]
            download_dictionaries = true
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.host, "feed.example.com");
        assert_eq!(config.connection.service, "14002");
        assert!(config.role.download_dictionaries);
        assert_eq!(config.reactor, ReactorConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.connection.reconnect_attempt_limit = 3;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.connection.reconnect_attempt_limit, 3);
        assert_eq!(loaded.server.listen_addr, config.server.listen_addr);
    }

    #[test]
    fn test_options_conversion() {
        let config = Config::default();
        let opts = config.connect_options();
        assert_eq!(opts.ping_timeout, Duration::from_secs(60));
        assert_eq!(opts.reconnect_attempt_limit, -1);

        let bind = config.bind_options().unwrap();
        assert_eq!(bind.addr.port(), 14002);
    }
}

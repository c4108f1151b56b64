//! Configuration module
//!
//! Handles loading and saving relay configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::handler::{HandlerRegistry, UnknownTagPolicy};
use crate::network::NetworkConfig as NetConfig;
use crate::protocol::{
    DEFAULT_BIND_ADDRESS, DEFAULT_GREETING, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT,
};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Security settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Framing and dispatch settings
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this server
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Close sessions idle for this many seconds (unset: never)
    pub idle_timeout_secs: Option<u64>,
    /// Grace period for sessions on shutdown, in ms
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_shutdown_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_secs: None,
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Serve over TLS
    #[serde(default)]
    pub tls: bool,
    /// Path to TLS certificate (PEM)
    pub certificate: Option<PathBuf>,
    /// Path to TLS private key (PKCS#8 PEM)
    pub key: Option<PathBuf>,
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum payload bytes in one frame
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    /// Greeting payload sent to each new connection
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Validate tags against the reserved and registered set
    #[serde(default)]
    pub strict_tags: bool,
    /// What to do with unknown tags when `strict_tags` is set
    #[serde(default)]
    pub unknown_tag_policy: UnknownTagPolicy,
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}

fn default_greeting() -> String {
    String::from_utf8_lossy(DEFAULT_GREETING).into_owned()
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
            greeting: default_greeting(),
            strict_tags: false,
            unknown_tag_policy: UnknownTagPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("dawnrelay/config.toml")),
            Some(PathBuf::from("./dawnrelay.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check settings that serde defaults cannot
    pub fn validate(&self) -> ConfigResult<()> {
        let security = &self.security;
        if security.tls && (security.certificate.is_none() || security.key.is_none()) {
            return Err(ConfigError::Invalid(
                "security.tls requires both certificate and key".to_string(),
            ));
        }
        if self.protocol.max_payload_size == 0 {
            return Err(ConfigError::Invalid(
                "protocol.max_payload_size must be greater than zero".to_string(),
            ));
        }
        if self.protocol.max_payload_size > u32::MAX as usize - 1 {
            return Err(ConfigError::Invalid(format!(
                "protocol.max_payload_size must fit the 4 byte length prefix (max {})",
                u32::MAX - 1
            )));
        }
        if self.protocol.greeting.len() > self.protocol.max_payload_size {
            return Err(ConfigError::Invalid(
                "protocol.greeting is larger than protocol.max_payload_size".to_string(),
            ));
        }
        Ok(())
    }

    /// Network settings for the server and client
    pub fn network_config(&self) -> NetConfig {
        let mut net = NetConfig::new(self.network.port)
            .with_bind_address(self.network.bind_address.clone())
            .with_max_payload_size(self.protocol.max_payload_size)
            .with_shutdown_timeout_ms(self.network.shutdown_timeout_ms)
            .with_greeting(self.protocol.greeting.clone().into_bytes());
        net.connect_timeout_ms = self.network.connect_timeout_ms;

        if let Some(secs) = self.network.idle_timeout_secs {
            net = net.with_idle_timeout(Duration::from_secs(secs));
        }
        if let (true, Some(cert), Some(key)) = (
            self.security.tls,
            self.security.certificate.clone(),
            self.security.key.clone(),
        ) {
            net = net.with_tls(cert, key);
        }
        net
    }

    /// An empty registry carrying the configured tag validation
    pub fn handler_registry(&self) -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        if self.protocol.strict_tags {
            registry.with_strict_tags(self.protocol.unknown_tag_policy)
        } else {
            registry
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "robot-relay".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            idle_timeout_secs: Some(300),
            ..Default::default()
        },
        security: SecurityConfig {
            tls: false,
            certificate: Some(PathBuf::from("/etc/dawnrelay/cert.pem")),
            key: Some(PathBuf::from("/etc/dawnrelay/key.pem")),
        },
        protocol: ProtocolConfig::default(),
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Dispatch;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.protocol.greeting, "cheese");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.network.port = 9000;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 9000);
        assert_eq!(loaded.protocol.max_payload_size, config.protocol.max_payload_size);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/dawnrelay.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [network]
            port = 9100
            idle_timeout_secs = 30

            [protocol]
            strict_tags = true
            unknown_tag_policy = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.network.port, 9100);
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.protocol.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);

        let net = config.network_config();
        assert_eq!(net.port, 9100);
        assert_eq!(net.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(net.greeting.as_ref(), b"cheese");
        assert!(!net.use_tls);

        let registry = config.handler_registry();
        assert!(matches!(registry.dispatch(200), Dispatch::Reject));
    }

    #[test]
    fn test_tls_requires_paths() {
        let mut config = Config::default();
        config.security.tls = true;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.security.certificate = Some(PathBuf::from("cert.pem"));
        config.security.key = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_ok());
        assert!(config.network_config().use_tls);
    }

    #[test]
    fn test_zero_payload_limit_invalid() {
        let mut config = Config::default();
        config.protocol.max_payload_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "robot-relay");
        assert_eq!(parsed.network.idle_timeout_secs, Some(300));
        assert!(parsed.validate().is_ok());
    }
}

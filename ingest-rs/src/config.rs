use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Keyed by the opaque API key carried in the `X-API-Key` header
    #[serde(default)]
    pub api_keys: BTreeMap<String, ApiKeyEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub hostname: String,
    pub max_message_size: usize,
    /// How many ports above `port` to try when it is already taken
    pub port_probe_range: u16,
    pub require_tls_for_auth: bool,
    /// Answer 550 instead of silently dropping messages with a bad API key
    pub reject_unknown_api_key: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mail_dir: String,
    pub log_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ApiKeyEntry {
    /// -1 means unlimited. Stored only, never enforced.
    #[serde(default = "unlimited")]
    pub daily_limit: i64,
    pub user: String,
    pub password: String,
}

fn unlimited() -> i64 {
    -1
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1025,
            hostname: "localhost".to_string(),
            max_message_size: 10 * 1024 * 1024, // 10MB
            port_probe_range: 25,
            require_tls_for_auth: false,
            reject_unknown_api_key: false,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "smtp.gmail.com".to_string(),
            port: 587,
            username: "your_email@gmail.com".to_string(),
            password: "your_app_password".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mail_dir: "received_mail".to_string(),
            log_dir: "email_logs".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The configuration written on first run, with one placeholder API key
    pub fn example() -> Self {
        let mut api_keys = BTreeMap::new();
        api_keys.insert(
            "your_api_key_here".to_string(),
            ApiKeyEntry {
                daily_limit: -1,
                user: "admin".to_string(),
                password: "your_secure_password".to_string(),
            },
        );

        Self {
            api_keys,
            ..Self::default()
        }
    }

    /// Load `path`, or write [`Config::example`] there first if it does not exist.
    ///
    /// Returns the configuration and whether the file was just created.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        let path = path.as_ref();
        if path.exists() {
            return Ok((Self::from_file(path)?, false));
        }

        let config = Self::example();
        config.write_to(path)?;
        info!("Created default configuration at {}", path.display());
        Ok((config, true))
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| GatewayError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| GatewayError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.smtp.host.trim().is_empty() {
            return Err(GatewayError::Config("smtp.host must not be empty".to_string()));
        }

        if self.smtp.tls_cert_path.is_some() != self.smtp.tls_key_path.is_some() {
            return Err(GatewayError::Config(
                "smtp.tls_cert_path and smtp.tls_key_path must be set together".to_string(),
            ));
        }

        if self.relay.enabled {
            if self.relay.host.trim().is_empty() {
                return Err(GatewayError::Config(
                    "relay.host is required when relay is enabled".to_string(),
                ));
            }
            if self.relay.timeout_secs == 0 {
                return Err(GatewayError::Config(
                    "relay.timeout_secs must be greater than zero".to_string(),
                ));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(GatewayError::Config(format!(
                "Unknown logging.format '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }
}

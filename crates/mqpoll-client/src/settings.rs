//! File and environment settings.
//!
//! Sources, lowest priority first:
//! - built-in defaults
//! - a TOML file, after `${VAR}` / `${VAR:-default}` substitution
//! - environment variables with the `MQPOLL__` prefix, double underscore
//!   for nesting (`MQPOLL__CONNECTION__SERVER_URI=tcp://broker:1883`)
//!
//! ```toml
//! [connection]
//! server_uri = "tcp://${MQTT_HOST:-localhost}:1883"
//! client_id = "sensor-7"
//! keep_alive = 30
//!
//! [log]
//! level = "debug"
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::address::ServerAddress;
use crate::config::{ConnectOptions, MqttVersion, TlsOptions, DEFAULT_MAX_INFLIGHT};
use crate::logging::LogConfig;

pub const DEFAULT_SERVER_URI: &str = "tcp://localhost:1883";
pub const DEFAULT_CLIENT_ID: &str = "mqpoll";

/// Settings error.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Logger error: {0}")]
    Logger(#[from] log::SetLoggerError),
}

/// Substitute `${VAR}` and `${VAR:-default}` from the environment.
fn substitute_env_vars(content: &str) -> Result<String, SettingsError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| SettingsError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub server_uri: String,
    /// Tried in order instead of `server_uri` when not empty.
    pub server_uris: Vec<String>,
    pub client_id: String,
    /// Seconds.
    pub keep_alive: u16,
    pub clean_session: bool,
    pub reliable: bool,
    pub max_inflight: usize,
    /// Seconds.
    pub connect_timeout: u64,
    /// Seconds.
    pub retry_interval: u64,
    /// 0 negotiates, 3 is MQTT 3.1, 4 is MQTT 3.1.1.
    pub mqtt_version: u8,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server_uri: DEFAULT_SERVER_URI.to_string(),
            server_uris: Vec::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive: 60,
            clean_session: true,
            reliable: true,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            connect_timeout: 30,
            retry_interval: 20,
            mqtt_version: 0,
            username: None,
            password: None,
        }
    }
}

/// Root settings structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogConfig,
    pub connection: ConnectionSettings,
    pub tls: Option<TlsOptions>,
}

impl Settings {
    /// Load settings from a TOML file (if it exists) with environment
    /// overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let defaults = ConnectionSettings::default();
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("connection.server_uri", defaults.server_uri)?
            .set_default("connection.client_id", defaults.client_id)?
            .set_default("connection.keep_alive", defaults.keep_alive as i64)?
            .set_default("connection.clean_session", defaults.clean_session)?
            .set_default("connection.reliable", defaults.reliable)?
            .set_default("connection.max_inflight", defaults.max_inflight as i64)?
            .set_default("connection.connect_timeout", defaults.connect_timeout as i64)?
            .set_default("connection.retry_interval", defaults.retry_interval as i64)?
            .set_default("connection.mqtt_version", defaults.mqtt_version as i64)?;

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQPOLL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string. Environment overrides do not
    /// apply.
    pub fn parse(content: &str) -> Result<Self, SettingsError> {
        let substituted = substitute_env_vars(content)?;
        let settings: Settings = toml::from_str(&substituted)
            .map_err(|e| SettingsError::Validation(format!("TOML parse error: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let connection = &self.connection;
        connection
            .server_uri
            .parse::<ServerAddress>()
            .map_err(|e| SettingsError::Validation(e.to_string()))?;
        if connection.client_id.contains('\0') {
            return Err(SettingsError::Validation(
                "client_id contains a NUL character".to_string(),
            ));
        }
        self.connect_options()?
            .validate()
            .map_err(|e| SettingsError::Validation(e.to_string()))
    }

    /// Build connect options from the connection and TLS sections.
    pub fn connect_options(&self) -> Result<ConnectOptions, SettingsError> {
        let connection = &self.connection;
        let version = match connection.mqtt_version {
            0 => MqttVersion::Default,
            3 => MqttVersion::V31,
            4 => MqttVersion::V311,
            other => {
                return Err(SettingsError::Validation(format!(
                    "mqtt_version must be 0, 3 or 4, got {}",
                    other
                )))
            }
        };

        let mut options = ConnectOptions::new()
            .keep_alive(connection.keep_alive)
            .clean_session(connection.clean_session)
            .reliable(connection.reliable)
            .max_inflight(connection.max_inflight)
            .connect_timeout(Duration::from_secs(connection.connect_timeout))
            .retry_interval(Duration::from_secs(connection.retry_interval))
            .server_uris(connection.server_uris.iter().cloned())
            .mqtt_version(version);

        match (&connection.username, &connection.password) {
            (Some(user), Some(password)) => {
                options = options.credentials(user.clone(), password.clone().into_bytes());
            }
            (Some(user), None) => options = options.username(user.clone()),
            (None, Some(_)) => {
                return Err(SettingsError::Validation(
                    "password given without username".to_string(),
                ))
            }
            (None, None) => {}
        }
        if let Some(tls) = &self.tls {
            options = options.tls(tls.clone());
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        let options = settings.connect_options().unwrap();
        assert_eq!(options.keep_alive, 60);
        assert_eq!(options.max_inflight, DEFAULT_MAX_INFLIGHT);
        assert_eq!(options.mqtt_version, MqttVersion::Default);
        assert!(options.tls.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[connection]
server_uri = "ssl://broker.local"
client_id = "sensor-7"
keep_alive = 30
clean_session = false
mqtt_version = 4
username = "alice"
password = "secret"

[tls]
server_name = "broker.example.com"
"#;
        let settings = Settings::parse(toml).unwrap();
        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.connection.client_id, "sensor-7");

        let options = settings.connect_options().unwrap();
        assert_eq!(options.keep_alive, 30);
        assert!(!options.clean_session);
        assert_eq!(options.mqtt_version, MqttVersion::V311);
        assert_eq!(options.username.as_deref(), Some("alice"));
        assert_eq!(options.password.as_deref(), Some(&b"secret"[..]));
        assert_eq!(
            options.tls.unwrap().server_name.as_deref(),
            Some("broker.example.com")
        );
    }

    #[test]
    fn test_parse_partial_toml() {
        let settings = Settings::parse("[connection]\nkeep_alive = 5\n").unwrap();
        assert_eq!(settings.connection.keep_alive, 5);
        assert_eq!(settings.connection.server_uri, DEFAULT_SERVER_URI);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn test_invalid_settings() {
        assert!(Settings::parse("[connection]\nmqtt_version = 5\n").is_err());
        assert!(Settings::parse("[connection]\nserver_uri = \"ws://x\"\n").is_err());
        assert!(Settings::parse("[connection]\npassword = \"p\"\n").is_err());
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("MQPOLL_TEST_UNSET_HOST");
        let content = r#"server_uri = "tcp://${MQPOLL_TEST_UNSET_HOST:-localhost}:1884""#;
        let substituted = substitute_env_vars(content).unwrap();
        assert!(substituted.contains("tcp://localhost:1884"));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mqpoll.toml");
        std::fs::write(&path, "[connection]\nclient_id = \"from-file\"\nkeep_alive = 15\n").unwrap();

        std::env::set_var("MQPOLL__CONNECTION__KEEP_ALIVE", "45");
        let settings = Settings::load(&path);
        std::env::remove_var("MQPOLL__CONNECTION__KEEP_ALIVE");

        let settings = settings.unwrap();
        assert_eq!(settings.connection.client_id, "from-file");
        assert_eq!(settings.connection.keep_alive, 45);
        assert_eq!(settings.connection.retry_interval, 20);
    }
}

//! Connect options.

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::address::ServerAddress;
use crate::error::{ClientError, Result};
use crate::will::Will;

/// In-flight window when `reliable` is off.
pub const DEFAULT_MAX_INFLIGHT: usize = 10;

/// Retries never go out more often than this, whatever `retry_interval` says.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Protocol level to request in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MqttVersion {
    /// Try 3.1.1, fall back to 3.1 if the broker refuses it.
    #[default]
    Default,
    V31,
    V311,
}

/// TLS settings for `ssl://` server URIs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// PEM file with trusted CA certificates. The bundled web PKI roots
    /// are used when unset.
    pub ca_cert: Option<String>,
    /// PEM client certificate chain for mutual TLS.
    pub client_cert: Option<String>,
    /// PEM private key matching `client_cert`.
    pub client_key: Option<String>,
    /// Name to verify the broker certificate against, if it differs from
    /// the host in the server URI.
    pub server_name: Option<String>,
    /// Skip certificate verification. Test setups only.
    pub accept_invalid_certs: bool,
}

/// Options for [`Client::connect`](crate::Client::connect).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Discard session state on connect and disconnect.
    pub clean_session: bool,
    /// Allow only one QoS 1/2 publish in flight at a time.
    pub reliable: bool,
    /// In-flight window when `reliable` is false.
    pub max_inflight: usize,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    /// Bound on each connect attempt.
    pub connect_timeout: Duration,
    /// Age at which an unacknowledged packet is sent again.
    pub retry_interval: Duration,
    /// Brokers to try in order. Empty means the URI the client was created
    /// with.
    pub server_uris: Vec<String>,
    pub mqtt_version: MqttVersion,
    pub tls: Option<TlsOptions>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive: 60,
            clean_session: true,
            reliable: true,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            will: None,
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(20),
            server_uris: Vec::new(),
            mqtt_version: MqttVersion::Default,
            tls: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Limit the in-flight window to a single message.
    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    /// Set the in-flight window used when not `reliable`.
    pub fn max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set username only.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn server_uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.server_uris = uris.into_iter().map(Into::into).collect();
        self
    }

    pub fn mqtt_version(mut self, version: MqttVersion) -> Self {
        self.mqtt_version = version;
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Effective in-flight window.
    pub fn inflight_window(&self) -> usize {
        if self.reliable {
            1
        } else {
            self.max_inflight.max(1)
        }
    }

    /// Effective retry age.
    pub fn effective_retry_interval(&self) -> Duration {
        self.retry_interval.max(MIN_RETRY_INTERVAL)
    }

    /// Check the options before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.password.is_some() && self.username.is_none() {
            return Err(ClientError::InvalidArgument(
                "password given without a username".to_string(),
            ));
        }
        if let Some(will) = &self.will {
            if will.topic.is_empty() {
                return Err(ClientError::InvalidArgument(
                    "will topic must not be empty".to_string(),
                ));
            }
            if will.topic.contains(['+', '#']) {
                return Err(ClientError::InvalidArgument(format!(
                    "will topic {:?} contains wildcards",
                    will.topic
                )));
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::InvalidArgument(
                "connect timeout must be positive".to_string(),
            ));
        }
        for uri in &self.server_uris {
            uri.parse::<ServerAddress>()?;
        }
        Ok(())
    }
}

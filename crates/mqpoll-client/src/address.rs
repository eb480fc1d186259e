//! Server URI parsing.
//!
//! Accepted forms: `tcp://host[:port]`, `ssl://host[:port]` and a bare
//! `host[:port]`. IPv6 literals are written in brackets, `[::1]:1883`.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{ClientError, Result};

/// Default MQTT port.
pub const MQTT_PORT: u16 = 1883;

/// Default MQTT-over-TLS port.
pub const MQTT_TLS_PORT: u16 = 8883;

/// A parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    /// `ssl://` scheme.
    pub tls: bool,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Resolve to the first socket address.
    pub fn resolve(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("could not resolve {}", self.host),
                )
            })
    }
}

impl FromStr for ServerAddress {
    type Err = ClientError;

    fn from_str(uri: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = uri.strip_prefix("tcp://") {
            (false, rest)
        } else if let Some(rest) = uri.strip_prefix("ssl://") {
            (true, rest)
        } else if uri.contains("://") {
            return Err(ClientError::InvalidArgument(format!(
                "unsupported scheme in {:?}",
                uri
            )));
        } else {
            (false, uri)
        };
        let default_port = if tls { MQTT_TLS_PORT } else { MQTT_PORT };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(|| {
                ClientError::InvalidArgument(format!("unterminated IPv6 literal in {:?}", uri))
            })?;
            let port = match after {
                "" => default_port,
                p => parse_port(p.strip_prefix(':').unwrap_or(p), uri)?,
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                // More than one colon without brackets is a bare IPv6 literal.
                Some((host, _)) if host.contains(':') => (rest, default_port),
                Some((host, port)) => (host, parse_port(port, uri)?),
                None => (rest, default_port),
            }
        };

        if host.is_empty() {
            return Err(ClientError::InvalidArgument(format!(
                "missing host in {:?}",
                uri
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

fn parse_port(port: &str, uri: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| ClientError::InvalidArgument(format!("invalid port in {:?}", uri)))
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(uri: &str) -> ServerAddress {
        uri.parse().unwrap()
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse("localhost"), ServerAddress::new("localhost", 1883));
        assert_eq!(parse("tcp://broker:1884"), ServerAddress::new("broker", 1884));
        assert_eq!(parse("10.0.0.1:99"), ServerAddress::new("10.0.0.1", 99));

        let tls = parse("ssl://secure");
        assert!(tls.tls);
        assert_eq!(tls.port, MQTT_TLS_PORT);
    }

    #[test]
    fn test_parse_ipv6() {
        assert_eq!(parse("[::1]:1885"), ServerAddress::new("::1", 1885));
        assert_eq!(parse("tcp://[fe80::1]"), ServerAddress::new("fe80::1", 1883));
        assert_eq!(parse("::1"), ServerAddress::new("::1", 1883));
    }

    #[test]
    fn test_parse_errors() {
        assert!("ws://host".parse::<ServerAddress>().is_err());
        assert!("host:notaport".parse::<ServerAddress>().is_err());
        assert!("[::1".parse::<ServerAddress>().is_err());
        assert!("tcp://:1883".parse::<ServerAddress>().is_err());
        assert!("host:70000".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(parse("[::1]:5").to_string(), "tcp://[::1]:5");
        assert_eq!(parse("ssl://h").to_string(), "ssl://h:8883");
    }

    #[test]
    fn test_resolve_loopback() {
        let addr = parse("127.0.0.1:4000").resolve().unwrap();
        assert_eq!(addr.port(), 4000);
        assert!(addr.ip().is_loopback());
    }
}

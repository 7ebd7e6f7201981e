//! Bind/connect addresses in the `tcp://host:port` form.

use std::fmt;
use std::str::FromStr;

/// The only transport scheme the service speaks.
pub const DEFAULT_PROTOCOL: &str = "tcp";

/// Well-known port for the call service.
pub const DEFAULT_PORT: u16 = 60606;

/// Servers listen on all interfaces unless told otherwise.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Clients connect to loopback unless told otherwise.
pub const DEFAULT_CONNECT_HOST: &str = "127.0.0.1";

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("invalid endpoint: {0}")]
    Invalid(String),
}

/// A `tcp://host:port` service address.
///
/// Parsing accepts the full form (`tcp://10.0.0.5:60606`) or the bare
/// authority (`10.0.0.5:60606`). Any scheme other than `tcp` is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// All-interfaces bind address on the well-known port.
    pub fn bind_default() -> Self {
        Self::bind_on(DEFAULT_PORT)
    }

    /// All-interfaces bind address on the given port.
    pub fn bind_on(port: u16) -> Self {
        Self::new(DEFAULT_BIND_HOST, port)
    }

    /// Loopback connect address on the well-known port.
    pub fn connect_default() -> Self {
        Self::connect_to(DEFAULT_PORT)
    }

    /// Loopback connect address on the given port.
    pub fn connect_to(port: u16) -> Self {
        Self::new(DEFAULT_CONNECT_HOST, port)
    }

    /// `host:port` form for socket APIs.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", DEFAULT_PROTOCOL, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = match s.split_once("://") {
            Some((scheme, rest)) => {
                if scheme != DEFAULT_PROTOCOL {
                    return Err(EndpointError::UnsupportedProtocol(scheme.to_string()));
                }
                rest
            }
            None => s,
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::Invalid(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| EndpointError::Invalid(s.to_string()))?;
        let host = if host.is_empty() {
            DEFAULT_BIND_HOST
        } else {
            host
        };

        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_parse() {
        let ep = Endpoint::new("10.1.2.3", 7777);
        let parsed: Endpoint = ep.to_string().parse().unwrap();
        assert_eq!(parsed, ep);
    }

    #[test]
    fn parses_bare_authority() {
        let ep: Endpoint = "localhost:60606".parse().unwrap();
        assert_eq!(ep, Endpoint::new("localhost", 60606));
    }

    #[test]
    fn rejects_other_schemes() {
        let err = "udp://0.0.0.0:1234".parse::<Endpoint>().unwrap_err();
        assert!(matches!(err, EndpointError::UnsupportedProtocol(s) if s == "udp"));
    }

    #[test]
    fn rejects_missing_port() {
        assert!("tcp://hostonly".parse::<Endpoint>().is_err());
        assert!("tcp://host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn empty_host_defaults_to_all_interfaces() {
        let ep: Endpoint = "tcp://:9000".parse().unwrap();
        assert_eq!(ep.host, DEFAULT_BIND_HOST);
        assert_eq!(ep.port, 9000);
    }

    #[test]
    fn defaults() {
        assert_eq!(Endpoint::bind_default().to_string(), "tcp://0.0.0.0:60606");
        assert_eq!(
            Endpoint::connect_default().to_string(),
            "tcp://127.0.0.1:60606"
        );
    }
}

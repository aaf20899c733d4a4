//! Endpoint descriptors
//!
//! Listeners and outbound connections are described with short strings in
//! the `protocol,address` form:
//!
//! - `tcp,3000` (port only; listeners bind every interface, connections go to
//!   localhost)
//! - `tcp,db.internal,5432`
//! - `tcp,db.internal:5432`, `tcp,[::1]:22`

use crate::error::TransportError;
use std::fmt;
use std::str::FromStr;

/// Supported protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Parsed endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub protocol: Protocol,
    pub host: Option<String>,
    pub port: u16,
}

impl Descriptor {
    /// Host to bind when used as a listener
    pub fn bind_host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }

    /// Host to dial when used as an outbound connection
    pub fn connect_host(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) if host.contains(':') => write!(f, "{},[{}]:{}", self.protocol, host, self.port),
            Some(host) => write!(f, "{},{}:{}", self.protocol, host, self.port),
            None => write!(f, "{},{}", self.protocol, self.port),
        }
    }
}

impl FromStr for Descriptor {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TransportError::InvalidDescriptor {
            descriptor: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.split(',').map(str::trim);
        let protocol = match parts.next() {
            Some(p) if p.eq_ignore_ascii_case("tcp") => Protocol::Tcp,
            Some("") | None => return Err(invalid("missing protocol")),
            Some(_) => return Err(invalid("unsupported protocol")),
        };

        let rest: Vec<&str> = parts.collect();
        let (host, port) = match rest.as_slice() {
            [addr] => split_host_port(addr).ok_or_else(|| invalid("expected port or host:port"))?,
            [host, port] => (Some(*host), *port),
            [] => return Err(invalid("missing address")),
            _ => return Err(invalid("too many fields")),
        };

        if let Some(h) = host {
            if h.is_empty() {
                return Err(invalid("host cannot be empty"));
            }
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("invalid port"))?;

        Ok(Descriptor {
            protocol,
            host: host.map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string()),
            port,
        })
    }
}

fn split_host_port(addr: &str) -> Option<(Option<&str>, &str)> {
    if addr.is_empty() {
        return None;
    }

    if let Some(stripped) = addr.strip_prefix('[') {
        let (host, port) = stripped.split_once("]:")?;
        return Some((Some(host), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => Some((Some(host), port)),
        None => Some((None, addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_only() {
        let d: Descriptor = "tcp,3000".parse().unwrap();
        assert_eq!(d.protocol, Protocol::Tcp);
        assert_eq!(d.host, None);
        assert_eq!(d.port, 3000);
        assert_eq!(d.bind_host(), "0.0.0.0");
        assert_eq!(d.connect_host(), "localhost");
    }

    #[test]
    fn test_host_colon_port() {
        let d: Descriptor = "tcp,host:22".parse().unwrap();
        assert_eq!(d.host.as_deref(), Some("host"));
        assert_eq!(d.port, 22);
        assert_eq!(d.to_string(), "tcp,host:22");
    }

    #[test]
    fn test_host_comma_port() {
        let d: Descriptor = "TCP,db.internal,5432".parse().unwrap();
        assert_eq!(d.host.as_deref(), Some("db.internal"));
        assert_eq!(d.port, 5432);
    }

    #[test]
    fn test_ipv6() {
        let d: Descriptor = "tcp,[::1]:22".parse().unwrap();
        assert_eq!(d.host.as_deref(), Some("::1"));
        assert_eq!(d.port, 22);
        assert_eq!(d.to_string(), "tcp,[::1]:22");
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!("".parse::<Descriptor>().is_err());
        assert!("udp,53".parse::<Descriptor>().is_err());
        assert!("tcp".parse::<Descriptor>().is_err());
        assert!("tcp,".parse::<Descriptor>().is_err());
        assert!("tcp,:22".parse::<Descriptor>().is_err());
        assert!("tcp,host:abc".parse::<Descriptor>().is_err());
        assert!("tcp,host:70000".parse::<Descriptor>().is_err());
        assert!("tcp,a,b,c".parse::<Descriptor>().is_err());
    }

    #[test]
    fn test_error_names_descriptor() {
        let err = "udp,53".parse::<Descriptor>().unwrap_err();
        assert!(err.to_string().contains("udp,53"));
        assert!(err.to_string().contains("unsupported protocol"));
    }
}

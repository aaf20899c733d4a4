use ipnetwork::IpNetwork;
use portmux_transport::Descriptor;
use std::net::IpAddr;
use std::str::FromStr;

/// Network and port allowlist for services peers may ask us to dial
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    networks: Vec<IpNetwork>,
    ports: Vec<u16>,
}

impl Allowlist {
    /// Create an allowlist from CIDR strings and port numbers
    ///
    /// An empty list leaves that dimension unrestricted.
    pub fn new(networks: Vec<String>, ports: Vec<u16>) -> Result<Self, String> {
        let mut parsed_networks = Vec::with_capacity(networks.len());

        for network_str in networks {
            let network = IpNetwork::from_str(&network_str)
                .map_err(|e| format!("Invalid CIDR notation '{}': {}", network_str, e))?;
            parsed_networks.push(network);
        }

        Ok(Self {
            networks: parsed_networks,
            ports,
        })
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Check a service descriptor (`tcp,host:port`)
    ///
    /// Returns the refusal reason sent back to the peer. Hostnames only pass
    /// when no network restriction is configured, since they cannot be
    /// matched against a CIDR before resolution.
    pub fn check(&self, service: &str) -> Result<(), String> {
        let descriptor = Descriptor::from_str(service).map_err(|e| e.to_string())?;

        if !self.is_port_allowed(descriptor.port) {
            return Err(format!("port {} is not allowed", descriptor.port));
        }

        if self.networks.is_empty() {
            return Ok(());
        }

        let host = descriptor.connect_host();
        let ip = match host {
            "localhost" => IpAddr::from([127, 0, 0, 1]),
            _ => IpAddr::from_str(host)
                .map_err(|_| format!("host '{}' must be an IP address", host))?,
        };

        if self.networks.iter().any(|network| network.contains(ip)) {
            Ok(())
        } else {
            Err(format!("address {} is not allowed", ip))
        }
    }

    pub fn is_allowed(&self, service: &str) -> bool {
        match self.check(service) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!("Service '{}' refused: {}", service, reason);
                false
            }
        }
    }

    fn is_port_allowed(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&port)
    }
}

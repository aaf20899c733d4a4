//! Configuration file and forward specifications

use anyhow::{Context, Result};
use portmux_transport::Descriptor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Peer to connect to (host:port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,

    /// Name checked against the peer certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// Local ports to forward
    #[serde(default)]
    pub forwards: Vec<ForwardEntry>,

    /// Settings for `portmux serve`
    #[serde(default)]
    pub serve: ServeSection,

    #[serde(default)]
    pub transport: TransportSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Local listen descriptor (e.g. `tcp,3000`)
    pub listen: String,

    /// Service the peer connects the channel to (e.g. `tcp,db.internal:5432`)
    pub service: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServeSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,

    /// Networks peers may ask us to dial (CIDR); empty allows any
    #[serde(default)]
    pub allow_networks: Vec<String>,

    /// Ports peers may ask us to dial; empty allows any
    #[serde(default)]
    pub allow_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    3
}

fn default_idle_timeout() -> u64 {
    10
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keep_alive_secs: default_keep_alive(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl TransportSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Load configuration from a YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// One validated forward: `id=listen=service`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub id: String,
    pub listen: String,
    pub service: String,
}

impl ForwardSpec {
    fn new(id: Option<&str>, listen: &str, service: &str) -> Result<Self> {
        Descriptor::from_str(listen)
            .with_context(|| format!("Invalid listen descriptor: {}", listen))?;
        Descriptor::from_str(service)
            .with_context(|| format!("Invalid service descriptor: {}", service))?;

        let id = match id {
            Some(id) if id.is_empty() => anyhow::bail!("Forward id cannot be empty"),
            Some(id) => id.to_string(),
            None => generated_id(),
        };

        Ok(Self {
            id,
            listen: listen.to_string(),
            service: service.to_string(),
        })
    }
}

impl FromStr for ForwardSpec {
    type Err = anyhow::Error;

    /// Parse `id=listen=service` or `listen=service`
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('=').map(str::trim).collect();
        match parts.as_slice() {
            [id, listen, service] => Self::new(Some(id), listen, service),
            [listen, service] => Self::new(None, listen, service),
            _ => anyhow::bail!(
                "Invalid forward '{}' (expected id=listen=service, e.g. db=tcp,5432=tcp,db.internal:5432)",
                s
            ),
        }
    }
}

impl TryFrom<&ForwardEntry> for ForwardSpec {
    type Error = anyhow::Error;

    fn try_from(entry: &ForwardEntry) -> Result<Self> {
        Self::new(entry.id.as_deref(), &entry.listen, &entry.service)
    }
}

fn generated_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("fwd-{}", &uuid[..8])
}

/// Forwards from the config file followed by the ones given on the command
/// line
pub fn merge_forwards(file: &[ForwardEntry], cli: &[String]) -> Result<Vec<ForwardSpec>> {
    let mut specs = Vec::with_capacity(file.len() + cli.len());

    for entry in file {
        specs.push(
            ForwardSpec::try_from(entry)
                .with_context(|| format!("Invalid forward in config file: {:?}", entry))?,
        );
    }
    for raw in cli {
        specs.push(raw.parse()?);
    }

    Ok(specs)
}

/// Validate a `host:port` address
pub fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        )
    })?;

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

/// Host part of `host:port`, used as the TLS server name
pub fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']')
}

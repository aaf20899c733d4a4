//! portmux - local port forwarding over a QUIC multiplexed connection
//!
//! `portmux forward` listens on local ports and carries every accepted
//! connection to the peer on its own channel; `portmux serve` accepts peers
//! and connects each channel to the service it names.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{host_of, load_config_file, merge_forwards, validate_address, ConfigFile};
use portmux_forward::{CopyRelay, ForwardService, ServiceHandle};
use portmux_transport::{Endpoint, ExecContext, TcpTransport, TcpTransportConfig};
use portmux_transport_quic::{
    serve_channels, Allowlist, ChannelRequestHandler, QuicConfig, QuicConnector, QuicPeerListener,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// portmux - forward local ports over a multiplexed QUIC connection
#[derive(Parser, Debug)]
#[command(name = "portmux")]
#[command(about = "portmux - forward local ports over a multiplexed QUIC connection")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "PORTMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "PORTMUX_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a peer and forward local ports through it
    #[command(long_about = r#"
Connect to a portmux peer and forward local ports through it. Every
connection accepted on a local port rides its own channel to the peer,
which connects it to the service named by the forward.

EXAMPLES:
  # Forward local port 5432 to db.internal:5432 as seen from the peer
  portmux forward --peer relay.example.com:4433 \
    -L db=tcp,5432=tcp,db.internal:5432

  # Several forwards, peer using a self-signed certificate
  portmux forward --peer 10.0.0.5:4433 --insecure \
    -L ssh=tcp,2222=tcp,localhost:22 \
    -L web=tcp,8080=tcp,localhost:80

  # Forwards from a config file
  portmux --config portmux.yaml forward

ENVIRONMENT VARIABLES:
  PORTMUX_PEER       Peer address (host:port)
  PORTMUX_CONFIG     Configuration file
  PORTMUX_LOG_LEVEL  Log level
    "#)]
    Forward {
        /// Peer address (e.g., relay.example.com:4433)
        #[arg(long, env = "PORTMUX_PEER")]
        peer: Option<String>,

        /// Name checked against the peer certificate (defaults to the peer host)
        #[arg(long)]
        server_name: Option<String>,

        /// Local forward: [id=]listen=service (e.g., db=tcp,5432=tcp,db.internal:5432)
        #[arg(short = 'L', long = "local")]
        forwards: Vec<String>,

        /// Skip certificate verification (insecure, for development only)
        #[arg(long)]
        insecure: bool,

        /// Also accept channels opened by the peer and connect them locally
        #[arg(long)]
        accept_remote: bool,

        /// Networks the peer may ask us to connect to (with --accept-remote)
        #[arg(long = "allow-network")]
        allow_networks: Vec<String>,

        /// Ports the peer may ask us to connect to (with --accept-remote)
        #[arg(long = "allow-port")]
        allow_ports: Vec<u16>,
    },

    /// Accept peers and connect their channels to the services they name
    #[command(long_about = r#"
Accept portmux peers over QUIC. Each channel a peer opens names a service
(e.g. tcp,db.internal:5432); portmux connects to it and forwards the
channel. Without --cert/--key a self-signed certificate is generated.

EXAMPLES:
  portmux serve --bind 0.0.0.0:4433

  # Only allow targets on the private network, SSH and PostgreSQL
  portmux serve --bind 0.0.0.0:4433 \
    --cert server.pem --key server.key \
    --allow-network 10.0.0.0/8 --allow-port 22 --allow-port 5432
    "#)]
    Serve {
        /// Address to accept peers on
        #[arg(long, env = "PORTMUX_BIND")]
        bind: Option<String>,

        /// TLS certificate (PEM)
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// TLS private key (PEM)
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,

        /// Networks peers may ask us to connect to (CIDR, repeatable)
        #[arg(long = "allow-network")]
        allow_networks: Vec<String>,

        /// Ports peers may ask us to connect to (repeatable)
        #[arg(long = "allow-port")]
        allow_ports: Vec<u16>,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Hands channels opened by the peer to the forwarding service
struct RemoteChannels {
    service: ServiceHandle,
    context: ExecContext,
}

impl ChannelRequestHandler for RemoteChannels {
    fn handle(&self, channel: Box<dyn Endpoint>, service: String, id: String) {
        info!("Peer opened channel {} to {}", id, service);
        if let Err(e) = self
            .service
            .remote_connection(self.context.clone(), channel, &service, &id)
        {
            warn!("Dropping channel {}: {}", id, e);
        }
    }
}

fn tcp_transport(config: &ConfigFile) -> Arc<TcpTransport> {
    Arc::new(TcpTransport::new(
        TcpTransportConfig::default().with_connect_timeout(config.transport.connect_timeout()),
    ))
}

fn build_allowlist(networks: Vec<String>, ports: Vec<u16>) -> Result<Allowlist> {
    Allowlist::new(networks, ports)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid allowlist")
}

#[allow(clippy::too_many_arguments)]
async fn run_forward(
    config: ConfigFile,
    peer: Option<String>,
    server_name: Option<String>,
    forwards: Vec<String>,
    insecure: bool,
    accept_remote: bool,
    allow_networks: Vec<String>,
    allow_ports: Vec<u16>,
) -> Result<()> {
    // CLI args override config file
    let peer = peer
        .or(config.peer.clone())
        .ok_or_else(|| anyhow::anyhow!("Peer address is required (use --peer or config file)"))?;
    validate_address(&peer, "peer")?;
    let server_name = server_name
        .or(config.server_name.clone())
        .unwrap_or_else(|| host_of(&peer).to_string());

    let forwards = merge_forwards(&config.forwards, &forwards)?;
    if forwards.is_empty() && !accept_remote {
        anyhow::bail!("Nothing to do: give at least one -L forward or --accept-remote");
    }

    let quic_config = if insecure {
        warn!("Certificate verification disabled (insecure mode)");
        QuicConfig::client_insecure()
    } else {
        QuicConfig::client_default()
    }
    .with_keep_alive(config.transport.keep_alive())
    .with_idle_timeout(config.transport.idle_timeout());

    let context = ExecContext::current();
    let connector =
        QuicConnector::new(Arc::new(quic_config)).context("Failed to create QUIC endpoint")?;
    let session = connector
        .connect(&peer, &server_name, context.clone())
        .await
        .with_context(|| format!("Failed to connect to peer {}", peer))?;

    info!("Connected to peer {}", peer);

    let mut service = ForwardService::new(
        tcp_transport(&config),
        Arc::new(CopyRelay::new(context.clone())),
    );
    for forward in &forwards {
        info!(
            "Forward {}: {} -> {}",
            forward.id, forward.listen, forward.service
        );
        service
            .register(
                context.clone(),
                &forward.listen,
                &forward.service,
                &forward.id,
            )
            .with_context(|| format!("Failed to register forward {}", forward.id))?;
    }
    service
        .start_all(Arc::new(session.clone()))
        .context("Failed to start forwarding")?;

    let stop = CancellationToken::new();

    if accept_remote {
        let allowlist = build_allowlist(allow_networks, allow_ports)?;
        let handler = Arc::new(RemoteChannels {
            service: service.handle(),
            context: context.clone(),
        });
        tokio::spawn(serve_channels(
            session.clone(),
            Arc::new(allowlist),
            handler,
            stop.clone(),
        ));
    }

    let service_task = tokio::spawn(service.run(stop.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            session.close(0, "shutdown");
        }
        reason = session.closed() => {
            error!("Connection to peer lost: {}", reason);
        }
    }

    stop.cancel();
    service_task.await.context("Forwarding task panicked")?;

    info!("portmux stopped");
    Ok(())
}

async fn run_serve(
    config: ConfigFile,
    bind: Option<String>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    allow_networks: Vec<String>,
    allow_ports: Vec<u16>,
) -> Result<()> {
    let serve = config.serve;
    let bind = bind
        .or(serve.bind)
        .unwrap_or_else(|| "0.0.0.0:4433".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", bind))?;

    let networks = if allow_networks.is_empty() {
        serve.allow_networks
    } else {
        allow_networks
    };
    let ports = if allow_ports.is_empty() {
        serve.allow_ports
    } else {
        allow_ports
    };
    let allowlist = Arc::new(build_allowlist(networks, ports)?);

    let quic_config = match (cert.or(serve.cert), key.or(serve.key)) {
        (Some(cert), Some(key)) => QuicConfig::server_default(cert, key),
        (None, None) => {
            warn!("No certificate configured, using a self-signed certificate");
            QuicConfig::server_self_signed(Vec::new())
        }
        _ => anyhow::bail!("Both a certificate and a key are required"),
    }
    .with_keep_alive(config.transport.keep_alive())
    .with_idle_timeout(config.transport.idle_timeout());

    let listener = QuicPeerListener::bind(bind_addr, Arc::new(quic_config))
        .with_context(|| format!("Failed to listen on {}", bind_addr))?;

    let context = ExecContext::current();
    let service = ForwardService::new(
        Arc::new(TcpTransport::new(
            TcpTransportConfig::default().with_connect_timeout(config.transport.connect_timeout()),
        )),
        Arc::new(CopyRelay::new(context.clone())),
    );
    let handler: Arc<dyn ChannelRequestHandler> = Arc::new(RemoteChannels {
        service: service.handle(),
        context: context.clone(),
    });

    let stop = CancellationToken::new();
    let service_task = tokio::spawn(service.run(stop.clone()));

    info!("Accepting peers on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            accepted = listener.accept(&context) => {
                let session = match accepted {
                    Ok(session) => session,
                    Err(e) => {
                        error!("Peer listener stopped: {}", e);
                        break;
                    }
                };
                info!("Peer connected from {}", session.remote_address());
                tokio::spawn(serve_channels(
                    session,
                    allowlist.clone(),
                    handler.clone(),
                    stop.clone(),
                ));
            }
        }
    }

    listener.close();
    stop.cancel();
    service_task.await.context("Forwarding task panicked")?;

    info!("portmux stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Forward {
            peer,
            server_name,
            forwards,
            insecure,
            accept_remote,
            allow_networks,
            allow_ports,
        } => {
            run_forward(
                config,
                peer,
                server_name,
                forwards,
                insecure,
                accept_remote,
                allow_networks,
                allow_ports,
            )
            .await
        }
        Commands::Serve {
            bind,
            cert,
            key,
            allow_networks,
            allow_ports,
        } => run_serve(config, bind, cert, key, allow_networks, allow_ports).await,
    }
}

//! QUIC peer listener and connector

use crate::allowlist::Allowlist;
use crate::config::QuicConfig;
use crate::session::{QuicChannel, QuicMuxSession, HANDSHAKE_TIMEOUT};
use crate::stream::QuicStream;
use portmux_proto::{read_message, write_message, ChannelMessage, PROTOCOL_VERSION};
use portmux_transport::{Endpoint, ExecContext, TransportError, TransportResult};
use quinn::Endpoint as QuinnEndpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receiver of channels opened by the peer
///
/// `service` is the target the peer asked for, already checked against the
/// allowlist; `id` identifies the channel in diagnostics.
pub trait ChannelRequestHandler: Send + Sync {
    fn handle(&self, channel: Box<dyn Endpoint>, service: String, id: String);
}

/// QUIC listener accepting peer connections
#[derive(Debug)]
pub struct QuicPeerListener {
    endpoint: QuinnEndpoint,
}

impl QuicPeerListener {
    pub fn bind(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;
        let server_config = config.build_server_config()?;

        let endpoint =
            QuinnEndpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;
        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    /// Accept the next peer connection
    ///
    /// Failed handshakes are logged and skipped.
    pub async fn accept(&self, context: &ExecContext) -> TransportResult<QuicMuxSession> {
        loop {
            let incoming = self.endpoint.accept().await.ok_or(TransportError::Closed)?;
            let remote = incoming.remote_address();

            debug!("Incoming QUIC connection from {}", remote);

            match incoming.await {
                Ok(connection) => {
                    info!("QUIC connection established from {}", remote);
                    return Ok(QuicMuxSession::new(connection, context.clone()));
                }
                Err(e) => {
                    error!("Failed to establish QUIC connection from {}: {}", remote, e);
                    continue;
                }
            }
        }
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"listener closed");
        info!("QUIC listener closed");
    }
}

/// QUIC connector for establishing the session to a peer
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: QuinnEndpoint,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        config.validate()?;
        let client_config = config.build_client_config()?;

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut endpoint = QuinnEndpoint::client(bind_addr).map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint })
    }

    /// Connect to `peer` (`host:port`), verifying the certificate for
    /// `server_name`
    pub async fn connect(
        &self,
        peer: &str,
        server_name: &str,
        context: ExecContext,
    ) -> TransportResult<QuicMuxSession> {
        let addr = tokio::net::lookup_host(peer)
            .await?
            .next()
            .ok_or_else(|| TransportError::ConnectionError(format!("cannot resolve {}", peer)))?;

        debug!("Connecting to QUIC peer: {} ({})", server_name, addr);

        let connection = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        info!("QUIC connection established to {} ({})", server_name, addr);

        Ok(QuicMuxSession::new(connection, context))
    }
}

/// Accept channels the peer opens on `session` until it goes away
///
/// Each channel must start with `Open { service }`. Services outside the
/// allowlist are refused with `Rejected`; the others are acknowledged and
/// handed to `handler` as already-open endpoints.
pub async fn serve_channels(
    session: QuicMuxSession,
    allowlist: Arc<Allowlist>,
    handler: Arc<dyn ChannelRequestHandler>,
    stop: CancellationToken,
) {
    let peer = session.remote_address();

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = session.connection().accept_bi() => accepted,
        };

        let (send, recv) = match accepted {
            Ok(streams) => streams,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::ConnectionClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(peer = %peer, "QUIC session closed");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, "QUIC session ended: {}", e);
                break;
            }
        };

        let allowlist = allowlist.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let stream = QuicStream::new(send, recv);
            let id = format!("{}#{}", peer, stream.stream_id());

            match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_channel(stream, &allowlist)).await
            {
                Ok(Ok((stream, service))) => {
                    let channel = QuicChannel::accepted(stream, &service);
                    handler.handle(Box::new(channel), service, id);
                }
                Ok(Err(e)) => warn!(channel = %id, "Refused channel: {}", e),
                Err(_) => warn!(channel = %id, "Channel handshake timed out"),
            }
        });
    }
}

async fn accept_channel(
    mut stream: QuicStream,
    allowlist: &Allowlist,
) -> TransportResult<(QuicStream, String)> {
    let request = read_message(&mut stream)
        .await
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

    let service = match request {
        ChannelMessage::Open { version, service } if version == PROTOCOL_VERSION => service,
        ChannelMessage::Open { version, .. } => {
            let reason = format!("unsupported protocol version {}", version);
            reject(&mut stream, &reason).await;
            return Err(TransportError::ProtocolError(reason));
        }
        other => {
            return Err(TransportError::ProtocolError(format!(
                "expected channel open, got {:?}",
                other
            )))
        }
    };

    if let Err(reason) = allowlist.check(&service) {
        reject(&mut stream, &reason).await;
        return Err(TransportError::Rejected(reason));
    }

    write_message(&mut stream, &ChannelMessage::Accepted)
        .await
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

    Ok((stream, service))
}

async fn reject(stream: &mut QuicStream, reason: &str) {
    if let Err(e) = write_message(stream, &ChannelMessage::rejected(reason)).await {
        debug!("Failed to send channel rejection: {}", e);
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use portmux_transport::{EndpointEvent, EndpointHandler, MuxSession};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    struct ForwardChannels(mpsc::UnboundedSender<(Box<dyn Endpoint>, String)>);

    impl ChannelRequestHandler for ForwardChannels {
        fn handle(&self, channel: Box<dyn Endpoint>, service: String, _id: String) {
            let _ = self.0.send((channel, service));
        }
    }

    #[derive(Default)]
    struct OpenWaiter {
        result: Mutex<Option<TransportResult<()>>>,
        notify: tokio::sync::Notify,
    }

    impl EndpointHandler for OpenWaiter {
        fn handle(&self, event: EndpointEvent) {
            if let EndpointEvent::OpenDone(result) = event {
                *self.result.lock().unwrap() = Some(result);
                self.notify.notify_one();
            }
        }
    }

    async fn connected_pair(
        allowlist: Allowlist,
    ) -> (
        QuicMuxSession,
        mpsc::UnboundedReceiver<(Box<dyn Endpoint>, String)>,
        CancellationToken,
    ) {
        let context = ExecContext::current();
        let server_config = Arc::new(QuicConfig::server_self_signed(Vec::new()));
        let listener =
            QuicPeerListener::bind("127.0.0.1:0".parse().unwrap(), server_config).unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let server_stop = stop.clone();
        let server_context = context.clone();
        tokio::spawn(async move {
            let session = listener.accept(&server_context).await.unwrap();
            serve_channels(
                session,
                Arc::new(allowlist),
                Arc::new(ForwardChannels(tx)),
                server_stop,
            )
            .await;
        });

        let connector = QuicConnector::new(Arc::new(QuicConfig::client_insecure())).unwrap();
        let session = connector
            .connect(&addr.to_string(), "localhost", context)
            .await
            .unwrap();

        (session, rx, stop)
    }

    #[tokio::test]
    async fn test_channel_open_and_data() {
        let (session, mut rx, stop) = connected_pair(Allowlist::allow_all()).await;

        let waiter = Arc::new(OpenWaiter::default());
        let mut channel = session.alloc_channel(waiter.clone()).unwrap();
        channel.set_service("tcp,127.0.0.1:22").unwrap();
        channel.open().unwrap();

        waiter.notify.notified().await;
        assert!(matches!(
            waiter.result.lock().unwrap().as_ref(),
            Some(Ok(()))
        ));

        let (mut remote, service) = rx.recv().await.unwrap();
        assert_eq!(service, "tcp,127.0.0.1:22");

        let mut local_io = channel.take_stream().unwrap().io;
        let mut remote_io = remote.take_stream().unwrap().io;

        local_io.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        stop.cancel();
    }

    #[tokio::test]
    async fn test_channel_rejected_by_allowlist() {
        let allowlist = Allowlist::new(vec!["10.0.0.0/8".to_string()], vec![]).unwrap();
        let (session, _rx, stop) = connected_pair(allowlist).await;

        let waiter = Arc::new(OpenWaiter::default());
        let mut channel = session.alloc_channel(waiter.clone()).unwrap();
        channel.set_service("tcp,192.168.1.1:22").unwrap();
        channel.open().unwrap();

        waiter.notify.notified().await;
        let result = waiter.result.lock().unwrap().take().unwrap();
        assert!(matches!(result, Err(TransportError::Rejected(_))));

        stop.cancel();
    }

    #[tokio::test]
    async fn test_open_without_service_fails() {
        let (session, _rx, stop) = connected_pair(Allowlist::allow_all()).await;

        let mut channel = session
            .alloc_channel(Arc::new(OpenWaiter::default()))
            .unwrap();
        assert!(matches!(
            channel.open(),
            Err(TransportError::ConfigurationError(_))
        ));

        stop.cancel();
    }
}

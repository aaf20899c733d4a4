//! QUIC connection as a multiplexed session

use crate::stream::QuicStream;
use portmux_proto::{read_message, write_message, ChannelMessage};
use portmux_transport::{
    Endpoint, EndpointEvent, EndpointHandler, EndpointStream, ExecContext, MuxSession,
    TransportError, TransportResult,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

/// How long the peer gets to answer a channel open
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared QUIC connection handing out channels
#[derive(Debug, Clone)]
pub struct QuicMuxSession {
    connection: quinn::Connection,
    context: ExecContext,
    session_id: String,
}

impl QuicMuxSession {
    pub fn new(connection: quinn::Connection, context: ExecContext) -> Self {
        let session_id = format!("quic-{}", connection.stable_id());
        Self {
            connection,
            context,
            session_id,
        }
    }

    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    /// Wait until the peer connection is gone
    pub async fn closed(&self) -> quinn::ConnectionError {
        self.connection.closed().await
    }

    pub fn close(&self, error_code: u32, reason: &str) {
        self.connection
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());
        debug!(
            session = %self.session_id,
            "QUIC session closed: {} (code: {})", reason, error_code
        );
    }
}

impl MuxSession for QuicMuxSession {
    fn alloc_channel(
        &self,
        handler: Arc<dyn EndpointHandler>,
    ) -> TransportResult<Box<dyn Endpoint>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        Ok(Box::new(QuicChannel::outbound(
            self.connection.clone(),
            self.context.clone(),
            handler,
        )))
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.session_id, self.remote_address())
    }
}

/// One channel (bidirectional stream) on a QUIC session
pub struct QuicChannel {
    description: String,
    stream: Arc<Mutex<Option<QuicStream>>>,
    pending: Option<PendingOpen>,
    released: CancellationToken,
    _release_guard: DropGuard,
}

struct PendingOpen {
    connection: quinn::Connection,
    context: ExecContext,
    handler: Arc<dyn EndpointHandler>,
    service: Option<String>,
    requested: bool,
}

impl QuicChannel {
    fn outbound(
        connection: quinn::Connection,
        context: ExecContext,
        handler: Arc<dyn EndpointHandler>,
    ) -> Self {
        let released = CancellationToken::new();
        Self {
            description: format!("quic channel to {}", connection.remote_address()),
            stream: Arc::new(Mutex::new(None)),
            pending: Some(PendingOpen {
                connection,
                context,
                handler,
                service: None,
                requested: false,
            }),
            _release_guard: released.clone().drop_guard(),
            released,
        }
    }

    /// Wrap a channel the peer opened and we already accepted
    pub fn accepted(stream: QuicStream, service: &str) -> Self {
        let released = CancellationToken::new();
        Self {
            description: format!("quic channel {} for {}", stream.stream_id(), service),
            stream: Arc::new(Mutex::new(Some(stream))),
            pending: None,
            _release_guard: released.clone().drop_guard(),
            released,
        }
    }
}

impl fmt::Debug for QuicChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicChannel")
            .field("description", &self.description)
            .finish()
    }
}

impl Endpoint for QuicChannel {
    fn set_service(&mut self, service: &str) -> TransportResult<()> {
        match self.pending.as_mut() {
            Some(pending) if !pending.requested => {
                pending.service = Some(service.to_string());
                Ok(())
            }
            _ => Err(TransportError::AlreadyOpen),
        }
    }

    fn open(&mut self) -> TransportResult<()> {
        let pending = match self.pending.as_mut() {
            Some(pending) if !pending.requested => pending,
            _ => return Err(TransportError::AlreadyOpen),
        };
        let service = pending.service.clone().ok_or_else(|| {
            TransportError::ConfigurationError("channel service not set".to_string())
        })?;
        pending.requested = true;

        let connection = pending.connection.clone();
        let handler = pending.handler.clone();
        let slot = self.stream.clone();
        let released = self.released.clone();

        pending.context.spawn(async move {
            let outcome = tokio::select! {
                _ = released.cancelled() => return,
                outcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, open_channel(&connection, &service)) => outcome,
            };

            let result = match outcome {
                Ok(Ok(stream)) => match slot.lock() {
                    Ok(mut slot) => {
                        *slot = Some(stream);
                        Ok(())
                    }
                    Err(_) => Err(TransportError::Closed),
                },
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TransportError::Timeout),
            };

            handler.handle(EndpointEvent::OpenDone(result));
        });

        Ok(())
    }

    fn take_stream(&mut self) -> Option<EndpointStream> {
        let stream = self.stream.lock().ok()?.take()?;
        Some(EndpointStream {
            io: Box::new(stream),
            released: self.released.clone(),
        })
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

async fn open_channel(connection: &quinn::Connection, service: &str) -> TransportResult<QuicStream> {
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

    trace!("Opened bidirectional stream {} for {}", send.id().index(), service);

    write_message(&mut send, &ChannelMessage::open(service))
        .await
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

    match read_message(&mut recv)
        .await
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?
    {
        ChannelMessage::Accepted => Ok(QuicStream::new(send, recv)),
        ChannelMessage::Rejected { reason } => Err(TransportError::Rejected(reason)),
        other => Err(TransportError::ProtocolError(format!(
            "unexpected reply to channel open: {:?}",
            other
        ))),
    }
}

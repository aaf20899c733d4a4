//! Plain TCP transport
//!
//! Listeners bind on `startup` and run an accept loop on the execution
//! context; outbound connections dial on `open` and report the outcome
//! through their handler.

use crate::{
    AcceptEvent, AcceptHandler, Descriptor, Endpoint, EndpointEvent, EndpointHandler,
    EndpointStream, ExecContext, Listener, LogLevel, Transport, TransportError, TransportResult,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// TCP transport settings
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Upper bound for an outbound connect
    pub connect_timeout: Duration,

    /// Disable Nagle on every socket
    pub nodelay: bool,

    /// Pause after a failed accept before trying again
    pub accept_backoff: Duration,
}

/// Disable Nagle; a refusal is logged and the socket used as is
fn set_nodelay(stream: &TcpStream, peer: &dyn fmt::Display) -> bool {
    match stream.set_nodelay(true) {
        Ok(()) => true,
        Err(e) => {
            debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
            false
        }
    }
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            accept_backoff: Duration::from_millis(100),
        }
    }
}

impl TcpTransportConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// TCP transport factory
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

impl Transport for TcpTransport {
    fn create_listener(
        &self,
        context: &ExecContext,
        descriptor: &str,
        handler: Arc<dyn AcceptHandler>,
    ) -> TransportResult<Box<dyn Listener>> {
        let descriptor: Descriptor = descriptor.parse()?;

        Ok(Box::new(TcpListenerHandle {
            context: context.clone(),
            descriptor,
            handler,
            config: self.config.clone(),
            local_addr: None,
            stop: CancellationToken::new(),
        }))
    }

    fn alloc_connection(
        &self,
        context: &ExecContext,
        descriptor: &str,
        handler: Arc<dyn EndpointHandler>,
    ) -> TransportResult<Box<dyn Endpoint>> {
        let descriptor: Descriptor = descriptor.parse()?;

        Ok(Box::new(TcpEndpoint::outbound(
            context.clone(),
            descriptor,
            handler,
            self.config.clone(),
        )))
    }
}

/// TCP listener bound to a descriptor
pub struct TcpListenerHandle {
    context: ExecContext,
    descriptor: Descriptor,
    handler: Arc<dyn AcceptHandler>,
    config: TcpTransportConfig,
    local_addr: Option<SocketAddr>,
    stop: CancellationToken,
}

impl fmt::Debug for TcpListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListenerHandle")
            .field("descriptor", &self.descriptor.to_string())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Listener for TcpListenerHandle {
    fn startup(&mut self) -> TransportResult<()> {
        if self.local_addr.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        // Bind synchronously so bind errors surface to the caller.
        let std_listener =
            std::net::TcpListener::bind((self.descriptor.bind_host(), self.descriptor.port))?;
        std_listener.set_nonblocking(true)?;

        let listener = {
            let _guard = self.context.handle().enter();
            TcpListener::from_std(std_listener)?
        };
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!(
            descriptor = %self.descriptor,
            local_addr = %local_addr,
            "TCP listener started"
        );

        self.context.spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.config.clone(),
            self.stop.clone(),
        ));

        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for TcpListenerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn AcceptHandler>,
    config: TcpTransportConfig,
    stop: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                if config.nodelay {
                    set_nodelay(&stream, &peer_addr);
                }
                debug!(peer_addr = %peer_addr, "Accepted TCP connection");

                let endpoint = TcpEndpoint::accepted(stream, peer_addr);
                if let Err(e) = handler.handle(AcceptEvent::NewConnection(Box::new(endpoint))) {
                    debug!(peer_addr = %peer_addr, "Accept handler refused connection: {}", e);
                }
            }
            Err(e) => {
                let _ = handler.handle(AcceptEvent::Log {
                    level: LogLevel::Err,
                    message: format!("accept failed: {}", e),
                });
                tokio::time::sleep(config.accept_backoff).await;
            }
        }
    }

    debug!("TCP accept loop stopped");
}

/// TCP socket endpoint, either accepted or dialed
pub struct TcpEndpoint {
    description: String,
    stream: Arc<Mutex<Option<TcpStream>>>,
    dial: Option<Dial>,
    released: CancellationToken,
    _release_guard: DropGuard,
}

struct Dial {
    context: ExecContext,
    descriptor: Descriptor,
    handler: Arc<dyn EndpointHandler>,
    config: TcpTransportConfig,
    requested: bool,
}

impl TcpEndpoint {
    /// Wrap an already connected socket
    pub fn accepted(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let released = CancellationToken::new();
        Self {
            description: format!("tcp peer {}", peer_addr),
            stream: Arc::new(Mutex::new(Some(stream))),
            dial: None,
            _release_guard: released.clone().drop_guard(),
            released,
        }
    }

    fn outbound(
        context: ExecContext,
        descriptor: Descriptor,
        handler: Arc<dyn EndpointHandler>,
        config: TcpTransportConfig,
    ) -> Self {
        let released = CancellationToken::new();
        Self {
            description: format!("tcp connect {}", descriptor),
            stream: Arc::new(Mutex::new(None)),
            dial: Some(Dial {
                context,
                descriptor,
                handler,
                config,
                requested: false,
            }),
            _release_guard: released.clone().drop_guard(),
            released,
        }
    }
}

impl fmt::Debug for TcpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpEndpoint")
            .field("description", &self.description)
            .finish()
    }
}

impl Endpoint for TcpEndpoint {
    fn open(&mut self) -> TransportResult<()> {
        let dial = match self.dial.as_mut() {
            Some(dial) if !dial.requested => dial,
            _ => return Err(TransportError::AlreadyOpen),
        };
        dial.requested = true;

        let host = dial.descriptor.connect_host().to_string();
        let port = dial.descriptor.port;
        let timeout = dial.config.connect_timeout;
        let nodelay = dial.config.nodelay;
        let handler = dial.handler.clone();
        let slot = self.stream.clone();
        let released = self.released.clone();

        dial.context.spawn(async move {
            let connect = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)));
            let outcome = tokio::select! {
                // Released before the connect finished; nobody is listening.
                _ = released.cancelled() => return,
                outcome = connect => outcome,
            };

            let result = match outcome {
                Ok(Ok(stream)) => {
                    if nodelay {
                        set_nodelay(&stream, &format_args!("{}:{}", host, port));
                    }
                    match slot.lock() {
                        Ok(mut slot) => {
                            *slot = Some(stream);
                            Ok(())
                        }
                        Err(_) => Err(TransportError::Closed),
                    }
                }
                Ok(Err(e)) => {
                    warn!(host = %host, port, "TCP connect failed: {}", e);
                    Err(TransportError::IoError(e))
                }
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

//! Transport abstraction layer
//!
//! Defines the collaborators the forwarding core talks to: listeners that
//! report accepted connections, endpoints that open asynchronously and report
//! completion through an [`EndpointHandler`], and multiplexed sessions that
//! hand out channels. Concrete implementations live in [`tcp`] (plain sockets)
//! and in the `portmux-transport-quic` crate (multiplexed channels).
//!
//! Releasing a listener or an endpoint is dropping it.

pub mod descriptor;
pub mod error;
pub mod tcp;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use descriptor::{Descriptor, Protocol};
pub use error::{TransportError, TransportResult};
pub use tcp::{TcpTransport, TcpTransportConfig};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Byte stream usable by the relay
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// The I/O half of an open endpoint, handed to the relay
///
/// `released` is cancelled when the owning endpoint is dropped, so whoever
/// copies bytes on `io` can stop as soon as the endpoint is released.
pub struct EndpointStream {
    pub io: BoxStream,
    pub released: CancellationToken,
}

impl fmt::Debug for EndpointStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointStream")
            .field("released", &self.released.is_cancelled())
            .finish()
    }
}

/// Execution context owning listeners and endpoints
///
/// Transports spawn their background work (accept loops, connects) on this
/// runtime, which lets callbacks arrive from code that is not itself running
/// inside a tokio task.
#[derive(Debug, Clone)]
pub struct ExecContext {
    handle: Handle,
}

impl ExecContext {
    /// Context for the runtime the caller is running on
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

/// Severity attached to listener log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Fatal,
    Err,
    Warning,
    Info,
    Debug,
    Unknown,
}

impl LogLevel {
    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Fatal => "fatal",
            LogLevel::Err => "err",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Events delivered by a listener
#[derive(Debug)]
pub enum AcceptEvent {
    /// A connection was accepted; the endpoint is already open.
    NewConnection(Box<dyn Endpoint>),

    /// The listener has something to say about itself.
    Log { level: LogLevel, message: String },

    /// Transport-specific event the receiver may not understand.
    Other { kind: String },
}

/// Events delivered by an endpoint
#[derive(Debug)]
pub enum EndpointEvent {
    /// Outcome of an earlier [`Endpoint::open`] request.
    OpenDone(TransportResult<()>),

    /// The endpoint's connection ended.
    Shutdown { user_requested: bool },

    /// An error occurred on the endpoint.
    Error(String),

    /// Informational output produced by the endpoint.
    Output(String),
}

/// Receiver of listener events
pub trait AcceptHandler: Send + Sync {
    /// Handle one event. Returning [`TransportError::NotSupported`] tells the
    /// listener the event kind is not understood.
    fn handle(&self, event: AcceptEvent) -> TransportResult<()>;
}

/// Receiver of endpoint events
pub trait EndpointHandler: Send + Sync {
    fn handle(&self, event: EndpointEvent);
}

/// A listening endpoint
///
/// Constructed idle by [`Transport::create_listener`]; `startup` binds it and
/// starts delivering [`AcceptEvent`]s. Dropping the listener stops it.
pub trait Listener: Send + fmt::Debug {
    fn startup(&mut self) -> TransportResult<()>;

    /// Bound address, once started
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// One side of a forwarded connection
///
/// Dropping the endpoint releases it, whether or not it ever finished
/// opening.
pub trait Endpoint: Send + fmt::Debug {
    /// Tag the endpoint with the service the peer should connect it to
    fn set_service(&mut self, service: &str) -> TransportResult<()> {
        let _ = service;
        Err(TransportError::NotSupported)
    }

    /// Request the endpoint to open
    ///
    /// Returns immediately; the outcome arrives later as
    /// [`EndpointEvent::OpenDone`] on the endpoint's handler.
    fn open(&mut self) -> TransportResult<()>;

    /// Take the byte stream of an open endpoint
    ///
    /// Returns `None` if the endpoint is not open or the stream was already
    /// taken.
    fn take_stream(&mut self) -> Option<EndpointStream>;

    /// Short human-readable description used in logs
    fn describe(&self) -> String;
}

/// Factory for listeners and outbound connections
pub trait Transport: Send + Sync {
    fn create_listener(
        &self,
        context: &ExecContext,
        descriptor: &str,
        handler: Arc<dyn AcceptHandler>,
    ) -> TransportResult<Box<dyn Listener>>;

    fn alloc_connection(
        &self,
        context: &ExecContext,
        descriptor: &str,
        handler: Arc<dyn EndpointHandler>,
    ) -> TransportResult<Box<dyn Endpoint>>;
}

/// A multiplexed connection able to carry many channels
pub trait MuxSession: Send + Sync {
    /// Allocate a new, not yet opened, channel
    fn alloc_channel(&self, handler: Arc<dyn EndpointHandler>)
        -> TransportResult<Box<dyn Endpoint>>;

    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_labels() {
        assert_eq!(LogLevel::Fatal.label(), "fatal");
        assert_eq!(LogLevel::Err.label(), "err");
        assert_eq!(LogLevel::Warning.to_string(), "warning");
        assert_eq!(LogLevel::Info.label(), "info");
        assert_eq!(LogLevel::Debug.label(), "debug");
        assert_eq!(LogLevel::Unknown.label(), "unknown");
    }

    #[test]
    fn test_transport_errors() {
        let err = TransportError::ConnectionError("test".to_string());
        assert!(err.to_string().contains("Connection error"));

        let err = TransportError::Rejected("no route".to_string());
        assert!(err.to_string().contains("no route"));

        let err = TransportError::Timeout;
        assert!(err.to_string().contains("Timeout"));
    }
}

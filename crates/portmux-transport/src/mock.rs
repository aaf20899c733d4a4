//! Recording mock transport for tests
//!
//! [`MockNetwork`] implements both [`Transport`] and [`MuxSession`]. Every
//! listener and endpoint it hands out is recorded, so a test can inspect what
//! was requested (descriptors, service tags, open requests), whether it was
//! released, and drive the asynchronous side by firing events back through
//! the recorded handlers.

use crate::{
    AcceptEvent, AcceptHandler, Endpoint, EndpointEvent, EndpointHandler, EndpointStream,
    ExecContext, Listener, LogLevel, MuxSession, Transport, TransportError, TransportResult,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Operations that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockFailure {
    CreateListener,
    StartListener,
    AllocChannel,
    SetService,
    Open,
    AllocConnection,
}

/// What kind of endpoint a record describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockKind {
    /// Handed out by a listener; carries a label chosen by the test.
    Accepted(String),
    /// Channel allocated on the mux session.
    Channel,
    /// Outbound connection to the given descriptor.
    Connection(String),
}

/// Shared view of one listener
pub struct ListenerRecord {
    pub descriptor: String,
    handler: Arc<dyn AcceptHandler>,
    started: AtomicBool,
    released: AtomicBool,
}

impl ListenerRecord {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Deliver an accepted connection to the listener's handler
    pub fn accept(&self, endpoint: MockEndpoint) -> TransportResult<()> {
        self.handler
            .handle(AcceptEvent::NewConnection(Box::new(endpoint)))
    }

    pub fn log(&self, level: LogLevel, message: &str) -> TransportResult<()> {
        self.handler.handle(AcceptEvent::Log {
            level,
            message: message.to_string(),
        })
    }

    pub fn other(&self, kind: &str) -> TransportResult<()> {
        self.handler.handle(AcceptEvent::Other {
            kind: kind.to_string(),
        })
    }
}

impl fmt::Debug for ListenerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRecord")
            .field("descriptor", &self.descriptor)
            .field("started", &self.is_started())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Shared view of one endpoint
pub struct EndpointRecord {
    pub id: u64,
    pub kind: MockKind,
    handler: Option<Arc<dyn EndpointHandler>>,
    service: Mutex<Option<String>>,
    open_requested: AtomicBool,
    released: AtomicBool,
}

impl EndpointRecord {
    pub fn service(&self) -> Option<String> {
        self.service.lock().unwrap().clone()
    }

    pub fn open_requested(&self) -> bool {
        self.open_requested.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Fire an event through the handler given at allocation time
    ///
    /// # Panics
    /// Panics for accepted endpoints, which have no handler.
    pub fn fire(&self, event: EndpointEvent) {
        self.handler
            .as_ref()
            .expect("accepted endpoints have no handler")
            .handle(event);
    }

    pub fn complete_open(&self, result: TransportResult<()>) {
        self.fire(EndpointEvent::OpenDone(result));
    }
}

impl fmt::Debug for EndpointRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("service", &self.service())
            .field("open_requested", &self.open_requested())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Endpoint handed out by [`MockNetwork`]
pub struct MockEndpoint {
    record: Arc<EndpointRecord>,
    failures: Arc<Mutex<HashSet<MockFailure>>>,
    stream: Option<EndpointStream>,
    _release_guard: Option<DropGuard>,
}

impl MockEndpoint {
    pub fn record(&self) -> Arc<EndpointRecord> {
        self.record.clone()
    }

    /// Attach a byte stream that `take_stream` will return
    pub fn with_stream<S>(mut self, io: S) -> Self
    where
        S: crate::AsyncStream + 'static,
    {
        let released = CancellationToken::new();
        self._release_guard = Some(released.clone().drop_guard());
        self.stream = Some(EndpointStream {
            io: Box::new(io),
            released,
        });
        self
    }

    fn failing(&self, failure: MockFailure) -> bool {
        self.failures.lock().unwrap().contains(&failure)
    }
}

impl fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockEndpoint")
            .field("record", &self.record)
            .finish()
    }
}

impl Endpoint for MockEndpoint {
    fn set_service(&mut self, service: &str) -> TransportResult<()> {
        if self.failing(MockFailure::SetService) {
            return Err(TransportError::ConnectionError(
                "mock set_service failure".to_string(),
            ));
        }
        *self.record.service.lock().unwrap() = Some(service.to_string());
        Ok(())
    }

    fn open(&mut self) -> TransportResult<()> {
        if self.failing(MockFailure::Open) {
            return Err(TransportError::ConnectionError(
                "mock open failure".to_string(),
            ));
        }
        if self.record.open_requested.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyOpen);
        }
        Ok(())
    }

    fn take_stream(&mut self) -> Option<EndpointStream> {
        self.stream.take()
    }

    fn describe(&self) -> String {
        format!("mock endpoint {} ({:?})", self.record.id, self.record.kind)
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.record.released.store(true, Ordering::SeqCst);
    }
}

struct MockListener {
    record: Arc<ListenerRecord>,
    failures: Arc<Mutex<HashSet<MockFailure>>>,
}

impl fmt::Debug for MockListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.record, f)
    }
}

impl Listener for MockListener {
    fn startup(&mut self) -> TransportResult<()> {
        if self
            .failures
            .lock()
            .unwrap()
            .contains(&MockFailure::StartListener)
        {
            return Err(TransportError::IoError(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "mock address in use",
            )));
        }
        self.record.started.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockListener {
    fn drop(&mut self) {
        self.record.released.store(true, Ordering::SeqCst);
    }
}

/// In-memory transport and mux session
#[derive(Clone, Default)]
pub struct MockNetwork {
    next_id: Arc<AtomicU64>,
    failures: Arc<Mutex<HashSet<MockFailure>>>,
    listeners: Arc<Mutex<Vec<Arc<ListenerRecord>>>>,
    endpoints: Arc<Mutex<Vec<Arc<EndpointRecord>>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, failure: MockFailure) {
        self.failures.lock().unwrap().insert(failure);
    }

    pub fn recover(&self, failure: MockFailure) {
        self.failures.lock().unwrap().remove(&failure);
    }

    pub fn listeners(&self) -> Vec<Arc<ListenerRecord>> {
        self.listeners.lock().unwrap().clone()
    }

    /// Most recent listener created for `descriptor`
    pub fn listener(&self, descriptor: &str) -> Option<Arc<ListenerRecord>> {
        self.listeners()
            .into_iter()
            .rev()
            .find(|l| l.descriptor == descriptor)
    }

    pub fn endpoints(&self) -> Vec<Arc<EndpointRecord>> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn channels(&self) -> Vec<Arc<EndpointRecord>> {
        self.endpoints()
            .into_iter()
            .filter(|e| e.kind == MockKind::Channel)
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<EndpointRecord>> {
        self.endpoints()
            .into_iter()
            .filter(|e| matches!(e.kind, MockKind::Connection(_)))
            .collect()
    }

    /// Endpoints that were handed out and not dropped yet
    pub fn live_endpoints(&self) -> usize {
        self.endpoints()
            .iter()
            .filter(|e| !e.is_released())
            .count()
    }

    /// Create an already-open endpoint, as a listener would hand out
    pub fn accepted(&self, label: &str) -> MockEndpoint {
        self.endpoint(MockKind::Accepted(label.to_string()), None)
    }

    fn endpoint(&self, kind: MockKind, handler: Option<Arc<dyn EndpointHandler>>) -> MockEndpoint {
        let record = Arc::new(EndpointRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            kind,
            handler,
            service: Mutex::new(None),
            open_requested: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });
        self.endpoints.lock().unwrap().push(record.clone());

        MockEndpoint {
            record,
            failures: self.failures.clone(),
            stream: None,
            _release_guard: None,
        }
    }

    fn failing(&self, failure: MockFailure) -> bool {
        self.failures.lock().unwrap().contains(&failure)
    }
}

impl Transport for MockNetwork {
    fn create_listener(
        &self,
        _context: &ExecContext,
        descriptor: &str,
        handler: Arc<dyn AcceptHandler>,
    ) -> TransportResult<Box<dyn Listener>> {
        if self.failing(MockFailure::CreateListener) {
            return Err(TransportError::InvalidDescriptor {
                descriptor: descriptor.to_string(),
                reason: "mock create failure".to_string(),
            });
        }

        let record = Arc::new(ListenerRecord {
            descriptor: descriptor.to_string(),
            handler,
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });
        self.listeners.lock().unwrap().push(record.clone());

        Ok(Box::new(MockListener {
            record,
            failures: self.failures.clone(),
        }))
    }

    fn alloc_connection(
        &self,
        _context: &ExecContext,
        descriptor: &str,
        handler: Arc<dyn EndpointHandler>,
    ) -> TransportResult<Box<dyn Endpoint>> {
        if self.failing(MockFailure::AllocConnection) {
            return Err(TransportError::ConnectionError(
                "mock alloc_connection failure".to_string(),
            ));
        }
        Ok(Box::new(self.endpoint(
            MockKind::Connection(descriptor.to_string()),
            Some(handler),
        )))
    }
}

impl MuxSession for MockNetwork {
    fn alloc_channel(
        &self,
        handler: Arc<dyn EndpointHandler>,
    ) -> TransportResult<Box<dyn Endpoint>> {
        if self.failing(MockFailure::AllocChannel) {
            return Err(TransportError::ConnectionError(
                "mock alloc_channel failure".to_string(),
            ));
        }
        Ok(Box::new(self.endpoint(MockKind::Channel, Some(handler))))
    }

    fn describe(&self) -> String {
        "mock session".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAccept;

    impl AcceptHandler for NullAccept {
        fn handle(&self, _event: AcceptEvent) -> TransportResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingHandler(AtomicU64);

    impl EndpointHandler for CountingHandler {
        fn handle(&self, _event: EndpointEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let network = MockNetwork::new();
        let mut listener = network
            .create_listener(&ExecContext::current(), "tcp,3000", Arc::new(NullAccept))
            .unwrap();

        let record = network.listener("tcp,3000").unwrap();
        assert!(!record.is_started());

        listener.startup().unwrap();
        assert!(record.is_started());

        drop(listener);
        assert!(record.is_released());
    }

    #[tokio::test]
    async fn test_channel_records_service_and_open() {
        let network = MockNetwork::new();
        let handler = Arc::new(CountingHandler::default());

        let mut channel = network.alloc_channel(handler.clone()).unwrap();
        channel.set_service("forward1").unwrap();
        channel.open().unwrap();

        let record = &network.channels()[0];
        assert_eq!(record.service().as_deref(), Some("forward1"));
        assert!(record.open_requested());

        record.complete_open(Ok(()));
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);

        drop(channel);
        assert!(record.is_released());
        assert_eq!(network.live_endpoints(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let network = MockNetwork::new();
        network.fail(MockFailure::AllocChannel);
        assert!(network
            .alloc_channel(Arc::new(CountingHandler::default()))
            .is_err());

        network.recover(MockFailure::AllocChannel);
        network.fail(MockFailure::Open);
        let mut channel = network
            .alloc_channel(Arc::new(CountingHandler::default()))
            .unwrap();
        assert!(channel.open().is_err());
    }

    #[tokio::test]
    async fn test_stream_token_cancelled_on_drop() {
        let network = MockNetwork::new();
        let (io, _peer) = tokio::io::duplex(64);
        let mut endpoint = network.accepted("client").with_stream(io);

        let stream = endpoint.take_stream().unwrap();
        assert!(endpoint.take_stream().is_none());

        drop(endpoint);
        assert!(stream.released.is_cancelled());
    }
}

//! End-to-end forwarding over real TCP sockets
//!
//! Two services run in-process: the local one listens on a TCP port and opens
//! channels on a loopback session; the loopback session hands the far end of
//! each channel to the remote service, which dials the requested target.

use portmux_forward::{CopyRelay, ForwardService, MemorySink, ServiceHandle};
use portmux_transport::{
    Endpoint, EndpointEvent, EndpointHandler, EndpointStream, ExecContext, MuxSession,
    TcpTransport, TransportError, TransportResult,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Session whose channels are in-memory pipes into a peer service
struct LoopbackSession {
    peer: ServiceHandle,
    context: ExecContext,
}

impl MuxSession for LoopbackSession {
    fn alloc_channel(
        &self,
        handler: Arc<dyn EndpointHandler>,
    ) -> TransportResult<Box<dyn Endpoint>> {
        Ok(Box::new(LoopbackChannel::new(
            Some((handler, self.peer.clone())),
            self.context.clone(),
            None,
        )))
    }

    fn describe(&self) -> String {
        "loopback session".to_string()
    }
}

struct LoopbackChannel {
    opener: Option<(Arc<dyn EndpointHandler>, ServiceHandle)>,
    context: ExecContext,
    service: Option<String>,
    stream: Option<DuplexStream>,
    released: CancellationToken,
    _guard: DropGuard,
}

impl LoopbackChannel {
    fn new(
        opener: Option<(Arc<dyn EndpointHandler>, ServiceHandle)>,
        context: ExecContext,
        stream: Option<DuplexStream>,
    ) -> Self {
        let released = CancellationToken::new();
        Self {
            opener,
            context,
            service: None,
            stream,
            _guard: released.clone().drop_guard(),
            released,
        }
    }
}

impl fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("service", &self.service)
            .finish()
    }
}

impl Endpoint for LoopbackChannel {
    fn set_service(&mut self, service: &str) -> TransportResult<()> {
        self.service = Some(service.to_string());
        Ok(())
    }

    fn open(&mut self) -> TransportResult<()> {
        let (handler, peer) = self.opener.take().ok_or(TransportError::AlreadyOpen)?;
        let service = self
            .service
            .clone()
            .ok_or_else(|| TransportError::ConfigurationError("no service".to_string()))?;

        let (local, remote) = tokio::io::duplex(64 * 1024);
        self.stream = Some(local);

        let far_end = LoopbackChannel::new(None, self.context.clone(), Some(remote));
        let result = peer
            .remote_connection(self.context.clone(), Box::new(far_end), &service, "loopback")
            .map_err(|e| TransportError::ConnectionError(e.to_string()));

        // Completion is queued by the handler, never applied inline.
        handler.handle(EndpointEvent::OpenDone(result));
        Ok(())
    }

    fn take_stream(&mut self) -> Option<EndpointStream> {
        Some(EndpointStream {
            io: Box::new(self.stream.take()?),
            released: self.released.clone(),
        })
    }

    fn describe(&self) -> String {
        format!("loopback channel ({:?})", self.service)
    }
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// A closed port: bind, note the address, drop the listener
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

struct Harness {
    local: ServiceHandle,
    remote: ServiceHandle,
    local_addr: SocketAddr,
    local_sink: MemorySink,
    remote_sink: MemorySink,
    stop: CancellationToken,
}

async fn start(target: SocketAddr) -> Harness {
    let context = ExecContext::current();
    let stop = CancellationToken::new();

    let remote_sink = MemorySink::new();
    let remote = ForwardService::new(
        Arc::new(TcpTransport::default()),
        Arc::new(CopyRelay::new(context.clone())),
    )
    .with_sink(Arc::new(remote_sink.clone()));
    let remote_handle = remote.handle();
    tokio::spawn(remote.run(stop.clone()));

    let local_sink = MemorySink::new();
    let mut local = ForwardService::new(
        Arc::new(TcpTransport::default()),
        Arc::new(CopyRelay::new(context.clone())),
    )
    .with_sink(Arc::new(local_sink.clone()));

    let service = format!("tcp,{}", target);
    let key = local
        .register(context.clone(), "tcp,127.0.0.1:0", &service, "echo")
        .unwrap();
    local
        .start_all(Arc::new(LoopbackSession {
            peer: remote_handle.clone(),
            context,
        }))
        .unwrap();

    let local_addr = local
        .rules()
        .binding(key)
        .and_then(|b| b.local_addr())
        .unwrap();
    let local_handle = local.handle();
    tokio::spawn(local.run(stop.clone()));

    Harness {
        local: local_handle,
        remote: remote_handle,
        local_addr,
        local_sink,
        remote_sink,
        stop,
    }
}

async fn wait_for_pairs(handle: &ServiceHandle, expected: usize) {
    for _ in 0..100 {
        if handle.pair_count().await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pair count never reached {}", expected);
}

#[tokio::test]
async fn test_bytes_flow_through_both_services() {
    let echo = echo_server().await;
    let harness = start(echo).await;

    let mut client = TcpStream::connect(harness.local_addr).await.unwrap();
    client.write_all(b"hello through the mux").await.unwrap();

    let mut buf = vec![0u8; 21];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the mux");

    wait_for_pairs(&harness.local, 1).await;
    wait_for_pairs(&harness.remote, 1).await;

    drop(client);

    wait_for_pairs(&harness.local, 0).await;
    wait_for_pairs(&harness.remote, 0).await;
    assert!(harness.local_sink.lines().is_empty());

    harness.stop.cancel();
}

#[tokio::test]
async fn test_concurrent_connections_are_independent() {
    let echo = echo_server().await;
    let harness = start(echo).await;

    let mut first = TcpStream::connect(harness.local_addr).await.unwrap();
    let mut second = TcpStream::connect(harness.local_addr).await.unwrap();

    first.write_all(b"one").await.unwrap();
    second.write_all(b"two").await.unwrap();

    let mut buf = [0u8; 3];
    first.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one");
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");

    wait_for_pairs(&harness.local, 2).await;
    drop(first);
    wait_for_pairs(&harness.local, 1).await;

    second.write_all(b"still").await.unwrap();
    let mut buf = [0u8; 5];
    second.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still");

    harness.stop.cancel();
}

#[tokio::test]
async fn test_unreachable_target_closes_client() {
    let target = closed_port().await;
    let harness = start(target).await;

    let mut client = TcpStream::connect(harness.local_addr).await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    drop(client);

    wait_for_pairs(&harness.remote, 0).await;
    wait_for_pairs(&harness.local, 0).await;
    assert!(harness
        .remote_sink
        .contains(&["Mux open failed for loopback"]));

    harness.stop.cancel();
}

#[tokio::test]
async fn test_rule_registered_while_running() {
    let echo = echo_server().await;
    let harness = start(echo).await;

    // A fixed port would race with other tests; ask for a free one first.
    let free = closed_port().await;
    harness
        .local
        .register(
            ExecContext::current(),
            &format!("tcp,{}", free),
            &format!("tcp,{}", echo),
            "late",
        )
        .unwrap();

    let mut client = None;
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(free).await {
            client = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut client = client.expect("late rule never started listening");

    client.write_all(b"late").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"late");

    harness.stop.cancel();
}

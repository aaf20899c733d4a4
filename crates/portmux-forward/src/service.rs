//! Forwarding service: rules, listeners and pairs behind one event loop

use crate::accepter::AccepterBinding;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::{ForwardError, ForwardResult, Operation};
use crate::pair::{Adapter, ConnectionPair, PairId, Side};
use crate::registry::PairRegistry;
use crate::relay::Relay;
use crate::router::RouterEvent;
use crate::rules::{dup_str, PortRegistry, PortRule, RuleId};
use portmux_transport::{
    Endpoint, EndpointEvent, ExecContext, LogLevel, MuxSession, Transport, TransportError,
    TransportResult,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Local port forwarding over a multiplexed session
///
/// Owns the port registry, the pair registry and the started flag. All
/// state changes happen in [`ForwardService::dispatch`]; transport callbacks
/// only queue events. Drive it with [`ForwardService::run`], or with
/// [`ForwardService::process_pending`] when stepping by hand.
pub struct ForwardService {
    transport: Arc<dyn Transport>,
    relay: Arc<dyn Relay>,
    sink: Arc<dyn DiagnosticSink>,
    session: Option<Arc<dyn MuxSession>>,
    rules: PortRegistry,
    pairs: PairRegistry,
    started: bool,
    next_pair: u64,
    events_tx: mpsc::UnboundedSender<RouterEvent>,
    events_rx: mpsc::UnboundedReceiver<RouterEvent>,
}

impl ForwardService {
    pub fn new(transport: Arc<dyn Transport>, relay: Arc<dyn Relay>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            relay,
            sink: Arc::new(TracingSink),
            session: None,
            rules: PortRegistry::new(),
            pairs: PairRegistry::new(),
            started: false,
            next_pair: 0,
            events_tx,
            events_rx,
        }
    }

    /// Send diagnostic lines to `sink` instead of `tracing`
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            events: self.events_tx.clone(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn rules(&self) -> &PortRegistry {
        &self.rules
    }

    pub fn pairs(&self) -> &PairRegistry {
        &self.pairs
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Register a forwarding rule
    ///
    /// Strings are copied, so the caller's buffers may go away. A rule
    /// registered after [`start_all`](Self::start_all) is activated right
    /// away. Activation failures are reported, not returned: the rule stays
    /// registered but inactive.
    pub fn register(
        &mut self,
        context: ExecContext,
        listen: &str,
        service: &str,
        id: &str,
    ) -> ForwardResult<RuleId> {
        let rule = PortRule::new(context, listen, service, id)?;
        self.add_rule(rule)
    }

    fn add_rule(&mut self, rule: PortRule) -> ForwardResult<RuleId> {
        let id = rule.id().to_string();
        let key = self.rules.insert(rule).inspect_err(|e| {
            self.sink
                .report(&format!("Unable to register local port {}: {}", id, e));
        })?;

        debug!(rule = %key, "Registered local port {}", id);

        if self.started {
            self.activate(key);
        }
        Ok(key)
    }

    /// Start forwarding over `session`
    ///
    /// Activates every registered rule, most recently registered first.
    /// May only be called once.
    pub fn start_all(&mut self, session: Arc<dyn MuxSession>) -> ForwardResult<()> {
        if self.started {
            return Err(ForwardError::AlreadyStarted);
        }

        info!(
            "Starting {} local port(s) over {}",
            self.rules.len(),
            session.describe()
        );

        self.session = Some(session);
        self.pairs = PairRegistry::new();

        for key in self.rules.keys() {
            self.activate(key);
        }

        self.started = true;
        Ok(())
    }

    fn activate(&mut self, key: RuleId) {
        let rule = match self.rules.get(key) {
            Some(rule) => rule,
            None => return,
        };

        match AccepterBinding::activate(self.transport.as_ref(), key, rule, self.events_tx.clone())
        {
            Ok(binding) => self.rules.bind(binding),
            Err(e) => self.report(&e),
        }
    }

    /// Pair a connection accepted for `rule` with a new channel on the
    /// session, tagged with the rule's service
    pub fn new_local_connection(
        &mut self,
        rule: RuleId,
        endpoint: Box<dyn Endpoint>,
    ) -> ForwardResult<PairId> {
        let (id, service) = match self.rules.get(rule) {
            Some(r) => (r.id().to_string(), r.service().to_string()),
            None => {
                debug!(rule = %rule, "Connection for unknown rule dropped");
                return Err(ForwardError::NotStarted);
            }
        };
        let session = match &self.session {
            Some(session) => session.clone(),
            None => return Err(ForwardError::NotStarted),
        };

        self.pair_up(endpoint, &id, Some(rule), |adapter_b| {
            let mut channel = session
                .alloc_channel(adapter_b)
                .map_err(|e| (Operation::AllocChannel, e))?;
            channel
                .set_service(&service)
                .map_err(|e| (Operation::SetService, e))?;
            channel
                .open()
                .map_err(|e| (Operation::OpenChannel, e))?;
            Ok(channel)
        })
    }

    /// Pair a channel the peer opened with an outbound connection to
    /// `target`
    pub fn new_remote_connection(
        &mut self,
        context: ExecContext,
        endpoint: Box<dyn Endpoint>,
        target: &str,
        id: &str,
    ) -> ForwardResult<PairId> {
        let transport = self.transport.clone();

        self.pair_up(endpoint, id, None, |adapter_b| {
            let mut connection = transport
                .alloc_connection(&context, target, adapter_b)
                .map_err(|e| (Operation::AllocRemote, e))?;
            connection
                .open()
                .map_err(|e| (Operation::OpenRemote, e))?;
            Ok(connection)
        })
    }

    /// Shared shape of both pairing directions
    ///
    /// `open_b` creates endpoint B with the given adapter as its handler and
    /// requests it to open. On any failure `a` is released and nothing is
    /// registered; on success the pair is registered before returning.
    fn pair_up<F>(
        &mut self,
        a: Box<dyn Endpoint>,
        id: &str,
        rule: Option<RuleId>,
        open_b: F,
    ) -> ForwardResult<PairId>
    where
        F: FnOnce(Arc<Adapter>) -> Result<Box<dyn Endpoint>, (Operation, TransportError)>,
    {
        let label = match dup_str(id) {
            Ok(label) => label,
            Err(e) => {
                self.sink
                    .report(&format!("{}: {}", Operation::AllocPair.subject(id), e));
                return Err(e);
            }
        };

        self.next_pair += 1;
        let pair_id = PairId(self.next_pair);
        let adapter_a = Arc::new(Adapter::new(pair_id, Side::A, self.events_tx.clone()));
        let adapter_b = Arc::new(Adapter::new(pair_id, Side::B, self.events_tx.clone()));

        let b = match open_b(adapter_b.clone()) {
            Ok(b) => b,
            Err((op, source)) => {
                drop(a);
                let err = ForwardError::transport(id, op, source);
                self.report(&err);
                return Err(err);
            }
        };

        let pair = ConnectionPair::new(pair_id, label, rule, a, b, adapter_a, adapter_b);
        if let Err(e) = self.pairs.insert(pair) {
            self.sink
                .report(&format!("{}: {}", Operation::AllocPair.subject(id), e));
            return Err(e);
        }

        debug!(pair = %pair_id, "New connection for {}", id);
        Ok(pair_id)
    }

    /// Open completion for endpoint B
    pub(crate) fn on_open_done(&mut self, pair_id: PairId, result: TransportResult<()>) {
        let pair = match self.pairs.get_mut(pair_id) {
            Some(pair) => pair,
            None => {
                trace!(pair = %pair_id, "Open completion for released pair ignored");
                return;
            }
        };

        if let Err(source) = result {
            let err = ForwardError::transport(pair.label(), Operation::MuxOpen, source);
            self.report(&err);
            self.teardown(pair_id);
            return;
        }

        if pair.is_open() {
            debug!(pair = %pair_id, "Duplicate open completion ignored");
            return;
        }
        pair.mark_open();

        debug!(pair = %pair_id, "Connection for {} ready", pair.label());

        for side in [Side::A, Side::B] {
            let adapter = pair.adapter(side).clone();
            self.relay.notify_ready(adapter, pair.endpoint_mut(side));
        }
    }

    /// Either side ended: release both endpoints and forget the pair
    ///
    /// `user_requested` does not change anything, it is only logged.
    pub(crate) fn on_shutdown(&mut self, pair_id: PairId, side: Side, user_requested: bool) {
        if !self.pairs.contains(pair_id) {
            trace!(pair = %pair_id, "Shutdown for released pair ignored");
            return;
        }

        debug!(
            pair = %pair_id,
            side = %side,
            user_requested,
            "Connection side shut down"
        );
        self.teardown(pair_id);
    }

    pub(crate) fn on_error(&mut self, pair_id: PairId, message: &str) {
        match self.pairs.get(pair_id) {
            Some(pair) => self
                .sink
                .report(&format!("Error on {}: {}", pair.label(), message)),
            None => self
                .sink
                .report(&format!("Error on {}: {}", pair_id, message)),
        }
    }

    /// Output on a forwarded endpoint; nothing is expected here
    pub(crate) fn on_output(&mut self, pair_id: PairId, text: &str) {
        trace!(pair = %pair_id, len = text.len(), "Endpoint output ignored");
    }

    fn on_listener_log(&mut self, rule: RuleId, level: LogLevel, message: &str) {
        let id = self.rules.get(rule).map(|r| r.id()).unwrap_or("?");
        self.sink.report(&format!(
            "Accept log level {} from {}: {}",
            level.label(),
            id,
            message
        ));
    }

    fn teardown(&mut self, pair_id: PairId) {
        // Dropping the pair releases both endpoints and both adapters.
        if let Some(pair) = self.pairs.remove(pair_id) {
            match pair.rule() {
                Some(rule) => {
                    debug!(pair = %pair_id, rule = %rule, "Connection for {} closed", pair.label())
                }
                None => debug!(pair = %pair_id, "Remote connection for {} closed", pair.label()),
            }
        }
    }

    /// Apply one queued event
    pub fn dispatch(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Register(rule) => {
                let _ = self.add_rule(rule);
            }
            RouterEvent::Accepted { rule, endpoint } => {
                let _ = self.new_local_connection(rule, endpoint);
            }
            RouterEvent::ListenerLog {
                rule,
                level,
                message,
            } => self.on_listener_log(rule, level, &message),
            RouterEvent::RemoteConnection {
                context,
                endpoint,
                target,
                id,
            } => {
                let _ = self.new_remote_connection(context, endpoint, &target, &id);
            }
            RouterEvent::Endpoint { pair, side, event } => match event {
                EndpointEvent::OpenDone(result) => self.on_open_done(pair, result),
                EndpointEvent::Shutdown { user_requested } => {
                    self.on_shutdown(pair, side, user_requested)
                }
                EndpointEvent::Error(message) => self.on_error(pair, &message),
                EndpointEvent::Output(text) => self.on_output(pair, &text),
            },
            RouterEvent::PairCount(reply) => {
                let _ = reply.send(self.pairs.len());
            }
        }
    }

    /// Dispatch everything queued so far, returning how many events ran
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event);
            processed += 1;
        }
        processed
    }

    /// Dispatch events until `shutdown` fires, then close every pair and
    /// release every listener
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
            }
        }

        self.stop();
    }

    /// Close every pair and release every listener
    pub fn stop(&mut self) {
        let pairs = self.pairs.drain();
        let listeners = self.rules.release_listeners();
        info!(
            "Forwarding stopped: closed {} connection(s), released {} listener(s)",
            pairs.len(),
            listeners
        );
    }

    fn report(&self, err: &ForwardError) {
        if let ForwardError::Transport { id, op, source } = err {
            debug!(id = %id, op = %op, error = %source, "Forwarding failure");
        }
        self.sink.report(&err.to_string());
    }
}

/// Cloneable access to a running [`ForwardService`]
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    events: mpsc::UnboundedSender<RouterEvent>,
}

impl ServiceHandle {
    /// Register a rule with the service; it is activated once the service
    /// processes the request
    pub fn register(
        &self,
        context: ExecContext,
        listen: &str,
        service: &str,
        id: &str,
    ) -> ForwardResult<()> {
        let rule = PortRule::new(context, listen, service, id)?;
        self.send(RouterEvent::Register(rule))
    }

    /// Hand over a channel the peer opened for `target`
    pub fn remote_connection(
        &self,
        context: ExecContext,
        endpoint: Box<dyn Endpoint>,
        target: &str,
        id: &str,
    ) -> ForwardResult<()> {
        self.send(RouterEvent::RemoteConnection {
            context,
            endpoint,
            target: dup_str(target)?,
            id: dup_str(id)?,
        })
    }

    pub async fn pair_count(&self) -> ForwardResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(RouterEvent::PairCount(tx))?;
        rx.await.map_err(|_| ForwardError::ServiceStopped)
    }

    fn send(&self, event: RouterEvent) -> ForwardResult<()> {
        self.events
            .send(event)
            .map_err(|_| ForwardError::ServiceStopped)
    }
}

//! Accepter binding: one running listener per active rule

use crate::error::{ForwardError, ForwardResult, Operation};
use crate::router::RouterEvent;
use crate::rules::{PortRule, RuleId};
use portmux_transport::{
    AcceptEvent, AcceptHandler, Listener, Transport, TransportError, TransportResult,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// Listener events for one rule, queued for the router
struct RuleAcceptor {
    rule: RuleId,
    events: UnboundedSender<RouterEvent>,
}

impl AcceptHandler for RuleAcceptor {
    fn handle(&self, event: AcceptEvent) -> TransportResult<()> {
        let event = match event {
            AcceptEvent::NewConnection(endpoint) => RouterEvent::Accepted {
                rule: self.rule,
                endpoint,
            },
            AcceptEvent::Log { level, message } => RouterEvent::ListenerLog {
                rule: self.rule,
                level,
                message,
            },
            AcceptEvent::Other { kind } => {
                let err = ForwardError::UnsupportedEvent { kind };
                debug!(rule = %self.rule, "{}", err);
                return Err(TransportError::NotSupported);
            }
        };

        self.events.send(event).map_err(|_| TransportError::Closed)
    }
}

/// Running listener of a rule
#[derive(Debug)]
pub struct AccepterBinding {
    rule: RuleId,
    listener: Box<dyn Listener>,
}

impl AccepterBinding {
    /// Create and start the listener for `rule`
    ///
    /// On failure the partially built listener is released and the error
    /// names the step that failed.
    pub(crate) fn activate(
        transport: &dyn Transport,
        key: RuleId,
        rule: &PortRule,
        events: UnboundedSender<RouterEvent>,
    ) -> ForwardResult<Self> {
        let handler = Arc::new(RuleAcceptor { rule: key, events });

        let mut listener = transport
            .create_listener(rule.context(), rule.listen(), handler)
            .map_err(|e| ForwardError::transport(rule.id(), Operation::OpenPort, e))?;

        listener
            .startup()
            .map_err(|e| ForwardError::transport(rule.id(), Operation::StartPort, e))?;

        match listener.local_addr() {
            Some(addr) => info!("Local port {} listening on {}", rule.id(), addr),
            None => info!("Local port {} listening on {}", rule.id(), rule.listen()),
        }

        Ok(Self {
            rule: key,
            listener,
        })
    }

    pub fn rule(&self) -> RuleId {
        self.rule
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }
}

//! Connection pairs and their per-side adapters

use crate::router::RouterEvent;
use crate::rules::RuleId;
use portmux_transport::{Endpoint, EndpointEvent, EndpointHandler};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

/// Opaque handle of a live pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId(pub(crate) u64);

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pair-{}", self.0)
    }
}

/// Which half of a pair
///
/// `A` is the endpoint that already existed when the pair was created, `B`
/// the one the pair opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn sibling(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("A"),
            Side::B => f.write_str("B"),
        }
    }
}

/// Event context of one side of a pair
///
/// The adapter knows its pair and its side, which is all it takes to reach
/// the sibling endpoint: the router looks the pair up by id. Events for a
/// pair that was already torn down are ignored by the router.
pub struct Adapter {
    pair: PairId,
    side: Side,
    events: UnboundedSender<RouterEvent>,
}

impl Adapter {
    pub(crate) fn new(pair: PairId, side: Side, events: UnboundedSender<RouterEvent>) -> Self {
        Self { pair, side, events }
    }

    pub fn pair(&self) -> PairId {
        self.pair
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Report that this side's connection ended
    pub fn shutdown(&self, user_requested: bool) {
        self.deliver(EndpointEvent::Shutdown { user_requested });
    }

    /// Report an error on this side
    pub fn error(&self, message: impl Into<String>) {
        self.deliver(EndpointEvent::Error(message.into()));
    }

    fn deliver(&self, event: EndpointEvent) {
        let event = RouterEvent::Endpoint {
            pair: self.pair,
            side: self.side,
            event,
        };
        if self.events.send(event).is_err() {
            trace!(pair = %self.pair, side = %self.side, "Router gone, event dropped");
        }
    }
}

impl EndpointHandler for Adapter {
    fn handle(&self, event: EndpointEvent) {
        self.deliver(event);
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("pair", &self.pair)
            .field("side", &self.side)
            .finish()
    }
}

/// Two endpoints forwarded into each other
///
/// The pair is the sole owner of both endpoints and both adapters; dropping
/// it releases everything.
#[derive(Debug)]
pub struct ConnectionPair {
    id: PairId,
    label: String,
    rule: Option<RuleId>,
    a: Box<dyn Endpoint>,
    b: Box<dyn Endpoint>,
    b_open: bool,
    adapter_a: Arc<Adapter>,
    adapter_b: Arc<Adapter>,
}

impl ConnectionPair {
    pub(crate) fn new(
        id: PairId,
        label: String,
        rule: Option<RuleId>,
        a: Box<dyn Endpoint>,
        b: Box<dyn Endpoint>,
        adapter_a: Arc<Adapter>,
        adapter_b: Arc<Adapter>,
    ) -> Self {
        Self {
            id,
            label,
            rule,
            a,
            b,
            b_open: false,
            adapter_a,
            adapter_b,
        }
    }

    pub fn id(&self) -> PairId {
        self.id
    }

    /// Rule id (or remote id) the pair was created for
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Rule that accepted endpoint A, for locally initiated pairs
    pub fn rule(&self) -> Option<RuleId> {
        self.rule
    }

    pub fn is_open(&self) -> bool {
        self.b_open
    }

    pub(crate) fn mark_open(&mut self) {
        self.b_open = true;
    }

    pub fn adapter(&self, side: Side) -> &Arc<Adapter> {
        match side {
            Side::A => &self.adapter_a,
            Side::B => &self.adapter_b,
        }
    }

    pub fn endpoint(&self, side: Side) -> &dyn Endpoint {
        match side {
            Side::A => self.a.as_ref(),
            Side::B => self.b.as_ref(),
        }
    }

    pub(crate) fn endpoint_mut(&mut self, side: Side) -> &mut dyn Endpoint {
        match side {
            Side::A => self.a.as_mut(),
            Side::B => self.b.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_adapter_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let adapter = Adapter::new(PairId(7), Side::B, tx);

        adapter.shutdown(true);
        adapter.handle(EndpointEvent::OpenDone(Ok(())));

        match rx.try_recv().unwrap() {
            RouterEvent::Endpoint { pair, side, event } => {
                assert_eq!(pair, PairId(7));
                assert_eq!(side, Side::B);
                assert!(matches!(
                    event,
                    EndpointEvent::Shutdown {
                        user_requested: true
                    }
                ));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            RouterEvent::Endpoint {
                event: EndpointEvent::OpenDone(Ok(())),
                ..
            }
        ));
    }

    #[test]
    fn test_adapter_survives_closed_router() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let adapter = Adapter::new(PairId(1), Side::A, tx);
        adapter.error("late error");
    }
}

//! Events queued for the forwarding service
//!
//! Transport callbacks and handles never touch the service state directly;
//! they push a [`RouterEvent`] and the service dispatches it from its own
//! context. Queueing keeps a pair's open completion behind the registration
//! of that pair.

use crate::pair::{PairId, Side};
use crate::rules::{PortRule, RuleId};
use portmux_transport::{Endpoint, EndpointEvent, ExecContext, LogLevel};
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum RouterEvent {
    /// A rule registered through a handle.
    Register(PortRule),

    /// A rule's listener accepted a connection.
    Accepted {
        rule: RuleId,
        endpoint: Box<dyn Endpoint>,
    },

    /// A rule's listener logged something.
    ListenerLog {
        rule: RuleId,
        level: LogLevel,
        message: String,
    },

    /// The peer opened a channel asking for `target`.
    RemoteConnection {
        context: ExecContext,
        endpoint: Box<dyn Endpoint>,
        target: String,
        id: String,
    },

    /// Event on one side of a pair.
    Endpoint {
        pair: PairId,
        side: Side,
        event: EndpointEvent,
    },

    /// Request for the number of live pairs.
    PairCount(oneshot::Sender<usize>),
}

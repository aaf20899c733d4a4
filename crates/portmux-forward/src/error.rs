//! Forwarding error types

use portmux_transport::TransportError;
use std::fmt;
use thiserror::Error;

/// Step of a rule activation or a pairing that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AllocPair,
    OpenPort,
    StartPort,
    AllocChannel,
    SetService,
    OpenChannel,
    AllocRemote,
    OpenRemote,
    MuxOpen,
}

impl Operation {
    /// Short name used as a structured log field
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AllocPair => "alloc_pair",
            Operation::OpenPort => "open_port",
            Operation::StartPort => "start_port",
            Operation::AllocChannel => "alloc_channel",
            Operation::SetService => "set_service",
            Operation::OpenChannel => "open_channel",
            Operation::AllocRemote => "alloc_remote",
            Operation::OpenRemote => "open_remote",
            Operation::MuxOpen => "mux_open",
        }
    }

    /// Leading part of the diagnostic line for `id`
    pub fn subject(&self, id: &str) -> String {
        match self {
            Operation::AllocPair => format!("Unable to allocate new connection for {}", id),
            Operation::OpenPort => format!("Unable to open local port {}", id),
            Operation::StartPort => format!("Unable to start local port {}", id),
            Operation::AllocChannel => format!("Unable to alloc local mux channel for {}", id),
            Operation::SetService => format!("Unable to set channel service for {}", id),
            Operation::OpenChannel => format!("Unable to open local mux channel for {}", id),
            Operation::AllocRemote => format!("Unable to alloc for remote channel for {}", id),
            Operation::OpenRemote => format!("Unable to open remote connection for {}", id),
            Operation::MuxOpen => format!("Mux open failed for {}", id),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Forwarding errors
///
/// None of these are fatal: a failing rule stays inactive and a failing pair
/// never forms, everything else keeps running.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("{}: {source}", subject(.op, .id))]
    Transport {
        id: String,
        op: Operation,
        #[source]
        source: TransportError,
    },

    #[error("Unsupported event: {kind}")]
    UnsupportedEvent { kind: String },

    #[error("Forwarding service already started")]
    AlreadyStarted,

    #[error("Forwarding service not started")]
    NotStarted,

    #[error("Forwarding service stopped")]
    ServiceStopped,
}

impl ForwardError {
    pub fn transport(id: &str, op: Operation, source: TransportError) -> Self {
        ForwardError::Transport {
            id: id.to_string(),
            op,
            source,
        }
    }
}

fn subject(op: &Operation, id: &str) -> String {
    op.subject(id)
}

pub type ForwardResult<T> = Result<T, ForwardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_line() {
        let err = ForwardError::transport(
            "A",
            Operation::OpenPort,
            TransportError::ConnectionError("address in use".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Unable to open local port A: Connection error: address in use"
        );

        let err = ForwardError::transport("B", Operation::MuxOpen, TransportError::Timeout);
        assert_eq!(err.to_string(), "Mux open failed for B: Timeout");
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::SetService.name(), "set_service");
        assert_eq!(Operation::AllocRemote.to_string(), "alloc_remote");
    }
}

//! Handshake message types

use serde::{Deserialize, Serialize};

/// Messages exchanged at the start of a multiplexed channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Sent by the side opening the channel.
    ///
    /// `service` is the service identifier the peer should connect the channel
    /// to. For forwards towards a remote peer this is the remote target
    /// descriptor, e.g. `tcp,db.internal:5432`.
    Open { version: u32, service: String },

    /// The peer accepted the channel; raw data follows.
    Accepted,

    /// The peer refused the channel. The stream is finished right after.
    Rejected { reason: String },
}

impl ChannelMessage {
    /// Build an `Open` request for the current protocol version
    pub fn open(service: impl Into<String>) -> Self {
        ChannelMessage::Open {
            version: crate::PROTOCOL_VERSION,
            service: service.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        ChannelMessage::Rejected {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_uses_current_version() {
        let msg = ChannelMessage::open("forward1");
        assert_eq!(
            msg,
            ChannelMessage::Open {
                version: crate::PROTOCOL_VERSION,
                service: "forward1".to_string(),
            }
        );
    }

    #[test]
    fn test_rejected_reason() {
        let msg = ChannelMessage::rejected("target not allowed");
        if let ChannelMessage::Rejected { reason } = msg {
            assert_eq!(reason, "target not allowed");
        } else {
            panic!("Expected Rejected message");
        }
    }
}

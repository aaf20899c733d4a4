//! Channel protocol definitions
//!
//! Every multiplexed channel opened by portmux starts with a short handshake
//! carried on the channel itself: the opener names the service it wants, the
//! acceptor answers with an accept or a reject. Once accepted the channel
//! carries the forwarded bytes untouched.

pub mod codec;
pub mod messages;

pub use codec::{read_message, write_message, ChannelCodec, CodecError};
pub use messages::ChannelMessage;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// ALPN identifier negotiated by the QUIC transport
pub const ALPN_PROTOCOL: &str = "portmux-v1";

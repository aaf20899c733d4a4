//! QUIC multiplexed transport
//!
//! A single QUIC connection between two portmux peers is the shared transport
//! endpoint; every forwarded connection rides on its own bidirectional stream
//! (a "channel"). Encryption, flow control and stream framing all come from
//! quinn.
//!
//! # Example
//!
//! ```no_run
//! use portmux_transport::ExecContext;
//! use portmux_transport_quic::{QuicConfig, QuicConnector};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(QuicConfig::client_insecure());
//! let connector = QuicConnector::new(config)?;
//! let session = connector
//!     .connect("127.0.0.1:4433", "localhost", ExecContext::current())
//!     .await?;
//! # Ok(())
//! # }
//! ```

// rustls needs a process-wide crypto provider before any QUIC operation.
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod allowlist;
pub mod config;
pub mod listener;
pub mod session;
pub mod stream;

pub use allowlist::Allowlist;
pub use config::{QuicConfig, ServerIdentity};
pub use listener::{serve_channels, ChannelRequestHandler, QuicConnector, QuicPeerListener};
pub use session::{QuicChannel, QuicMuxSession};
pub use stream::QuicStream;

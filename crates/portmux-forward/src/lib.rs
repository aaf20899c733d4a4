//! Local port forwarding over a multiplexed transport
//!
//! Every connection accepted on a configured local port is paired with a new
//! channel on a shared [`MuxSession`](portmux_transport::MuxSession); the
//! reverse direction pairs a channel opened by the peer with an outbound
//! connection. A pair lives until either side shuts down, and then both
//! sides are released together.
//!
//! # Example
//!
//! ```no_run
//! use portmux_forward::{CopyRelay, ForwardService};
//! use portmux_transport::{ExecContext, MuxSession, TcpTransport};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(session: Arc<dyn MuxSession>) -> Result<(), Box<dyn std::error::Error>> {
//! let context = ExecContext::current();
//! let mut service = ForwardService::new(
//!     Arc::new(TcpTransport::default()),
//!     Arc::new(CopyRelay::new(context.clone())),
//! );
//!
//! service.register(context, "tcp,3000", "tcp,db.internal:5432", "db")?;
//! service.start_all(session)?;
//! service.run(CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```

pub mod accepter;
pub mod diagnostics;
pub mod error;
pub mod pair;
pub mod registry;
pub mod relay;
pub mod router;
pub mod rules;
pub mod service;

pub use accepter::AccepterBinding;
pub use diagnostics::{DiagnosticSink, MemorySink, TracingSink};
pub use error::{ForwardError, ForwardResult, Operation};
pub use pair::{Adapter, ConnectionPair, PairId, Side};
pub use registry::PairRegistry;
pub use relay::{CopyRelay, Relay};
pub use router::RouterEvent;
pub use rules::{PortRegistry, PortRule, RuleId};
pub use service::{ForwardService, ServiceHandle};

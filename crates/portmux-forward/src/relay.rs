//! Relay: moves bytes between the two endpoints of a ready pair

use crate::pair::{Adapter, PairId, Side};
use portmux_transport::{Endpoint, EndpointStream, ExecContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Collaborator notified once per side when a pair is ready
///
/// The relay owns byte copying from then on and reports the end of its side
/// through [`Adapter::shutdown`].
pub trait Relay: Send + Sync {
    fn notify_ready(&self, adapter: Arc<Adapter>, endpoint: &mut dyn Endpoint);
}

/// What the relay holds for a pair whose sibling has not shown up yet
enum Slot {
    Parked(Side, EndpointStream),
    /// This side had no stream; the sibling's stream is dropped on arrival
    Failed(Side),
}

/// Relay copying between the two streams with `copy_bidirectional`
///
/// The first side of a pair is parked until its sibling shows up; the copy
/// task then runs until either direction finishes or either endpoint is
/// released.
pub struct CopyRelay {
    context: ExecContext,
    waiting: Mutex<HashMap<PairId, Slot>>,
}

impl CopyRelay {
    pub fn new(context: ExecContext) -> Self {
        Self {
            context,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Park `stream`, or return both streams (A first) if the sibling is
    /// already waiting
    fn park(
        &self,
        pair: PairId,
        side: Side,
        stream: EndpointStream,
    ) -> Option<(EndpointStream, EndpointStream)> {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);

        match waiting.remove(&pair) {
            Some(Slot::Parked(parked_side, parked)) if parked_side == side.sibling() => {
                Some(match side {
                    Side::A => (stream, parked),
                    Side::B => (parked, stream),
                })
            }
            Some(Slot::Failed(failed)) if failed == side.sibling() => {
                debug!(pair = %pair, side = %side, "Sibling had no stream, dropping this side");
                None
            }
            _ => {
                waiting.insert(pair, Slot::Parked(side, stream));
                None
            }
        }
    }

    /// `side` has no stream: drop a parked sibling, or leave a marker so the
    /// sibling is dropped when it arrives
    fn fail(&self, pair: PairId, side: Side) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);

        match waiting.remove(&pair) {
            Some(Slot::Parked(parked_side, _)) if parked_side == side.sibling() => {}
            Some(Slot::Failed(failed)) if failed == side.sibling() => {}
            _ => {
                waiting.insert(pair, Slot::Failed(side));
            }
        }
    }

    /// Number of pairs with one side's stream parked
    pub fn waiting(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| matches!(slot, Slot::Parked(..)))
            .count()
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Relay for CopyRelay {
    fn notify_ready(&self, adapter: Arc<Adapter>, endpoint: &mut dyn Endpoint) {
        let pair = adapter.pair();

        let stream = match endpoint.take_stream() {
            Some(stream) => stream,
            None => {
                warn!(pair = %pair, side = %adapter.side(), "Ready endpoint has no stream: {}", endpoint.describe());
                self.fail(pair, adapter.side());
                adapter.shutdown(false);
                return;
            }
        };

        let (mut a, mut b) = match self.park(pair, adapter.side(), stream) {
            Some(streams) => streams,
            None => return,
        };

        self.context.spawn(async move {
            tokio::select! {
                result = tokio::io::copy_bidirectional(&mut a.io, &mut b.io) => match result {
                    Ok((a_to_b, b_to_a)) => {
                        debug!(pair = %pair, "Relay complete: {} bytes A->B, {} bytes B->A", a_to_b, b_to_a);
                    }
                    Err(e) => {
                        debug!(pair = %pair, "Relay closed: {}", e);
                    }
                },
                _ = a.released.cancelled() => {
                    debug!(pair = %pair, "Relay stopped, endpoint A released");
                }
                _ = b.released.cancelled() => {
                    debug!(pair = %pair, "Relay stopped, endpoint B released");
                }
            }

            adapter.shutdown(false);
        });
    }
}

//! Request/reply correlation
//!
//! The bus supports one outstanding request at a time. Callers queue on
//! an async mutex; the holder installs a match key, transmits, and waits
//! on a oneshot for the dispatch task to hand it the reply. A timed-out
//! attempt retries on the spot without giving up the turn, so a retrying
//! requester cannot be interleaved with another caller.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::protocol::address::BusAddress;
use crate::protocol::frame::Frame;
use crate::protocol::ProtocolError;

/// Fields a reply must echo to be taken as the answer to the
/// outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MatchKey {
    /// Replies are addressed back to the requester, so the inbound
    /// frame's destination must equal the request's source. Matching on
    /// the reply's own source would reject answers to broadcasts from
    /// units whose address we have not learned yet.
    reply_to: BusAddress,
    protocol: u8,
    device: u8,
    command: u8,
}

impl MatchKey {
    fn for_request(frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(Self {
            reply_to: frame.from().ok_or(ProtocolError::MalformedRequest)?,
            protocol: frame.protocol_byte().ok_or(ProtocolError::MalformedRequest)?,
            device: frame.device().ok_or(ProtocolError::MalformedRequest)?,
            command: frame.command().ok_or(ProtocolError::MalformedRequest)?,
        })
    }

    fn matches(&self, frame: &Frame) -> bool {
        frame.to() == Some(self.reply_to)
            && frame.protocol_byte() == Some(self.protocol)
            && frame.device() == Some(self.device)
            && frame.command() == Some(self.command)
    }
}

struct Pending {
    key: MatchKey,
    reply_tx: oneshot::Sender<Frame>,
}

/// Serializes request/reply exchanges over the bus and routes each
/// reply to the caller waiting for it.
pub struct Correlator {
    turn: AsyncMutex<()>,
    pending: Mutex<Option<Pending>>,
    outbound: mpsc::Sender<Frame>,
    reply_timeout: Duration,
}

impl Correlator {
    /// New correlator transmitting through the given outbound queue.
    pub fn new(outbound: mpsc::Sender<Frame>, reply_timeout: Duration) -> Self {
        Self {
            turn: AsyncMutex::new(()),
            pending: Mutex::new(None),
            outbound,
            reply_timeout,
        }
    }

    /// Send a request and wait for the matching reply, retransmitting
    /// up to `retries` extra times on timeout. The turn is held across
    /// all attempts.
    pub async fn request(&self, frame: Frame, retries: u32) -> Result<Frame, ProtocolError> {
        let key = MatchKey::for_request(&frame)?;
        let _turn = self.turn.lock().await;

        for attempt in 0..=retries {
            let (reply_tx, reply_rx) = oneshot::channel();
            *self.pending.lock() = Some(Pending { key, reply_tx });

            self.outbound
                .send(frame.clone())
                .await
                .map_err(|_| ProtocolError::LinkClosed)?;

            match tokio::time::timeout(self.reply_timeout, reply_rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                // Sender dropped without a reply: the engine is gone.
                Ok(Err(_)) => return Err(ProtocolError::LinkClosed),
                Err(_) => {
                    *self.pending.lock() = None;
                    warn!(
                        attempt,
                        retries,
                        device = key.device,
                        command = key.command,
                        "request timed out"
                    );
                }
            }
        }

        Err(ProtocolError::Timeout)
    }

    /// Offer an inbound frame to the outstanding request, if any.
    /// Returns true when the frame was consumed as a reply.
    pub fn complete(&self, frame: &Frame) -> bool {
        let mut pending = self.pending.lock();
        match pending.take() {
            Some(p) if p.key.matches(frame) => {
                debug!(device = p.key.device, command = p.key.command, "reply matched");
                // Receiver gone means the requester timed out racing us.
                let _ = p.reply_tx.send(frame.clone());
                true
            }
            other => {
                *pending = other;
                false
            }
        }
    }
}

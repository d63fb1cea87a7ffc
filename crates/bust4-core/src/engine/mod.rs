//! Bus protocol engine
//!
//! Three cooperating tasks around a pair of bounded queues:
//!
//! - the link task owns the serial stream, feeding decoded frames into
//!   the inbound queue and draining the outbound queue onto the wire,
//!   never starting a transmission while a frame is mid-reception
//! - the dispatch task offers each inbound frame to the request
//!   correlator, then hands it to the registered observer
//! - the discovery task interrogates the remote unit in the background
//!
//! [`BusClient`] is the handle the rest of the application talks to.

pub mod model;

mod correlator;
mod discovery;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::protocol::codec::FrameDecoder;
use crate::protocol::frame::Frame;
use crate::protocol::{ProtocolError, SYNC_BYTE};

use correlator::Correlator;
use discovery::Discovery;
use model::RemoteUnit;

/// Callback invoked by the dispatch task for every inbound frame,
/// replies to pending requests included.
pub type FrameObserver = Box<dyn Fn(&Frame) + Send + Sync>;

/// How long reception may sit mid-frame with no further bytes before
/// the partial frame is abandoned. Transmission is gated on reception
/// being idle, so without this a noise burst that looks like a frame
/// start would block the transmit path for good.
const RECEIVE_RESET: Duration = Duration::from_millis(50);

/// Tunables for the engine's timing and queue sizing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a request waits for its reply before retrying.
    pub reply_timeout: Duration,

    /// Cadence of discovery polling once the model is complete.
    pub idle_poll: Duration,

    /// Depth of the inbound and outbound frame queues.
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(500),
            idle_poll: Duration::from_secs(1),
            queue_depth: 32,
        }
    }
}

/// Handle to a running protocol engine.
///
/// Cloneless by design: the application owns one client and shares it
/// behind whatever wrapper it already uses for state.
pub struct BusClient {
    outbound: mpsc::Sender<Frame>,
    correlator: Arc<Correlator>,
    unit: Arc<AsyncMutex<RemoteUnit>>,
    observer: Arc<Mutex<Option<FrameObserver>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BusClient {
    /// Spawn the engine tasks over a byte stream (normally the serial
    /// port from [`crate::protocol::serial::open_port`]).
    pub fn spawn<S>(stream: S, config: EngineConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_depth);

        let correlator = Arc::new(Correlator::new(outbound_tx.clone(), config.reply_timeout));
        let unit = Arc::new(AsyncMutex::new(RemoteUnit::new()));
        let observer: Arc<Mutex<Option<FrameObserver>>> = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(link_task(
                stream,
                outbound_rx,
                inbound_tx,
                cancel.clone(),
            )),
            tokio::spawn(dispatch_task(
                inbound_rx,
                correlator.clone(),
                observer.clone(),
                cancel.clone(),
            )),
            tokio::spawn({
                let cancel = cancel.clone();
                let discovery =
                    Discovery::new(correlator.clone(), unit.clone(), config.idle_poll);
                // The discovery loop blocks on its idle sleep, not on
                // the link, so it needs the cancel signal directly.
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = discovery.run() => {}
                    }
                }
            }),
        ];

        Self {
            outbound: outbound_tx,
            correlator,
            unit,
            observer,
            cancel,
            tasks,
        }
    }

    /// Queue a frame for transmission without waiting for any reply.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ProtocolError::LinkClosed)
    }

    /// Send a request and wait for the matching reply, retransmitting
    /// up to `retries` extra times on timeout. Requests from concurrent
    /// callers are serialized; only one is ever outstanding on the bus.
    pub async fn send_request(&self, frame: Frame, retries: u32) -> Result<Frame, ProtocolError> {
        self.correlator.request(frame, retries).await
    }

    /// Shared handle to the device model, for callers that manage
    /// locking themselves.
    pub fn unit(&self) -> Arc<AsyncMutex<RemoteUnit>> {
        self.unit.clone()
    }

    /// Lock the shared device model for reading or writing, giving up
    /// after `timeout`. Discovery holds the same lock across each of
    /// its round-trips, so a guard never exposes a half-applied step.
    pub async fn lock_unit(
        &self,
        timeout: Duration,
    ) -> Result<MutexGuard<'_, RemoteUnit>, ProtocolError> {
        tokio::time::timeout(timeout, self.unit.lock())
            .await
            .map_err(|_| ProtocolError::LockTimeout)
    }

    /// Register the observer called for every inbound frame, replacing
    /// any previous one.
    pub fn set_frame_observer<F>(&self, observer: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        *self.observer.lock() = Some(Box::new(observer));
    }

    /// Stop the engine tasks and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns the serial stream. Decoded frames go to the inbound queue;
/// outbound frames are transmitted only while reception is idle, so a
/// transmission never splices into a frame being received.
async fn link_task<S>(
    mut stream: S,
    mut outbound_rx: mpsc::Receiver<Frame>,
    inbound_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut decoder = FrameDecoder::new();
    let mut read_buf = [0u8; 64];

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = stream.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        debug!("bus stream reached EOF");
                        break;
                    }
                    Ok(n) => {
                        let mut closed = false;
                        for &byte in &read_buf[..n] {
                            if let Some(frame) = decoder.push(byte) {
                                trace!(len = frame.wire_len(), "frame received");
                                // Backpressure: a full queue suspends
                                // reading until dispatch catches up.
                                if inbound_tx.send(frame).await.is_err() {
                                    closed = true;
                                    break;
                                }
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "bus stream read failed");
                        break;
                    }
                }
            }

            _ = tokio::time::sleep(RECEIVE_RESET), if !decoder.is_idle() => {
                trace!("line went quiet mid-frame, abandoning it");
                decoder.reset();
            }

            maybe = outbound_rx.recv(), if decoder.is_idle() => {
                let Some(frame) = maybe else { break };
                let mut wire = Vec::with_capacity(frame.wire_len());
                wire.push(SYNC_BYTE);
                wire.extend_from_slice(frame.as_bytes());
                wire.push(frame.declared_len());
                trace!(len = wire.len(), "frame transmitted");
                if let Err(e) = stream.write_all(&wire).await {
                    error!(error = %e, "bus stream write failed");
                    break;
                }
                if let Err(e) = stream.flush().await {
                    error!(error = %e, "bus stream flush failed");
                    break;
                }
            }
        }
    }
    debug!("link task stopped");
}

/// Routes each inbound frame: first to the correlator as a candidate
/// reply, then unconditionally to the observer.
async fn dispatch_task(
    mut inbound_rx: mpsc::Receiver<Frame>,
    correlator: Arc<Correlator>,
    observer: Arc<Mutex<Option<FrameObserver>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            maybe = inbound_rx.recv() => {
                let Some(frame) = maybe else { break };
                if !correlator.complete(&frame) {
                    trace!("unsolicited frame");
                }
                if let Some(callback) = observer.lock().as_ref() {
                    callback(&frame);
                }
            }
        }
    }
    debug!("dispatch task stopped");
}

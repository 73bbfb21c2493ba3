//! Per-connection session state and pumps.
//!
//! Each WebSocket session runs three concurrent pumps:
//!
//! 1. **Read** — decodes inbound frames, rejects forged senders, and
//!    hands envelopes to the hub for routing.
//! 2. **Write** — drains the bounded outbound buffer to the socket
//!    with a per-write deadline.
//! 3. **Heartbeat** — pings on an interval and tears the session down
//!    when the pong stops coming back.
//!
//! The session's [`CancellationToken`] is the single teardown signal:
//! cancelling it stops all three pumps at their next suspension point,
//! and the write pump flushes whatever is still buffered on the way
//! out. Producers never block — the hub uses [`Client::try_send`] and
//! treats a full buffer as "defer to the durable queue".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use pinch_proto::EnvelopeHeader;

use crate::hub::Hub;

/// Deadline applied to each socket write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Shared handle to one connected session.
///
/// The hub's routing table stores these; the pumps own the socket
/// halves and the receiving end of the outbound buffer.
pub struct Client {
    address: String,
    frame_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    /// Set while a flush task is draining this session's backlog, so
    /// the hub never runs two flushers for the same session.
    flushing: AtomicBool,
}

impl Client {
    /// Creates a session handle and the outbound buffer receiver.
    ///
    /// `send_buffer` is the outbound channel capacity; producers use
    /// non-blocking sends and defer when it is full.
    pub(crate) fn new(address: String, send_buffer: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (frame_tx, frame_rx) = mpsc::channel(send_buffer);
        let client = Arc::new(Self {
            address,
            frame_tx,
            cancel: CancellationToken::new(),
            flushing: AtomicBool::new(false),
        });
        (client, frame_rx)
    }

    /// The `pinch:` address this session is registered under.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Non-blocking send into the outbound buffer.
    ///
    /// Fails when the buffer is full or the session is gone; the
    /// caller decides whether to queue durably instead.
    pub(crate) fn try_send(&self, frame: Vec<u8>) -> Result<(), TrySendError<Vec<u8>>> {
        self.frame_tx.try_send(frame)
    }

    /// Signals session teardown. Idempotent.
    ///
    /// Cancellation subsumes closing the outbound channel: the write
    /// pump drains what is buffered and exits, after which the
    /// receiver is dropped.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    /// Reports whether teardown has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when teardown has been signalled.
    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Claims the flusher slot. Returns `false` if a flush task is
    /// already running for this session.
    pub(crate) fn begin_flush(&self) -> bool {
        !self.flushing.swap(true, Ordering::AcqRel)
    }

    /// Releases the flusher slot.
    pub(crate) fn end_flush(&self) {
        self.flushing.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Session driver
// ---------------------------------------------------------------------------

/// Runs a session to completion: spawns the write and heartbeat pumps,
/// drives the read pump inline, and unregisters on exit.
///
/// The caller has already registered `client` with the hub.
pub(crate) async fn run_session(
    client: Arc<Client>,
    frame_rx: mpsc::Receiver<Vec<u8>>,
    socket: WebSocket,
    hub: Arc<Hub>,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let (sink, stream) = socket.split();
    let (ping_tx, ping_rx) = mpsc::channel::<()>(1);
    let (pong_tx, pong_rx) = watch::channel(Instant::now());

    let writer = tokio::spawn(write_pump(
        sink,
        frame_rx,
        ping_rx,
        client.clone(),
    ));
    let heartbeat = tokio::spawn(heartbeat_pump(
        ping_tx,
        pong_rx,
        client.clone(),
        ping_interval,
        pong_timeout,
    ));

    read_pump(stream, pong_tx, client.clone(), hub.clone()).await;

    // The read pump has exited: withdraw from the routing table, then
    // make sure the sibling pumps stop even if this session had already
    // been superseded (in which case the hub will not cancel it).
    hub.unregister(client.clone()).await;
    client.close();

    let _ = writer.await;
    let _ = heartbeat.await;
}

/// Read pump: inbound frames → hub.
///
/// Exits on socket error, close, cancellation, or an undecodable
/// binary frame (protocol error). Well-formed envelopes that fail
/// policy checks — forged sender here, or unsupported version,
/// unrecognized type, and unroutable recipient in the hub — are
/// dropped without touching the session.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    pong_tx: watch::Sender<Instant>,
    client: Arc<Client>,
    hub: Arc<Hub>,
) {
    loop {
        let message = tokio::select! {
            _ = client.cancelled() => return,
            message = stream.next() => message,
        };

        let message = match message {
            None => return,
            Some(Err(e)) => {
                tracing::debug!(address = client.address(), error = %e, "socket read error");
                return;
            }
            Some(Ok(message)) => message,
        };

        match message {
            Message::Binary(frame) => {
                // Parse fails only on undecodable bytes; anything that
                // decodes is at worst a policy drop downstream.
                let header = match EnvelopeHeader::parse(&frame) {
                    Ok(header) => header,
                    Err(e) => {
                        tracing::warn!(
                            address = client.address(),
                            error = %e,
                            "closing session on undecodable frame"
                        );
                        return;
                    }
                };

                // Reject forged senders: the envelope must carry the
                // address this session authenticated as.
                if header.from_address != client.address() {
                    tracing::debug!(
                        address = client.address(),
                        claimed = %header.from_address,
                        "dropping frame with forged sender"
                    );
                    continue;
                }

                if let Err(e) = hub.route_message(&client, frame).await {
                    tracing::warn!(
                        address = client.address(),
                        error = %e,
                        "failed to route frame"
                    );
                }
            }
            Message::Pong(_) => {
                let _ = pong_tx.send(Instant::now());
            }
            Message::Ping(_) => {
                // The WebSocket stack replies on our behalf.
            }
            Message::Close(_) => return,
            Message::Text(_) => {
                // Binary-only protocol.
                tracing::debug!(address = client.address(), "dropping unexpected text frame");
            }
        }
    }
}

/// Write pump: outbound buffer → socket.
///
/// On cancellation, flushes whatever is still buffered (best-effort,
/// bounded by the write deadline) before exiting. A write failure
/// initiates teardown so the read pump unregisters the session.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut frame_rx: mpsc::Receiver<Vec<u8>>,
    mut ping_rx: mpsc::Receiver<()>,
    client: Arc<Client>,
) {
    loop {
        tokio::select! {
            biased;

            _ = client.cancelled() => {
                // Drain residual frames, stopping at the first failure.
                while let Ok(frame) = frame_rx.try_recv() {
                    if write_frame(&mut sink, Message::Binary(frame)).await.is_err() {
                        return;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return;
            }

            maybe_frame = frame_rx.recv() => {
                let Some(frame) = maybe_frame else { return };
                if write_frame(&mut sink, Message::Binary(frame)).await.is_err() {
                    tracing::debug!(address = client.address(), "socket write failed");
                    client.close();
                    return;
                }
            }

            maybe_ping = ping_rx.recv() => {
                let Some(()) = maybe_ping else { return };
                if write_frame(&mut sink, Message::Ping(Vec::new())).await.is_err() {
                    client.close();
                    return;
                }
            }
        }
    }
}

/// Writes one message with the session write deadline applied.
async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
) -> Result<(), ()> {
    match timeout(WRITE_TIMEOUT, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

/// Heartbeat pump: pings every `ping_interval` and cancels the session
/// when no pong arrives within `pong_timeout`.
///
/// The first ping is due one interval after connect.
async fn heartbeat_pump(
    ping_tx: mpsc::Sender<()>,
    pong_rx: watch::Receiver<Instant>,
    client: Arc<Client>,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(ping_interval);
    // The interval fires immediately; consume that tick so the first
    // ping lands one full interval after connect.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = client.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let ping_sent = Instant::now();
        if ping_tx.send(()).await.is_err() {
            // Write pump is gone; the session is already tearing down.
            return;
        }

        tokio::select! {
            _ = client.cancelled() => return,
            _ = tokio::time::sleep(pong_timeout) => {
                if *pong_rx.borrow() < ping_sent {
                    tracing::info!(
                        address = client.address(),
                        "heartbeat timeout, closing session"
                    );
                    client.close();
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_send_fills_bounded_buffer() {
        let (client, mut frame_rx) = Client::new("pinch:bob@localhost".into(), 2);

        assert!(client.try_send(vec![1]).is_ok());
        assert!(client.try_send(vec![2]).is_ok());
        // Buffer full: the producer must not block.
        assert!(matches!(
            client.try_send(vec![3]),
            Err(TrySendError::Full(_))
        ));

        // Freeing a slot re-admits sends.
        assert_eq!(frame_rx.recv().await, Some(vec![1]));
        assert!(client.try_send(vec![3]).is_ok());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let (client, _frame_rx) = Client::new("pinch:bob@localhost".into(), 1);

        assert!(!client.is_cancelled());
        client.close();
        client.close();
        assert!(client.is_cancelled());
        // Resolves immediately once cancelled.
        client.cancelled().await;
    }

    #[tokio::test]
    async fn flush_slot_is_exclusive() {
        let (client, _frame_rx) = Client::new("pinch:bob@localhost".into(), 1);

        assert!(client.begin_flush());
        assert!(!client.begin_flush());
        client.end_flush();
        assert!(client.begin_flush());
    }
}

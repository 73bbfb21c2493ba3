//! Routing hub: the authoritative map from addresses to live sessions.
//!
//! A single event-loop task serializes lifecycle transitions
//! (register, unregister, eviction, shutdown teardown), while a
//! read-write lock serves hot-path lookups. The lock is never held
//! across a socket or database operation.
//!
//! Dispatch policy for an inbound frame:
//!
//! 1. Undecodable, wrong-version, unknown-type, or unroutable-recipient
//!    frames are dropped silently — the relay refuses to queue what it
//!    cannot deliver.
//! 2. While a recipient has queued backlog, fresh frames are routed
//!    through the queue so flushed rows keep their order.
//! 3. A live recipient gets a non-blocking send; a full buffer defers
//!    the frame to the durable queue.
//! 4. Otherwise the frame is queued for the recipient's return.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use pinch_proto::{EnvelopeHeader, ENVELOPE_VERSION};
use pinch_store::{KeyRegistry, MessageQueue};
use pinch_types::Result;

use crate::client::Client;

/// Bounded lifecycle event channel capacity.
const HUB_EVENT_BUFFER: usize = 256;

/// Delay between flush retries while a recipient's buffer stays full.
const FLUSH_RETRY: Duration = Duration::from_millis(100);

/// Lifecycle transitions processed by the event loop.
enum HubEvent {
    Register(Arc<Client>),
    Unregister(Arc<Client>),
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// The in-memory routing table plus its event loop.
pub struct Hub {
    /// Maps `pinch:` addresses to live sessions. At most one session
    /// per address at any instant.
    clients: RwLock<HashMap<String, Arc<Client>>>,

    /// Lifecycle event sender; the loop in [`run`](Self::run) consumes.
    events_tx: mpsc::Sender<HubEvent>,

    /// Receiver parked here until [`run`](Self::run) claims it.
    events_rx: Mutex<Option<mpsc::Receiver<HubEvent>>>,

    /// Durable queue for offline or saturated recipients.
    mq: Arc<MessageQueue>,

    /// Approved-key registry gating session admission.
    kr: Arc<KeyRegistry>,

    /// Host this relay accepts recipient addresses for. `None` skips
    /// the admissibility check.
    relay_host: RwLock<Option<String>>,

    /// Self-handle for handing an owned reference to spawned flush
    /// tasks.
    weak_self: Weak<Hub>,
}

impl Hub {
    /// Creates a hub over the given queue and key registry.
    pub fn new(mq: Arc<MessageQueue>, kr: Arc<KeyRegistry>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(HUB_EVENT_BUFFER);
        Arc::new_cyclic(|weak_self| Self {
            clients: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            mq,
            kr,
            relay_host: RwLock::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Runs the lifecycle event loop until `cancel` fires.
    ///
    /// Spawn this in its own task before accepting sessions.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let taken = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut events_rx) = taken else {
            tracing::error!("hub event loop started twice; ignoring");
            return;
        };

        loop {
            tokio::select! {
                maybe_event = events_rx.recv() => {
                    match maybe_event {
                        Some(HubEvent::Register(client)) => self.handle_register(client),
                        Some(HubEvent::Unregister(client)) => self.handle_unregister(client),
                        None => return,
                    }
                }

                _ = cancel.cancelled() => {
                    let drained: Vec<Arc<Client>> =
                        self.write_clients().drain().map(|(_, c)| c).collect();
                    for client in drained {
                        client.close();
                    }
                    tracing::info!("hub stopped");
                    return;
                }
            }
        }
    }

    /// Queues a session for registration.
    pub async fn register(&self, client: Arc<Client>) {
        if self.events_tx.send(HubEvent::Register(client)).await.is_err() {
            tracing::debug!("hub event loop gone; register dropped");
        }
    }

    /// Queues a session for removal.
    pub async fn unregister(&self, client: Arc<Client>) {
        if self.events_tx.send(HubEvent::Unregister(client)).await.is_err() {
            tracing::debug!("hub event loop gone; unregister dropped");
        }
    }

    fn handle_register(&self, client: Arc<Client>) {
        let address = client.address().to_owned();
        let evicted = self.write_clients().insert(address.clone(), client.clone());

        if let Some(old) = evicted {
            if !Arc::ptr_eq(&old, &client) {
                old.close();
                tracing::info!(address = %address, "session superseded by new connection");
            }
        }

        tracing::info!(
            address = %address,
            connections = self.client_count(),
            "client registered"
        );

        // Deliver any backlog accumulated while the agent was away.
        self.spawn_flush(client);
    }

    fn handle_unregister(&self, client: Arc<Client>) {
        let address = client.address().to_owned();
        let removed = {
            let mut clients = self.write_clients();
            // Pointer identity guards against a late unregister from a
            // session that has already been superseded.
            match clients.get(&address) {
                Some(current) if Arc::ptr_eq(current, &client) => {
                    clients.remove(&address);
                    true
                }
                _ => false,
            }
        };

        if removed {
            client.close();
            tracing::info!(
                address = %address,
                connections = self.client_count(),
                "client unregistered"
            );
        }
    }

    // -- Dispatch ---------------------------------------------------------

    /// Routes one inbound frame from `from`.
    ///
    /// Frames the relay cannot or will not deliver (undecodable, wrong
    /// version, unroutable recipient) are dropped and reported as
    /// success: the relay is deliberately silent toward senders.
    ///
    /// # Errors
    ///
    /// Returns [`pinch_types::PinchError::StorageError`] when the
    /// durable queue rejects a frame; delivery stays best-effort.
    pub async fn route_message(&self, from: &Client, frame: Vec<u8>) -> Result<()> {
        let header = match EnvelopeHeader::parse(&frame) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(from = from.address(), error = %e, "dropping undecodable frame");
                return Ok(());
            }
        };

        if header.version != ENVELOPE_VERSION {
            tracing::debug!(
                from = from.address(),
                version = header.version,
                "dropping frame with unsupported version"
            );
            return Ok(());
        }

        if header.message_type().is_none() {
            tracing::debug!(
                from = from.address(),
                raw_type = header.raw_type,
                "dropping frame with unrecognized message type"
            );
            return Ok(());
        }

        if !self.recipient_admissible(&header.to_address) {
            tracing::debug!(
                from = from.address(),
                to = %header.to_address,
                "dropping frame for unroutable recipient"
            );
            return Ok(());
        }

        // FIFO while a flush is in flight: queued backlog must reach
        // the recipient before any fresh frame.
        if self.mq.count(&header.to_address)? > 0 {
            return self.defer_frame(&header, frame);
        }

        let target = self.read_clients().get(&header.to_address).cloned();
        match target {
            Some(target) => match target.try_send(frame) {
                Ok(()) => {
                    tracing::debug!(
                        from = from.address(),
                        to = target.address(),
                        "frame delivered"
                    );
                    Ok(())
                }
                Err(TrySendError::Full(frame)) | Err(TrySendError::Closed(frame)) => {
                    self.defer_frame(&header, frame)
                }
            },
            None => self.defer_frame(&header, frame),
        }
    }

    /// Persists a frame for later delivery and kicks the recipient's
    /// flusher if a session is currently live.
    fn defer_frame(&self, header: &EnvelopeHeader, frame: Vec<u8>) -> Result<()> {
        self.mq
            .enqueue(&header.to_address, &header.from_address, &frame)?;
        tracing::debug!(to = %header.to_address, "frame queued");

        if let Some(target) = self.read_clients().get(&header.to_address).cloned() {
            self.spawn_flush(target);
        }
        Ok(())
    }

    // -- Flush ------------------------------------------------------------

    /// Starts a flush task for `client` unless one is already running.
    fn spawn_flush(&self, client: Arc<Client>) {
        // The upgrade only fails during final teardown, when flushing
        // is moot anyway.
        let Some(hub) = self.weak_self.upgrade() else { return };
        if !client.begin_flush() {
            return;
        }
        tokio::spawn(async move {
            hub.flush_queued(client).await;
        });
    }

    /// Drains the durable queue into `client`'s send buffer.
    ///
    /// A queued row is removed only after it has been handed to the
    /// buffer. When the buffer is full the task retries on an interval
    /// rather than busy-spinning, and abandons the backlog when the
    /// session is cancelled or superseded.
    async fn flush_queued(&self, client: Arc<Client>) {
        loop {
            while !client.is_cancelled() && self.is_registered(&client) {
                let drained = self
                    .mq
                    .drain(client.address(), |row| client.try_send(row.payload.clone()).is_ok());

                let delivered = match drained {
                    Ok(delivered) => delivered,
                    Err(e) => {
                        tracing::warn!(
                            address = client.address(),
                            error = %e,
                            "flush aborted on queue error"
                        );
                        client.end_flush();
                        return;
                    }
                };

                if delivered > 0 {
                    tracing::debug!(
                        address = client.address(),
                        delivered,
                        "flushed queued messages"
                    );
                }

                match self.mq.count(client.address()) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }

                tokio::select! {
                    _ = client.cancelled() => break,
                    _ = tokio::time::sleep(FLUSH_RETRY) => {}
                }
            }

            client.end_flush();

            // A frame may have been queued between the last drain and
            // the slot release. If so, and nobody else claimed the
            // slot, resume.
            let backlog = matches!(self.mq.count(client.address()), Ok(n) if n > 0);
            if backlog
                && !client.is_cancelled()
                && self.is_registered(&client)
                && client.begin_flush()
            {
                continue;
            }
            return;
        }
    }

    // -- Read-only accessors ----------------------------------------------

    /// Number of currently connected sessions.
    pub fn client_count(&self) -> usize {
        self.read_clients().len()
    }

    /// Returns the live session registered under `address`, if any.
    pub fn lookup_client(&self, address: &str) -> Option<Arc<Client>> {
        self.read_clients().get(address).cloned()
    }

    /// The key registry gating session admission.
    pub fn key_registry(&self) -> &Arc<KeyRegistry> {
        &self.kr
    }

    /// Configures the host used for delivery-admissibility checks.
    ///
    /// Takes effect for subsequent messages only.
    pub fn set_relay_host(&self, host: impl Into<String>) {
        let mut relay_host = self
            .relay_host
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *relay_host = Some(host.into());
    }

    /// True when `to_address` is deliverable by this relay: either no
    /// host is configured, or the address validates and names this
    /// relay's host.
    fn recipient_admissible(&self, to_address: &str) -> bool {
        let relay_host = self
            .relay_host
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match relay_host.as_deref() {
            None => true,
            Some(host) => matches!(
                pinch_identity::validate_address(to_address),
                Ok((_, to_host)) if to_host == host
            ),
        }
    }

    fn is_registered(&self, client: &Arc<Client>) -> bool {
        matches!(
            self.read_clients().get(client.address()),
            Some(current) if Arc::ptr_eq(current, client)
        )
    }

    fn read_clients(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Client>>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_clients(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Client>>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Per-recipient durable message queue.
//!
//! Frames addressed to offline (or saturated) recipients are persisted
//! here and drained on reconnect. Rows are keyed as
//!
//! ```text
//! to_address || 0x00 || sequence_be(8)
//! ```
//!
//! so iterating a recipient's prefix yields enqueue order within sled's
//! lexicographic iterator. The NUL separator keeps one address's rows
//! out of a longer address's prefix scan (addresses never contain NUL).
//! The sequence comes from the database's monotonic ID generator.
//!
//! The queue is bounded per recipient with a drop-oldest policy, and a
//! periodic sweep expires rows past the retention window.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Batch;

use pinch_types::Result;

use crate::storage_err;

/// Tree holding queued frames.
const MESSAGES_TREE: &str = "messages";

/// Separator between the recipient address and the sequence suffix.
const KEY_SEPARATOR: u8 = 0;

// ---------------------------------------------------------------------------
// QueuedMessage
// ---------------------------------------------------------------------------

/// A frame awaiting delivery to an offline recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Sender address, kept for observability and future receipts.
    pub from_address: String,
    /// The complete serialized envelope frame, delivered verbatim.
    pub payload: Vec<u8>,
    /// Unix seconds at enqueue; drives retention expiry.
    pub enqueued_at: i64,
}

// ---------------------------------------------------------------------------
// MessageQueue
// ---------------------------------------------------------------------------

/// Bounded per-recipient FIFO over the relay database.
pub struct MessageQueue {
    db: sled::Db,
    tree: sled::Tree,
    max_per_recipient: usize,
    retention: Duration,
    /// Serializes enqueue/drain so the count-evict-insert sequence and
    /// drain's remove-after-accept stay atomic with respect to each
    /// other. Never held across I/O outside sled itself.
    write_lock: Mutex<()>,
}

impl MessageQueue {
    /// Creates or opens the message queue in the given database.
    ///
    /// `max_per_recipient` bounds each recipient's backlog (oldest rows
    /// are dropped at the limit); `retention` is the TTL applied by
    /// [`sweep`](Self::sweep).
    pub fn new(db: &sled::Db, max_per_recipient: usize, retention: Duration) -> Result<Self> {
        let tree = db
            .open_tree(MESSAGES_TREE)
            .map_err(|e| storage_err("failed to open message queue", e))?;
        Ok(Self {
            db: db.clone(),
            tree,
            max_per_recipient,
            retention,
            write_lock: Mutex::new(()),
        })
    }

    /// Appends a frame to `to_address`'s queue.
    ///
    /// When the recipient is already at capacity the oldest row is
    /// dropped first.
    pub fn enqueue(&self, to_address: &str, from_address: &str, payload: &[u8]) -> Result<()> {
        let _guard = self.lock()?;
        let prefix = recipient_prefix(to_address);

        if self.count_prefix(&prefix)? >= self.max_per_recipient {
            // Drop-oldest: the first key in prefix order is the oldest.
            if let Some(item) = self.tree.scan_prefix(&prefix).next() {
                let (oldest, _) =
                    item.map_err(|e| storage_err("queue eviction scan failed", e))?;
                self.tree
                    .remove(&oldest)
                    .map_err(|e| storage_err("queue eviction failed", e))?;
                tracing::warn!(
                    recipient = to_address,
                    limit = self.max_per_recipient,
                    "queue full, dropped oldest message"
                );
            }
        }

        let sequence = self
            .db
            .generate_id()
            .map_err(|e| storage_err("sequence generation failed", e))?;

        let mut key = prefix;
        key.extend_from_slice(&sequence.to_be_bytes());

        let row = QueuedMessage {
            from_address: from_address.to_owned(),
            payload: payload.to_vec(),
            enqueued_at: Utc::now().timestamp(),
        };
        let value =
            bincode::serialize(&row).map_err(|e| storage_err("queue row serialization", e))?;

        self.tree
            .insert(key, value)
            .map_err(|e| storage_err("queue insert failed", e))?;
        Ok(())
    }

    /// Drains `to_address`'s queue in enqueue order.
    ///
    /// `visit` is called per row; returning `true` accepts the row,
    /// which is then removed, and iteration continues. Returning
    /// `false` stops immediately, leaving that row and all later rows
    /// queued — the backpressure hook for a saturated session. A row is
    /// only ever removed after `visit` has accepted it.
    ///
    /// Rows that no longer deserialize are removed and skipped.
    ///
    /// Returns the number of delivered (accepted) rows.
    pub fn drain(
        &self,
        to_address: &str,
        mut visit: impl FnMut(&QueuedMessage) -> bool,
    ) -> Result<usize> {
        let _guard = self.lock()?;
        let prefix = recipient_prefix(to_address);

        let mut delivered = 0usize;
        for item in self.tree.scan_prefix(&prefix) {
            let (key, raw) = item.map_err(|e| storage_err("queue drain scan failed", e))?;

            let row: QueuedMessage = match bincode::deserialize(&raw) {
                Ok(row) => row,
                Err(_) => {
                    self.tree
                        .remove(&key)
                        .map_err(|e| storage_err("queue drain remove failed", e))?;
                    tracing::warn!(recipient = to_address, "dropped malformed queue row");
                    continue;
                }
            };

            if !visit(&row) {
                break;
            }

            self.tree
                .remove(&key)
                .map_err(|e| storage_err("queue drain remove failed", e))?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Returns the number of rows queued for `to_address`.
    pub fn count(&self, to_address: &str) -> Result<usize> {
        self.count_prefix(&recipient_prefix(to_address))
    }

    /// Removes rows older than the retention window, along with any
    /// rows that no longer deserialize. Returns the number removed.
    pub fn sweep(&self) -> Result<usize> {
        let _guard = self.lock()?;
        let cutoff = Utc::now().timestamp() - self.retention.as_secs() as i64;

        let mut batch = Batch::default();
        let mut removed = 0usize;
        for item in self.tree.iter() {
            let (key, raw) = item.map_err(|e| storage_err("queue sweep scan failed", e))?;

            let expired = match bincode::deserialize::<QueuedMessage>(&raw) {
                Err(_) => true,
                Ok(row) => row.enqueued_at < cutoff,
            };

            if expired {
                batch.remove(key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.tree
                .apply_batch(batch)
                .map_err(|e| storage_err("queue sweep delete failed", e))?;
            tracing::debug!(removed, "swept expired queued messages");
        }
        Ok(removed)
    }

    // -- Internal ---------------------------------------------------------

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| storage_err("queue lock poisoned", e))
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut n = 0usize;
        for item in self.tree.scan_prefix(prefix) {
            item.map_err(|e| storage_err("queue count scan failed", e))?;
            n += 1;
        }
        Ok(n)
    }
}

/// Builds the key prefix owning all of `to_address`'s rows.
fn recipient_prefix(to_address: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(to_address.len() + 1);
    prefix.extend_from_slice(to_address.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const BOB: &str = "pinch:bob@localhost";
    const ALICE: &str = "pinch:alice@localhost";

    fn open_queue(max: usize, retention: Duration) -> (tempfile::TempDir, MessageQueue) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let db = crate::open_db(&dir.path().join("queue.db")).expect("open db");
        let queue = MessageQueue::new(&db, max, retention).expect("open queue");
        (dir, queue)
    }

    fn drain_all(queue: &MessageQueue, recipient: &str) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        queue
            .drain(recipient, |row| {
                frames.push(row.payload.clone());
                true
            })
            .expect("drain");
        frames
    }

    #[test]
    fn enqueue_then_drain_preserves_order_and_content() -> Result<()> {
        let (_dir, queue) = open_queue(1000, Duration::from_secs(3600));

        for i in 0..5u8 {
            queue.enqueue(BOB, ALICE, &[i, i, i])?;
        }
        assert_eq!(queue.count(BOB)?, 5);

        let frames = drain_all(&queue, BOB);
        assert_eq!(frames, vec![
            vec![0, 0, 0],
            vec![1, 1, 1],
            vec![2, 2, 2],
            vec![3, 3, 3],
            vec![4, 4, 4],
        ]);
        assert_eq!(queue.count(BOB)?, 0);
        Ok(())
    }

    #[test]
    fn declined_row_and_successors_stay_queued() -> Result<()> {
        let (_dir, queue) = open_queue(1000, Duration::from_secs(3600));

        for i in 0..5u8 {
            queue.enqueue(BOB, ALICE, &[i])?;
        }

        // Accept the first two rows, then decline.
        let mut seen = 0;
        let delivered = queue.drain(BOB, |_| {
            seen += 1;
            seen <= 2
        })?;
        assert_eq!(delivered, 2);
        assert_eq!(queue.count(BOB)?, 3);

        // The remaining rows drain in their original order.
        let frames = drain_all(&queue, BOB);
        assert_eq!(frames, vec![vec![2], vec![3], vec![4]]);
        Ok(())
    }

    #[test]
    fn bounded_queue_drops_oldest() -> Result<()> {
        let (_dir, queue) = open_queue(3, Duration::from_secs(3600));

        for i in 0..5u8 {
            queue.enqueue(BOB, ALICE, &[i])?;
        }
        assert_eq!(queue.count(BOB)?, 3);

        // Rows 0 and 1 were evicted to admit 3 and 4.
        let frames = drain_all(&queue, BOB);
        assert_eq!(frames, vec![vec![2], vec![3], vec![4]]);
        Ok(())
    }

    #[test]
    fn recipients_are_isolated() -> Result<()> {
        let (_dir, queue) = open_queue(1000, Duration::from_secs(3600));

        queue.enqueue(BOB, ALICE, b"for bob")?;
        queue.enqueue(ALICE, BOB, b"for alice")?;

        assert_eq!(queue.count(BOB)?, 1);
        assert_eq!(queue.count(ALICE)?, 1);

        assert_eq!(drain_all(&queue, BOB), vec![b"for bob".to_vec()]);
        assert_eq!(queue.count(ALICE)?, 1);
        Ok(())
    }

    #[test]
    fn address_prefix_does_not_leak_into_longer_address() -> Result<()> {
        // "pinch:x@h" must not see rows queued for "pinch:x@hh".
        let (_dir, queue) = open_queue(1000, Duration::from_secs(3600));

        queue.enqueue("pinch:x@hh", ALICE, b"long")?;
        assert_eq!(queue.count("pinch:x@h")?, 0);
        assert_eq!(queue.count("pinch:x@hh")?, 1);
        Ok(())
    }

    #[test]
    fn sweep_removes_only_expired_rows() -> Result<()> {
        let (_dir, queue) = open_queue(1000, Duration::ZERO);

        queue.enqueue(BOB, ALICE, b"stale")?;
        // Retention zero: anything with enqueued_at < now is expired.
        std::thread::sleep(Duration::from_millis(1100));
        let removed = queue.sweep()?;
        assert_eq!(removed, 1);
        assert_eq!(queue.count(BOB)?, 0);
        Ok(())
    }

    #[test]
    fn sweep_keeps_rows_inside_retention() -> Result<()> {
        let (_dir, queue) = open_queue(1000, Duration::from_secs(3600));

        queue.enqueue(BOB, ALICE, b"fresh")?;
        assert_eq!(queue.sweep()?, 0);
        assert_eq!(queue.count(BOB)?, 1);
        Ok(())
    }

    #[test]
    fn drain_removes_malformed_rows() -> Result<()> {
        let (_dir, queue) = open_queue(1000, Duration::from_secs(3600));

        queue.enqueue(BOB, ALICE, b"good")?;
        let mut bad_key = recipient_prefix(BOB);
        bad_key.extend_from_slice(&u64::MAX.to_be_bytes());
        queue.tree.insert(bad_key, b"garbage".as_slice()).expect("raw insert");

        let frames = drain_all(&queue, BOB);
        assert_eq!(frames, vec![b"good".to_vec()]);
        assert_eq!(queue.count(BOB)?, 0);
        Ok(())
    }

    #[test]
    fn queue_survives_restart_in_order() -> Result<()> {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("queue.db");

        {
            let db = crate::open_db(&path)?;
            let queue = MessageQueue::new(&db, 1000, Duration::from_secs(3600))?;
            queue.enqueue(BOB, ALICE, b"first")?;
            queue.enqueue(BOB, ALICE, b"second")?;
            db.flush().expect("flush");
        }

        let db = crate::open_db(&path)?;
        let queue = MessageQueue::new(&db, 1000, Duration::from_secs(3600))?;
        assert_eq!(queue.count(BOB)?, 2);
        assert_eq!(
            drain_all(&queue, BOB),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        Ok(())
    }
}

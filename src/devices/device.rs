//! The per-connection device actor.
//!
//! A [`Device`] owns everything tied to one accepted connection: identity
//! (`id` + `key`), the convey attributes presented at connect time, a bounded
//! outbound queue serviced by the write pump, traffic statistics, and the
//! one-shot closed flag. The manager holds the authoritative reference from
//! insertion until removal; everything handed to listeners or route handlers
//! is a borrow or an `Arc` clone.
//!
//! ## Close protocol
//!
//! [`Device::close`] performs the only state transition a device has: open →
//! closed. Exactly one caller wins; it records the [`CloseReason`] and flips
//! the watch channel the pumps select on. The pumps then exit, the manager
//! drains the queue, and the `Disconnect` event is the last event emitted for
//! the device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::transaction::Transactions;
use crate::convey::{Compliance, Convey};
use crate::error::{CloseReason, DeviceError};
use crate::id::DeviceId;
use crate::metadata::Metadata;
use crate::wrp::{Message, Routable, WireFormat};

/// Milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Opaque routing token distinguishing two connections that share an id
/// (e.g. a replacement connection from the same device).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The default key: a random UUIDv4 in unpadded URL-safe base64.
    #[must_use]
    pub fn random() -> Self {
        Self(URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An outbound message bound for a device.
#[derive(Debug)]
pub struct Request {
    pub message: Message,
    pub format: WireFormat,
    /// Pre-encoded frame bytes. Empty means the write pump encodes
    /// [`Request::message`] itself.
    pub contents: Vec<u8>,
    /// Optional deadline covering queue acceptance and the transaction wait.
    pub timeout: Option<std::time::Duration>,
}

impl Request {
    #[must_use]
    pub fn new(message: Message, format: WireFormat) -> Self {
        Self {
            message,
            format,
            contents: Vec::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_contents(mut self, contents: Vec<u8>) -> Self {
        self.contents = contents;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Correlation key, when this request expects a response.
    #[must_use]
    pub fn transaction_key(&self) -> Option<&str> {
        self.message.transaction_key()
    }
}

/// Inbound correlation result delivered to a waiting [`Device::send`] caller.
#[derive(Debug)]
pub struct Response {
    pub device: Arc<Device>,
    pub message: Message,
    pub format: WireFormat,
    pub contents: Vec<u8>,
}

/// Per-device traffic counters. Atomics so the pumps never take a lock on
/// the hot path.
#[derive(Debug, Default)]
pub struct Statistics {
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
    duplications: AtomicU64,
    last_pong_ms: AtomicU64,
}

/// Point-in-time copy of [`Statistics`], as rendered in the device JSON.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
    pub duplications: u64,
    pub last_pong: u64,
}

impl Statistics {
    /// One successful frame write.
    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// One successful frame decode.
    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// This device was displaced by a same-id arrival.
    pub fn record_duplication(&self) {
        self.duplications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stamp_pong(&self, epoch_ms: u64) {
        self.last_pong_ms.store(epoch_ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_pong_ms(&self) -> u64 {
        self.last_pong_ms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            duplications: self.duplications.load(Ordering::Relaxed),
            last_pong: self.last_pong_ms(),
        }
    }
}

#[derive(Debug)]
struct CloseState {
    closed: bool,
    reason: Option<CloseReason>,
}

/// A connected device.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    key: Key,
    convey: Option<Convey>,
    compliance: Compliance,
    connected_at_ms: u64,
    metadata: Metadata,
    statistics: Statistics,
    outbound: mpsc::Sender<Request>,
    state: Mutex<CloseState>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    transactions: Arc<Transactions>,
}

impl Device {
    /// Construct a device with a send queue of `queue_size`.
    ///
    /// Returns the device and the receiving half of its queue, which the
    /// write pump owns for the life of the connection.
    #[must_use]
    pub fn new(
        id: DeviceId,
        key: Key,
        convey: Option<Convey>,
        compliance: Compliance,
        queue_size: usize,
        transactions: Arc<Transactions>,
    ) -> (Arc<Self>, mpsc::Receiver<Request>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_size.max(1));
        let (close_tx, _) = watch::channel(false);
        let now = now_ms();
        let statistics = Statistics::default();
        statistics.stamp_pong(now);
        let device = Arc::new(Self {
            id,
            key,
            convey,
            compliance,
            connected_at_ms: now,
            metadata: Metadata::new(),
            statistics,
            outbound,
            state: Mutex::new(CloseState {
                closed: false,
                reason: None,
            }),
            closed: AtomicBool::new(false),
            close_tx,
            transactions,
        });
        (device, outbound_rx)
    }

    /// Enqueue a request for delivery.
    ///
    /// Without a timeout the enqueue is non-blocking: a full queue fails with
    /// [`DeviceError::DeviceBusy`]. With a timeout, the enqueue may wait for
    /// queue space until the deadline ([`DeviceError::Timeout`]).
    ///
    /// Requests carrying a transaction key block until the response arrives
    /// (`Ok(Some(_))`), the transaction is cancelled, or the deadline
    /// expires; requests without a key return `Ok(None)` once accepted.
    pub async fn send(self: &Arc<Self>, request: Request) -> Result<Option<Response>, DeviceError> {
        if self.closed() {
            return Err(DeviceError::DeviceClosed);
        }

        let deadline = request
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        let transaction = match request.transaction_key() {
            Some(key) => {
                let key = key.to_string();
                let rx = self.transactions.register(&key)?;
                Some((key, rx))
            }
            None => None,
        };

        let enqueued = match deadline {
            None => self.outbound.try_send(request).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => DeviceError::DeviceBusy,
                mpsc::error::TrySendError::Closed(_) => DeviceError::DeviceClosed,
            }),
            Some(at) => match tokio::time::timeout_at(at, self.outbound.send(request)).await {
                Err(_) => Err(DeviceError::Timeout),
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(DeviceError::DeviceClosed),
            },
        };

        if let Err(err) = enqueued {
            if let Some((key, _rx)) = transaction {
                self.transactions.cancel(&key);
            }
            return Err(err);
        }

        let Some((key, rx)) = transaction else {
            return Ok(None);
        };

        let outcome = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx).await {
                Err(_) => {
                    self.transactions.cancel(&key);
                    return Err(DeviceError::Timeout);
                }
                Ok(received) => received,
            },
            None => rx.await,
        };

        match outcome {
            Ok(Some(response)) => Ok(Some(response)),
            // A cancelled transaction delivers None; a dropped sender (table
            // torn down) reads the same way to the caller.
            Ok(None) | Err(_) => Err(DeviceError::Transaction(
                crate::error::TransactionError::TransactionCancelled,
            )),
        }
    }

    /// Mark the device closed with `reason`. Idempotent; returns whether this
    /// call performed the open → closed transition.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock().expect("device state lock poisoned");
        if state.closed {
            return false;
        }
        state.closed = true;
        state.reason = Some(reason);
        drop(state);
        self.closed.store(true, Ordering::Release);
        eprintln!("DEBUG close() sending true, receiver_count={}", self.close_tx.receiver_count());
        let send_result = self.close_tx.send(true);
        eprintln!("DEBUG close() send result={:?}", send_result.is_ok());
        true
    }

    /// A watch that flips to `true` when the device closes. Each pump holds
    /// one and selects on it.
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().expect("device state lock poisoned").reason
    }

    /// Number of requests currently queued for the write pump.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    #[must_use]
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    #[must_use]
    pub fn convey(&self) -> Option<&Convey> {
        self.convey.as_ref()
    }

    #[must_use]
    pub fn convey_compliance(&self) -> Compliance {
        self.compliance
    }

    /// Milliseconds since the Unix epoch at construction. Never changes.
    #[must_use]
    pub fn connected_at_ms(&self) -> u64 {
        self.connected_at_ms
    }

    #[must_use]
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Device", 7)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("key", &self.key)?;
        s.serialize_field("pending", &self.pending())?;
        s.serialize_field("statistics", &self.statistics.snapshot())?;
        s.serialize_field("connectedAt", &self.connected_at_ms)?;
        s.serialize_field("closed", &self.closed())?;
        s.serialize_field("closeReason", &self.close_reason())?;
        s.end()
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

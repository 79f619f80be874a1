//! Device lifecycle management.
//!
//! [`DeviceManager`] is the single authority for admitting, addressing, and
//! disconnecting device connections. Per accepted connection it runs three
//! logical tasks:
//!
//! - the **read pump** decodes inbound frames, completes transactions, and
//!   answers protocol pings;
//! - the **write pump** serialises the device's bounded send queue onto the
//!   socket and emits keep-alive pings;
//! - the **supervisor** (the upgrade future itself) waits for either pump to
//!   stop, then removes the device from the registry, drains its queue as
//!   `MessageFailed` events, and emits the final `Disconnect`.
//!
//! ## Lifecycle
//!
//! A device has exactly one transition: open → closed. Any of read error,
//! write error, inactivity sweep, operator disconnect, duplicate displacement,
//! or shutdown performs it; whichever wins records the close reason, and the
//! pumps observe the flip through the device's watch channel. Event ordering
//! is guaranteed per device: `Connect` first, `Disconnect` last, nothing
//! after `Disconnect`.

pub mod device;
pub mod registry;
pub mod transaction;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message as WsFrame, Utf8Bytes, WebSocket};
use axum::http::HeaderMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::convey::{Compliance, Convey};
use crate::error::{CloseReason, DeviceError};
use crate::events::{Event, Listeners};
use crate::id::DeviceId;
use crate::wrp::{Routable, WireFormat};

use device::{now_ms, Device, Key, Request, Response};
use registry::{DuplicatePolicy, Registry};
use transaction::Transactions;

/// Derives the routing [`Key`] for an accepted connection from its identity,
/// convey attributes, and the upgrade request headers.
pub type KeyFunc =
    Arc<dyn Fn(&DeviceId, Option<&Convey>, &HeaderMap) -> Result<Key, DeviceError> + Send + Sync>;

/// Optional gate consulted during connect; an error rejects the device before
/// the registry ever sees it.
pub type ConnectFilter =
    Arc<dyn Fn(&DeviceId, Option<&Convey>, &HeaderMap) -> Result<(), DeviceError> + Send + Sync>;

/// Tunables for the manager and its devices.
#[derive(Clone)]
pub struct DeviceOptions {
    /// Capacity of each device's send queue.
    pub queue_size: usize,
    /// Total device cap; 0 means effectively unbounded.
    pub max_devices: u32,
    pub duplicate_policy: DuplicatePolicy,
    /// Keep-alive ping cadence on the write pump.
    pub ping_interval: Duration,
    /// A device whose last pong is older than this is disconnected by the
    /// inactivity sweep.
    pub idle_timeout: Duration,
    /// Largest inbound frame the read pump accepts; 0 disables the check.
    pub max_frame_bytes: usize,
    /// Frame format used when a caller doesn't specify one.
    pub default_format: WireFormat,
    pub key_func: KeyFunc,
    pub filter: Option<ConnectFilter>,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            queue_size: 100,
            max_devices: 0,
            duplicate_policy: DuplicatePolicy::Displace,
            ping_interval: Duration::from_secs(45),
            idle_timeout: Duration::from_secs(135),
            max_frame_bytes: 256 * 1024,
            default_format: WireFormat::Msgpack,
            key_func: Arc::new(|_, _, _| Ok(Key::random())),
            filter: None,
        }
    }
}

/// Inbound frame rejected before decoding.
#[derive(Debug, Error)]
#[error("inbound frame of {size} bytes exceeds the {limit} byte limit")]
struct FrameTooLarge {
    size: usize,
    limit: usize,
}

struct ManagerInner {
    registry: Registry,
    transactions: Arc<Transactions>,
    listeners: Listeners,
    options: DeviceOptions,
    /// Connections currently supervised (admitted, not yet retired).
    active: AtomicUsize,
    shutting_down: AtomicBool,
}

/// Connection lifecycle orchestrator.
///
/// Cloneable — all clones share the same registry, transaction table, and
/// listener list.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl DeviceManager {
    #[must_use]
    pub fn new(options: DeviceOptions) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Registry::new(options.max_devices, options.duplicate_policy),
                transactions: Arc::new(Transactions::new()),
                listeners: Listeners::new(),
                options,
                active: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn options(&self) -> &DeviceOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[must_use]
    pub fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Look up a connected device.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.inner.registry.get(id)
    }

    /// Route `request` to the device connected as `id`.
    ///
    /// Never returns an error derived from another device's state: the only
    /// failures are `DeviceNotFound` and the addressed device's own.
    pub async fn send(
        &self,
        id: &DeviceId,
        request: Request,
    ) -> Result<Option<Response>, DeviceError> {
        let target = self
            .inner
            .registry
            .get(id)
            .ok_or(DeviceError::DeviceNotFound)?;
        target.send(request).await
    }

    /// Disconnect the device connected as `id`. Returns whether this call
    /// performed the close transition (idempotent on already-closed devices).
    pub fn disconnect(&self, id: &DeviceId, reason: CloseReason) -> bool {
        self.inner
            .registry
            .get(id)
            .is_some_and(|device| device.close(reason))
    }

    /// Disconnect every device matching `pred`. Returns the number of close
    /// transitions performed.
    pub fn disconnect_if(
        &self,
        mut pred: impl FnMut(&Arc<Device>) -> bool,
        reason: CloseReason,
    ) -> usize {
        let mut closed = 0;
        self.inner.registry.visit_if(&mut pred, |target| {
            if target.close(reason) {
                closed += 1;
            }
        });
        closed
    }

    /// Disconnect every device.
    pub fn disconnect_all(&self, reason: CloseReason) -> usize {
        self.disconnect_if(|_| true, reason)
    }

    /// Disconnect devices whose last pong predates the idle timeout.
    pub fn sweep_inactive(&self) -> usize {
        let timeout_ms = self.inner.options.idle_timeout.as_millis() as u64;
        if timeout_ms == 0 {
            return 0;
        }
        let now = now_ms();
        let swept = self.disconnect_if(
            |target| now.saturating_sub(target.statistics().last_pong_ms()) > timeout_ms,
            CloseReason::Inactivity,
        );
        if swept > 0 {
            info!(count = swept, "swept inactive devices");
        }
        swept
    }

    /// Disconnect everything with reason `ServiceClosing` and wait for every
    /// connection supervisor to retire its device.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let closed = self.disconnect_all(CloseReason::ServiceClosing);
        if closed > 0 {
            info!(count = closed, "closing devices for shutdown");
        }
        while self.inner.active.load(Ordering::Acquire) > 0 {
            eprintln!("DEBUG shutdown loop active={}", self.inner.active.load(Ordering::Acquire));
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.inner.transactions.cancel_all();
    }

    /// Drive one accepted connection to completion. This is the connection's
    /// supervisor task; it returns when the device has been retired.
    pub async fn run_connection(
        &self,
        socket: WebSocket,
        id: DeviceId,
        key: Key,
        convey: Option<Convey>,
        compliance: Compliance,
    ) {
        let (mut sink, mut stream) = socket.split();

        if self.is_shutting_down() {
            let frame = CloseFrame {
                code: close_code::RESTART,
                reason: Utf8Bytes::from_static("service closing"),
            };
            let _ = sink.send(WsFrame::Close(Some(frame))).await;
            return;
        }

        let (device, outbound_rx) = Device::new(
            id,
            key,
            convey,
            compliance,
            self.inner.options.queue_size,
            Arc::clone(&self.inner.transactions),
        );

        if let Err(err) = self.admit(Arc::clone(&device)) {
            warn!(id = %device.id(), "connection refused: {err}");
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: err.to_string().into(),
            };
            let _ = sink.send(WsFrame::Close(Some(frame))).await;
            return;
        }

        // Pongs discovered by the read pump are answered through the write
        // pump, which owns the sink.
        let (control_tx, control_rx) = mpsc::channel::<Bytes>(8);

        let writer = tokio::spawn(Self::write_pump(
            self.clone(),
            Arc::clone(&device),
            sink,
            outbound_rx,
            control_rx,
        ));

        self.read_loop(&device, &mut stream, &control_tx).await;

        // No-op when a pump or a disconnect already closed the device.
        device.close(CloseReason::ReadError);

        match writer.await {
            Ok(outbound_rx) => self.retire(&device, outbound_rx).await,
            Err(err) => {
                warn!(id = %device.id(), "write pump aborted: {err}");
                let (_tx, empty) = mpsc::channel(1);
                self.retire(&device, empty).await;
            }
        }
    }

    /// Insert a device into the registry, closing any displaced occupant,
    /// and emit `Connect`.
    fn admit(&self, device: Arc<Device>) -> Result<(), DeviceError> {
        let (displaced, total) = self.inner.registry.add(Arc::clone(&device))?;
        if let Some(loser) = displaced {
            loser.statistics().record_duplication();
            loser.close(CloseReason::DuplicateConnection);
            info!(id = %loser.id(), "displaced by new connection with same id");
        }
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        info!(id = %device.id(), key = %device.key(), total, "device connected");
        self.inner.listeners.dispatch(&Event::connect(&device));
        Ok(())
    }

    /// Tear a device down after its pumps have stopped: remove it from the
    /// registry, drain undelivered requests as `MessageFailed` (no error —
    /// dropped on disconnect), and emit the final `Disconnect`.
    async fn retire(&self, device: &Arc<Device>, mut outbound_rx: mpsc::Receiver<Request>) {
        device.close(CloseReason::UnknownError);
        let reason = device.close_reason().unwrap_or(CloseReason::UnknownError);

        self.inner.registry.remove(device);

        let mut dropped = 0usize;
        while let Ok(request) = outbound_rx.try_recv() {
            if let Some(key) = request.transaction_key() {
                self.inner.transactions.cancel(key);
            }
            let event =
                Event::message_failed(device, Some(&request.message), Some(request.format), None);
            self.inner.listeners.dispatch(&event);
            dropped += 1;
        }

        self.inner.listeners.dispatch(&Event::disconnect(device, reason));
        info!(id = %device.id(), reason = %reason, dropped, "device disconnected");
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Read frames until the socket fails, the peer closes, or the device is
    /// closed from elsewhere.
    async fn read_loop(
        &self,
        device: &Arc<Device>,
        stream: &mut SplitStream<WebSocket>,
        control_tx: &mpsc::Sender<Bytes>,
    ) {
        let mut closed_rx = device.closed_signal();
        loop {
            tokio::select! {
                biased;
                // wait_for is level-triggered, so a close that lands before
                // this subscription still breaks the loop.
                _ = closed_rx.wait_for(|closed| *closed) => break,
                frame = stream.next() => match frame {
                    None => {
                        device.close(CloseReason::ReadError);
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(id = %device.id(), "read error: {err}");
                        device.close(CloseReason::ReadError);
                        break;
                    }
                    Some(Ok(WsFrame::Close(_))) => {
                        debug!(id = %device.id(), "peer closed connection");
                        device.close(CloseReason::ReadError);
                        break;
                    }
                    Some(Ok(WsFrame::Text(text))) => {
                        self.handle_frame(device, WireFormat::Json, text.as_bytes());
                    }
                    Some(Ok(WsFrame::Binary(data))) => {
                        self.handle_frame(device, WireFormat::Msgpack, &data);
                    }
                    Some(Ok(WsFrame::Ping(payload))) => {
                        let _ = control_tx.try_send(payload);
                    }
                    Some(Ok(WsFrame::Pong(payload))) => {
                        device.statistics().stamp_pong(now_ms());
                        self.inner
                            .listeners
                            .dispatch(&Event::pong(device, &payload));
                    }
                },
            }
        }
    }

    /// Decode one inbound frame and route it: transaction completion,
    /// broken-transaction report, or plain `MessageReceived`.
    fn handle_frame(&self, device: &Arc<Device>, format: WireFormat, bytes: &[u8]) {
        let limit = self.inner.options.max_frame_bytes;
        if limit > 0 && bytes.len() > limit {
            let err = FrameTooLarge {
                size: bytes.len(),
                limit,
            };
            warn!(id = %device.id(), "{err}");
            self.inner
                .listeners
                .dispatch(&Event::message_failed(device, None, Some(format), Some(&err)));
            return;
        }

        let message = match format.decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(id = %device.id(), "failed to decode inbound frame: {err}");
                self.inner
                    .listeners
                    .dispatch(&Event::message_failed(device, None, Some(format), Some(&err)));
                return;
            }
        };

        device.statistics().record_received(bytes.len() as u64);

        let transaction_key = message.transaction_key().map(str::to_string);
        match transaction_key {
            Some(key) if self.inner.transactions.contains(&key) => {
                // Observers see the completion before the waiter sees the
                // response.
                self.inner
                    .listeners
                    .dispatch(&Event::transaction_complete(device, &message, format, bytes));
                let response = Response {
                    device: Arc::clone(device),
                    message,
                    format,
                    contents: bytes.to_vec(),
                };
                if let Err(err) = self.inner.transactions.complete(&key, response) {
                    debug!(id = %device.id(), key = %key, "transaction raced to completion: {err}");
                }
            }
            Some(key) if message.message_type().expects_response() => {
                debug!(id = %device.id(), key = %key, "response with no registered transaction");
                self.inner
                    .listeners
                    .dispatch(&Event::transaction_broken(device, &message, format));
            }
            _ => {
                self.inner
                    .listeners
                    .dispatch(&Event::message_received(device, &message, format, bytes));
            }
        }
    }

    /// Serialise the device's queue onto the socket; emit keep-alive pings
    /// and answer peer pings. Returns the queue receiver so the supervisor
    /// can drain what never made it out.
    async fn write_pump(
        manager: DeviceManager,
        device: Arc<Device>,
        mut sink: SplitSink<WebSocket, WsFrame>,
        mut outbound_rx: mpsc::Receiver<Request>,
        mut control_rx: mpsc::Receiver<Bytes>,
    ) -> mpsc::Receiver<Request> {
        let mut closed_rx = device.closed_signal();
        let mut ping = tokio::time::interval(manager.inner.options.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => break,
                Some(payload) = control_rx.recv() => {
                    if sink.send(WsFrame::Pong(payload)).await.is_err() {
                        device.close(CloseReason::WriteError);
                        break;
                    }
                }
                maybe_request = outbound_rx.recv() => {
                    let Some(request) = maybe_request else { break };
                    if !manager.write_request(&device, &mut sink, request).await {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(WsFrame::Ping(Bytes::new())).await.is_err() {
                        warn!(id = %device.id(), "keep-alive ping failed");
                        device.close(CloseReason::WriteError);
                        break;
                    }
                }
            }
        }

        // Best-effort close frame so the peer learns the reason.
        if let Some(reason) = device.close_reason() {
            let frame = CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static(reason.as_str()),
            };
            let _ = sink.send(WsFrame::Close(Some(frame))).await;
        }

        outbound_rx
    }

    /// Encode (if needed) and write one request. Returns `false` when the
    /// pump must stop (write failure).
    async fn write_request(
        &self,
        device: &Arc<Device>,
        sink: &mut SplitSink<WebSocket, WsFrame>,
        request: Request,
    ) -> bool {
        let Request {
            message,
            format,
            contents,
            ..
        } = request;

        let payload = if contents.is_empty() {
            match format.encode(&message) {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    // Single-frame failure; the connection stays up.
                    warn!(id = %device.id(), "failed to encode outbound message: {err}");
                    if let Some(key) = message.transaction_key() {
                        self.inner.transactions.cancel(key);
                    }
                    self.inner.listeners.dispatch(&Event::message_failed(
                        device,
                        Some(&message),
                        Some(format),
                        Some(&err),
                    ));
                    return true;
                }
            }
        } else {
            Bytes::from(contents)
        };

        let frame = match format {
            WireFormat::Json => match std::str::from_utf8(&payload) {
                Ok(text) => WsFrame::Text(text.to_owned().into()),
                Err(err) => {
                    warn!(id = %device.id(), "outbound JSON contents are not UTF-8: {err}");
                    if let Some(key) = message.transaction_key() {
                        self.inner.transactions.cancel(key);
                    }
                    self.inner.listeners.dispatch(&Event::message_failed(
                        device,
                        Some(&message),
                        Some(format),
                        Some(&err),
                    ));
                    return true;
                }
            },
            WireFormat::Msgpack => WsFrame::Binary(payload.clone()),
        };

        match sink.send(frame).await {
            Ok(()) => {
                device.statistics().record_sent(payload.len() as u64);
                self.inner.listeners.dispatch(&Event::message_sent(
                    device,
                    &message,
                    format,
                    &payload,
                ));
                true
            }
            Err(err) => {
                warn!(id = %device.id(), "write error: {err}");
                if let Some(key) = message.transaction_key() {
                    self.inner.transactions.cancel(key);
                }
                self.inner.listeners.dispatch(&Event::message_failed(
                    device,
                    Some(&message),
                    Some(format),
                    Some(&err),
                ));
                device.close(CloseReason::WriteError);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::wrp::Message;
    use std::sync::Mutex;

    fn manager_with(options: DeviceOptions) -> DeviceManager {
        DeviceManager::new(options)
    }

    fn new_device(manager: &DeviceManager, id: &str) -> (Arc<Device>, mpsc::Receiver<Request>) {
        Device::new(
            DeviceId::parse(id).unwrap(),
            Key::random(),
            None,
            Compliance::Missing,
            manager.inner.options.queue_size,
            Arc::clone(&manager.inner.transactions),
        )
    }

    /// Record `(kind, device id)` pairs for assertions.
    fn record_events(manager: &DeviceManager) -> Arc<Mutex<Vec<(EventKind, String)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        manager.listeners().add(move |event| {
            sink.lock()
                .unwrap()
                .push((event.kind, event.device.id().as_str().to_string()));
        });
        log
    }

    #[tokio::test]
    async fn test_duplicate_displacement() {
        let manager = manager_with(DeviceOptions::default());
        let log = record_events(&manager);

        let (first, _rx1) = new_device(&manager, "mac:0000000000aa");
        let (second, _rx2) = new_device(&manager, "mac:0000000000aa");

        manager.admit(Arc::clone(&first)).unwrap();
        manager.admit(Arc::clone(&second)).unwrap();

        assert_eq!(manager.registry().len(), 1);
        assert!(first.closed());
        assert_eq!(first.close_reason(), Some(CloseReason::DuplicateConnection));
        assert_eq!(first.statistics().snapshot().duplications, 1);
        assert!(!second.closed());

        let kinds: Vec<EventKind> = log.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, [EventKind::Connect, EventKind::Connect]);
    }

    #[tokio::test]
    async fn test_reject_policy_surfaces_non_unique_id() {
        let options = DeviceOptions {
            duplicate_policy: DuplicatePolicy::Reject,
            ..DeviceOptions::default()
        };
        let manager = manager_with(options);

        let (first, _rx1) = new_device(&manager, "mac:0000000000aa");
        let (second, _rx2) = new_device(&manager, "mac:0000000000aa");

        manager.admit(first).unwrap();
        assert_eq!(
            manager.admit(second).unwrap_err(),
            DeviceError::NonUniqueId
        );
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_then_disconnects() {
        let options = DeviceOptions {
            queue_size: 64,
            ..DeviceOptions::default()
        };
        let manager = manager_with(options);
        let log = record_events(&manager);

        let (device, outbound_rx) = new_device(&manager, "mac:0000000000aa");
        manager.admit(Arc::clone(&device)).unwrap();

        for _ in 0..50 {
            let request = Request::new(Message::event("event:status"), WireFormat::Msgpack);
            let outcome = manager.send(device.id(), request).await.unwrap();
            assert!(outcome.is_none());
        }
        assert_eq!(device.pending(), 50);

        // Stand in for the connection supervisor: retire once closed.
        let supervisor_manager = manager.clone();
        let supervised = Arc::clone(&device);
        let supervisor = tokio::spawn(async move {
            let mut closed = supervised.closed_signal();
            eprintln!("DEBUG supervisor subscribed, borrow={}", *closed.borrow());
            let _ = closed.wait_for(|closed| { eprintln!("DEBUG pred check value={}", closed); *closed }).await;
            eprintln!("DEBUG supervisor wait_for resolved, calling retire");
            supervisor_manager.retire(&supervised, outbound_rx).await;
            eprintln!("DEBUG supervisor retire done");
        });

        manager.shutdown().await;
        supervisor.await.unwrap();

        assert_eq!(device.close_reason(), Some(CloseReason::ServiceClosing));
        assert!(manager.registry().is_empty());

        let kinds: Vec<EventKind> = log.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds[0], EventKind::Connect);
        assert_eq!(
            &kinds[1..=50],
            &vec![EventKind::MessageFailed; 50][..],
            "all 50 undelivered requests fail"
        );
        assert_eq!(*kinds.last().unwrap(), EventKind::Disconnect);

        let request = Request::new(Message::event("event:status"), WireFormat::Msgpack);
        assert_eq!(
            manager.send(device.id(), request).await.unwrap_err(),
            DeviceError::DeviceNotFound
        );
        let request = Request::new(Message::event("event:status"), WireFormat::Msgpack);
        assert_eq!(
            device.send(request).await.unwrap_err(),
            DeviceError::DeviceClosed
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_device() {
        let manager = manager_with(DeviceOptions::default());
        let request = Request::new(Message::event("event:status"), WireFormat::Msgpack);
        assert_eq!(
            manager
                .send(&DeviceId::parse("mac:0000000000ff").unwrap(), request)
                .await
                .unwrap_err(),
            DeviceError::DeviceNotFound
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager_with(DeviceOptions::default());
        let (device, _rx) = new_device(&manager, "mac:0000000000aa");
        manager.admit(Arc::clone(&device)).unwrap();

        assert!(manager.disconnect(device.id(), CloseReason::GoAway));
        assert!(!manager.disconnect(device.id(), CloseReason::Shutdown));
        assert_eq!(device.close_reason(), Some(CloseReason::GoAway));
    }

    #[tokio::test]
    async fn test_disconnect_if_matches_subset() {
        let manager = manager_with(DeviceOptions::default());
        let (a, _rx_a) = new_device(&manager, "mac:0000000000aa");
        let (b, _rx_b) = new_device(&manager, "mac:0000000000bb");
        manager.admit(Arc::clone(&a)).unwrap();
        manager.admit(Arc::clone(&b)).unwrap();

        let closed = manager.disconnect_if(
            |d| d.id().as_str().ends_with("aa"),
            CloseReason::Rehash,
        );
        assert_eq!(closed, 1);
        assert!(a.closed());
        assert!(!b.closed());
    }

    #[tokio::test]
    async fn test_sweep_disconnects_stale_devices() {
        let options = DeviceOptions {
            idle_timeout: Duration::from_millis(100),
            ..DeviceOptions::default()
        };
        let manager = manager_with(options);

        let (stale, _rx_stale) = new_device(&manager, "mac:0000000000aa");
        let (fresh, _rx_fresh) = new_device(&manager, "mac:0000000000bb");
        manager.admit(Arc::clone(&stale)).unwrap();
        manager.admit(Arc::clone(&fresh)).unwrap();

        stale.statistics().stamp_pong(1);
        fresh.statistics().stamp_pong(now_ms());

        assert_eq!(manager.sweep_inactive(), 1);
        assert!(stale.closed());
        assert_eq!(stale.close_reason(), Some(CloseReason::Inactivity));
        assert!(!fresh.closed());
    }

    #[tokio::test]
    async fn test_inbound_frame_completes_transaction() {
        let manager = manager_with(DeviceOptions::default());
        let log = record_events(&manager);

        let (device, _rx) = new_device(&manager, "mac:0000000000aa");
        manager.admit(Arc::clone(&device)).unwrap();

        let sender = Arc::clone(&device);
        let send_task = tokio::spawn(async move {
            let request = Request::new(
                Message::request("mac:0000000000aa", "t-100"),
                WireFormat::Msgpack,
            );
            sender.send(request).await
        });
        while manager.inner.transactions.len() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let reply = Message::request("dns:caller.example.net", "t-100");
        let bytes = WireFormat::Msgpack.encode(&reply).unwrap();
        manager.handle_frame(&device, WireFormat::Msgpack, &bytes);

        let response = send_task.await.unwrap().unwrap().unwrap();
        assert_eq!(response.message.transaction_uuid.as_deref(), Some("t-100"));
        assert_eq!(response.contents, bytes);
        assert_eq!(device.statistics().snapshot().messages_received, 1);

        let kinds: Vec<EventKind> = log.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert!(kinds.contains(&EventKind::TransactionComplete));
        assert!(!kinds.contains(&EventKind::MessageReceived));
    }

    #[tokio::test]
    async fn test_unclaimed_response_is_broken_transaction() {
        let manager = manager_with(DeviceOptions::default());
        let log = record_events(&manager);

        let (device, _rx) = new_device(&manager, "mac:0000000000aa");
        manager.admit(Arc::clone(&device)).unwrap();

        let reply = Message::request("dns:caller.example.net", "t-none");
        let bytes = WireFormat::Msgpack.encode(&reply).unwrap();
        manager.handle_frame(&device, WireFormat::Msgpack, &bytes);

        let kinds: Vec<EventKind> = log.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert!(kinds.contains(&EventKind::TransactionBroken));
    }

    #[tokio::test]
    async fn test_keyless_event_is_message_received() {
        let manager = manager_with(DeviceOptions::default());
        let log = record_events(&manager);

        let (device, _rx) = new_device(&manager, "mac:0000000000aa");
        manager.admit(Arc::clone(&device)).unwrap();

        let event = Message::event("event:node-change");
        let bytes = WireFormat::Msgpack.encode(&event).unwrap();
        manager.handle_frame(&device, WireFormat::Msgpack, &bytes);

        let kinds: Vec<EventKind> = log.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert!(kinds.contains(&EventKind::MessageReceived));
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_close() {
        let manager = manager_with(DeviceOptions::default());
        let log = record_events(&manager);

        let (device, _rx) = new_device(&manager, "mac:0000000000aa");
        manager.admit(Arc::clone(&device)).unwrap();

        manager.handle_frame(&device, WireFormat::Json, b"{broken");
        assert!(!device.closed());
        assert_eq!(device.statistics().snapshot().messages_received, 0);

        let kinds: Vec<EventKind> = log.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert!(kinds.contains(&EventKind::MessageFailed));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let options = DeviceOptions {
            max_frame_bytes: 16,
            ..DeviceOptions::default()
        };
        let manager = manager_with(options);
        let log = record_events(&manager);

        let (device, _rx) = new_device(&manager, "mac:0000000000aa");
        manager.admit(Arc::clone(&device)).unwrap();

        let big = Message::event("event:status").with_payload("text/plain", vec![0u8; 64]);
        let bytes = WireFormat::Msgpack.encode(&big).unwrap();
        manager.handle_frame(&device, WireFormat::Msgpack, &bytes);

        let kinds: Vec<EventKind> = log.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert!(kinds.contains(&EventKind::MessageFailed));
        assert!(!kinds.contains(&EventKind::MessageReceived));
    }
}

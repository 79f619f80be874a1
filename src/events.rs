//! Device lifecycle and traffic events.
//!
//! Every observable thing the manager does is announced as an [`Event`] to
//! the registered listeners, synchronously and in registration order, on the
//! task that produced it. Listeners must not block; anything slow belongs on
//! the listener's own queue. A panicking listener is isolated and logged so
//! the remaining listeners still run.
//!
//! Events borrow their device, message, and byte slices — none of it may be
//! retained past the listener call.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::devices::device::Device;
use crate::error::CloseReason;
use crate::wrp::{Message, WireFormat};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A device finished its handshake and entered the registry.
    Connect,
    /// The last event for a device; carries the close reason.
    Disconnect,
    /// A frame was written to the device.
    MessageSent,
    /// A decoded inbound message that did not complete a transaction.
    MessageReceived,
    /// An outbound message was not delivered. `error` is `None` when the
    /// message was dropped because the device disconnected, `Some` on write
    /// or encode failure.
    MessageFailed,
    /// An inbound response completed a registered transaction.
    TransactionComplete,
    /// An inbound response carried a transaction key nobody is waiting on.
    TransactionBroken,
    /// The device answered a keep-alive ping.
    Pong,
}

/// Immutable snapshot handed to listeners for the duration of one call.
#[derive(Clone, Copy)]
pub struct Event<'a> {
    pub kind: EventKind,
    pub device: &'a Arc<Device>,
    pub message: Option<&'a Message>,
    pub format: Option<WireFormat>,
    pub contents: Option<&'a [u8]>,
    pub error: Option<&'a (dyn std::error::Error + Send + Sync + 'static)>,
    /// Application payload of the pong frame, for [`EventKind::Pong`].
    pub pong_payload: Option<&'a [u8]>,
    /// Close reason, for [`EventKind::Disconnect`].
    pub reason: Option<CloseReason>,
}

impl<'a> Event<'a> {
    #[must_use]
    pub fn connect(device: &'a Arc<Device>) -> Self {
        Self::bare(EventKind::Connect, device)
    }

    #[must_use]
    pub fn disconnect(device: &'a Arc<Device>, reason: CloseReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::bare(EventKind::Disconnect, device)
        }
    }

    #[must_use]
    pub fn message_sent(
        device: &'a Arc<Device>,
        message: &'a Message,
        format: WireFormat,
        contents: &'a [u8],
    ) -> Self {
        Self {
            message: Some(message),
            format: Some(format),
            contents: Some(contents),
            ..Self::bare(EventKind::MessageSent, device)
        }
    }

    #[must_use]
    pub fn message_received(
        device: &'a Arc<Device>,
        message: &'a Message,
        format: WireFormat,
        contents: &'a [u8],
    ) -> Self {
        Self {
            message: Some(message),
            format: Some(format),
            contents: Some(contents),
            ..Self::bare(EventKind::MessageReceived, device)
        }
    }

    /// An undeliverable outbound message. `error: None` means dropped on
    /// disconnect.
    #[must_use]
    pub fn message_failed(
        device: &'a Arc<Device>,
        message: Option<&'a Message>,
        format: Option<WireFormat>,
        error: Option<&'a (dyn std::error::Error + Send + Sync + 'static)>,
    ) -> Self {
        Self {
            message,
            format,
            error,
            ..Self::bare(EventKind::MessageFailed, device)
        }
    }

    #[must_use]
    pub fn transaction_complete(
        device: &'a Arc<Device>,
        message: &'a Message,
        format: WireFormat,
        contents: &'a [u8],
    ) -> Self {
        Self {
            message: Some(message),
            format: Some(format),
            contents: Some(contents),
            ..Self::bare(EventKind::TransactionComplete, device)
        }
    }

    #[must_use]
    pub fn transaction_broken(
        device: &'a Arc<Device>,
        message: &'a Message,
        format: WireFormat,
    ) -> Self {
        Self {
            message: Some(message),
            format: Some(format),
            ..Self::bare(EventKind::TransactionBroken, device)
        }
    }

    #[must_use]
    pub fn pong(device: &'a Arc<Device>, payload: &'a [u8]) -> Self {
        Self {
            pong_payload: Some(payload),
            ..Self::bare(EventKind::Pong, device)
        }
    }

    fn bare(kind: EventKind, device: &'a Arc<Device>) -> Self {
        Self {
            kind,
            device,
            message: None,
            format: None,
            contents: None,
            error: None,
            pong_payload: None,
            reason: None,
        }
    }
}

/// Handle returned by [`Listeners::add`]; pass it to [`Listeners::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type ListenerFn = Arc<dyn Fn(&Event<'_>) + Send + Sync>;

/// The registered event sinks.
///
/// Cloneable; all clones share the same listener list.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<(ListenerId, ListenerFn)>>>,
    next_id: Arc<AtomicU64>,
}

impl Listeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it will observe every subsequent dispatch in
    /// registration order.
    pub fn add(&self, listener: impl Fn(&Event<'_>) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .write()
            .expect("listener lock poisoned")
            .push((id, Arc::new(listener)));
        id
    }

    /// Deregister. Returns whether the listener was present.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.write().expect("listener lock poisoned");
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Invoke every listener with `event`, in registration order, on the
    /// calling task. A panicking listener does not affect the others.
    pub fn dispatch(&self, event: &Event<'_>) {
        // Snapshot so a listener can add/remove listeners without deadlock.
        let listeners: Vec<ListenerFn> = self
            .inner
            .read()
            .expect("listener lock poisoned")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(
                    id = %event.device.id(),
                    kind = ?event.kind,
                    "event listener panicked: {detail}"
                );
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("listener lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convey::Compliance;
    use crate::devices::device::Key;
    use crate::devices::transaction::Transactions;
    use crate::id::DeviceId;
    use std::sync::Mutex;

    fn test_device() -> Arc<Device> {
        let (device, _rx) = Device::new(
            DeviceId::parse("mac:112233445566").unwrap(),
            Key::random(),
            None,
            Compliance::Missing,
            1,
            Arc::new(Transactions::new()),
        );
        device
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let listeners = Listeners::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            listeners.add(move |_| order.lock().unwrap().push(tag));
        }

        let device = test_device();
        listeners.dispatch(&Event::connect(&device));
        assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    }

    #[test]
    fn test_remove_stops_delivery() {
        let listeners = Listeners::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        let id = listeners.add(move |_| *counter.lock().unwrap() += 1);

        let device = test_device();
        listeners.dispatch(&Event::connect(&device));
        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.dispatch(&Event::connect(&device));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let listeners = Listeners::new();
        let hits = Arc::new(Mutex::new(0));

        listeners.add(|_| panic!("listener bug"));
        let counter = Arc::clone(&hits);
        listeners.add(move |_| *counter.lock().unwrap() += 1);

        let device = test_device();
        listeners.dispatch(&Event::connect(&device));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_event_shapes() {
        let device = test_device();

        let event = Event::disconnect(&device, CloseReason::Inactivity);
        assert_eq!(event.kind, EventKind::Disconnect);
        assert_eq!(event.reason, Some(CloseReason::Inactivity));

        let dropped = Event::message_failed(&device, None, None, None);
        assert_eq!(dropped.kind, EventKind::MessageFailed);
        assert!(dropped.error.is_none());

        let pong = Event::pong(&device, b"keepalive");
        assert_eq!(pong.pong_payload, Some(&b"keepalive"[..]));
    }
}

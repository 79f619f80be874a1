//! Request/response correlation.
//!
//! A transaction is a single-use correlation record keyed by the non-empty
//! string a request carries and its response echoes. [`Transactions::register`]
//! hands the caller a receiver; the read pump [`Transactions::complete`]s the
//! key when the matching response frame arrives. Each key observes exactly one
//! delivery: a response, or `None` for cancellation. Entries are short-lived,
//! so a single mutex over the map is enough.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::device::Response;
use crate::error::TransactionError;

/// The value a waiter reads: `Some(response)` on completion, `None` on
/// cancellation.
pub type TransactionReceiver = oneshot::Receiver<Option<Response>>;

/// Correlation table shared by a manager and its devices.
#[derive(Debug, Default)]
pub struct Transactions {
    pending: Mutex<HashMap<String, oneshot::Sender<Option<Response>>>>,
}

impl Transactions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the response channel for `key`.
    ///
    /// The caller must eventually read the receiver or [`Transactions::cancel`]
    /// the key; an abandoned entry would otherwise hold its slot forever.
    pub fn register(&self, key: &str) -> Result<TransactionReceiver, TransactionError> {
        if key.is_empty() {
            return Err(TransactionError::InvalidTransactionKey);
        }
        let mut pending = self.pending.lock().expect("transaction lock poisoned");
        if pending.contains_key(key) {
            return Err(TransactionError::TransactionAlreadyRegistered);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(key.to_string(), tx);
        Ok(rx)
    }

    /// Deliver `response` to the waiter for `key` and retire the entry.
    ///
    /// At most one completion or cancellation ever succeeds per key; a second
    /// call finds the entry gone and fails with
    /// [`TransactionError::NoSuchTransactionKey`].
    pub fn complete(&self, key: &str, response: Response) -> Result<(), TransactionError> {
        if key.is_empty() {
            return Err(TransactionError::InvalidTransactionKey);
        }
        let sender = self
            .pending
            .lock()
            .expect("transaction lock poisoned")
            .remove(key)
            .ok_or(TransactionError::NoSuchTransactionKey)?;
        // A receiver that gave up is indistinguishable from one that reads a
        // moment later; either way delivery happened at most once.
        let _ = sender.send(Some(response));
        Ok(())
    }

    /// Deliver the cancellation value (`None`) to the waiter for `key` and
    /// retire the entry. No-op if the key is absent.
    pub fn cancel(&self, key: &str) {
        let sender = self
            .pending
            .lock()
            .expect("transaction lock poisoned")
            .remove(key);
        if let Some(sender) = sender {
            let _ = sender.send(None);
        }
    }

    /// Cancel every outstanding transaction (manager shutdown).
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .expect("transaction lock poisoned")
            .drain()
            .collect();
        for (_, sender) in drained {
            let _ = sender.send(None);
        }
    }

    /// Whether `key` currently has a registered waiter.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.pending
            .lock()
            .expect("transaction lock poisoned")
            .contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().expect("transaction lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding keys, for observability.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.pending
            .lock()
            .expect("transaction lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

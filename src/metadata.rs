//! Per-device mutable metadata.
//!
//! The map is read-mostly: every message routed to a device may consult it,
//! while writes are rare (operator annotations, claim refresh). Reads grab an
//! `Arc` snapshot of the whole map; writes rebuild the map and swap the `Arc`,
//! so a reader is never blocked by an in-progress write once it holds its
//! snapshot.
//!
//! Two keys are reserved and refuse [`Metadata::store`]:
//!
//! - `session-id` — a KSUID assigned at construction, stable for the life of
//!   the connection.
//! - `jwt-claims` — the claims object handed over by the authentication
//!   layer at connect time. Typed projections ([`Metadata::trust_claim`],
//!   [`Metadata::partner_id_claim`]) read out of it.

use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use svix_ksuid::{Ksuid, KsuidLike};

/// Reserved key holding the per-connection session identifier.
pub const SESSION_ID_KEY: &str = "session-id";

/// Reserved key holding the nested JWT claims object.
pub const JWT_CLAIMS_KEY: &str = "jwt-claims";

/// Claim key projected by [`Metadata::trust_claim`].
const TRUST_CLAIM_KEY: &str = "trust";

/// Claim key projected by [`Metadata::partner_id_claim`].
const PARTNER_ID_CLAIM_KEY: &str = "partner-id";

/// Copy-on-write metadata map attached to each device.
#[derive(Debug)]
pub struct Metadata {
    inner: RwLock<Arc<Map<String, Value>>>,
}

impl Metadata {
    /// Fresh metadata with a new session id and empty claims.
    #[must_use]
    pub fn new() -> Self {
        Self::with_claims(Map::new())
    }

    /// Fresh metadata carrying the claims decoded during the handshake.
    #[must_use]
    pub fn with_claims(claims: Map<String, Value>) -> Self {
        let mut map = Map::new();
        map.insert(
            SESSION_ID_KEY.to_string(),
            Value::String(Ksuid::new(None, None).to_string()),
        );
        map.insert(JWT_CLAIMS_KEY.to_string(), Value::Object(claims));
        Self {
            inner: RwLock::new(Arc::new(map)),
        }
    }

    /// The session identifier assigned at construction.
    #[must_use]
    pub fn session_id(&self) -> String {
        match self.snapshot().get(SESSION_ID_KEY) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// Point-in-time snapshot of the whole map.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Map<String, Value>> {
        Arc::clone(&self.inner.read().expect("metadata lock poisoned"))
    }

    /// Read a single value out of the current snapshot.
    #[must_use]
    pub fn load(&self, key: &str) -> Option<Value> {
        self.snapshot().get(key).cloned()
    }

    /// Store a value, rebuilding the map. Returns `false` (and stores
    /// nothing) for the reserved keys.
    pub fn store(&self, key: &str, value: Value) -> bool {
        if key == SESSION_ID_KEY || key == JWT_CLAIMS_KEY {
            return false;
        }
        let mut guard = self.inner.write().expect("metadata lock poisoned");
        let mut next = Map::clone(&guard);
        next.insert(key.to_string(), value);
        *guard = Arc::new(next);
        true
    }

    /// The nested claims object (empty map if unset).
    #[must_use]
    pub fn jwt_claims(&self) -> Map<String, Value> {
        match self.snapshot().get(JWT_CLAIMS_KEY) {
            Some(Value::Object(claims)) => claims.clone(),
            _ => Map::new(),
        }
    }

    /// The integer `trust` claim; 0 when absent or non-numeric.
    #[must_use]
    pub fn trust_claim(&self) -> i64 {
        self.jwt_claims()
            .get(TRUST_CLAIM_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    /// The string `partner-id` claim; empty when absent.
    #[must_use]
    pub fn partner_id_claim(&self) -> String {
        self.jwt_claims()
            .get(PARTNER_ID_CLAIM_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

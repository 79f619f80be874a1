#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! wrphub library — the device-connection gateway core.
//!
//! This library exposes the key building blocks:
//! - `id` — canonical device identifier parsing
//! - `convey` — base64 JSON inventory attributes presented at connect
//! - `wrp` — the routed message family and its two wire codecs
//! - `devices` — Device, Registry, Transactions, and the DeviceManager
//! - `events` — typed lifecycle/traffic events and listener dispatch
//! - `metadata` — per-device copy-on-write metadata
//! - `auth` — API key authentication middleware for the control surface
//! - `config` — configuration loading
//! - `routes` — REST route handlers and router assembly
//! - `ws` — the WebSocket connect handshake

pub mod auth;
pub mod config;
pub mod convey;
pub mod devices;
pub mod error;
pub mod events;
pub mod id;
pub mod metadata;
pub mod routes;
pub mod state;
pub mod wrp;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use devices::device::{Device, Key, Request, Response};
pub use devices::{DeviceManager, DeviceOptions};
pub use error::{CloseReason, DeviceError, TransactionError};
pub use events::{Event, EventKind, Listeners};
pub use id::DeviceId;
pub use state::AppState;

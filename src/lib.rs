//! # yrelay — relay server for real-time collaborative editing
//!
//! Many clients open a WebSocket to a named document; the relay keeps
//! every client's local copy converging and persists a durable snapshot
//! when the document goes idle. CRDT merge mathematics is delegated to
//! [`yrs`]; this crate is the session/room management and relay
//! protocol on top of it.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐  WebSocket   ┌──────────────┐
//!            ├─────────────►│ RelayServer  │
//! Client B ──┘ Binary Proto └──────┬───────┘
//!                                  ▼
//!                        ┌──────────────────┐
//!                        │ DocumentRegistry │  name → room
//!                        └────────┬─────────┘
//!                                 ▼
//!                        ┌──────────────────┐
//!                        │ DocumentRoom     │  yrs Doc (authority)
//!                        │  ├─ fan-out      │  + AwarenessTracker
//!                        │  └─ drain        │  + Debouncer
//!                        └────────┬─────────┘
//!                                 ▼
//!                           Persistence (pluggable)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire envelope (sync vs. awareness)
//! - [`awareness`] — ephemeral presence table with version monotonicity
//! - [`connection`] — outbound queueing and ping/pong liveness
//! - [`room`] — per-document relay, broadcast and close/drain path
//! - [`registry`] — name → room map with guarded release
//! - [`persistence`] — durability hooks and the update debouncer
//! - [`server`] — WebSocket transport adapter

pub mod awareness;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use awareness::{encode_entries, AwarenessChange, AwarenessTracker, ClientId};
pub use connection::{
    Connection, Heartbeat, Probe, SendError, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_PING_INTERVAL,
};
pub use persistence::{
    Debouncer, Persistence, PersistenceError, DEFAULT_DEBOUNCE_MAX_WAIT, DEFAULT_DEBOUNCE_WAIT,
};
pub use protocol::{Message, ProtocolError, SyncMessage};
pub use registry::DocumentRegistry;
pub use room::{
    ContentInitializer, DocumentRoom, ErrorObserver, RoomError, RoomOptions, UpdateCallback,
};
pub use server::{RelayConfig, RelayServer, ServerStats};

//! # coedit-session: client-side session sync engine for collaborative editing
//!
//! Keeps a local CRDT replica of a shared text document consistent with the
//! other participants through a relay, while tracking presence, latency,
//! undo history and the health of the rendered view.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │  SyncClient  │ ◄────────────────► │   DevRelay   │
//! │ (per user)   │     JSON frames    │  (in-memory) │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │SyncController│                    │ Yrs Doc      │
//! │ state machine│                    │ (per room)   │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!  ┌─────┼──────────┬──────────┐     ┌───────┴───────┐
//!  ▼     ▼          ▼          ▼     │ BroadcastGroup│
//! Replica Awareness Undo    Health   │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames and close codes
//! - [`replica`]: CRDT text replica with origin-tagged mutations
//! - [`awareness`]: Presence table, awareness payload codec, emit throttle
//! - [`undo`]: Undo/redo scoped to local edits
//! - [`latency`]: Ping/pong round-trip measurement
//! - [`health`]: Rendered-view crash detection
//! - [`session`]: Session identity and configuration
//! - [`transport`]: WebSocket channel mapping
//! - [`offline`]: Queue for fragments produced while disconnected
//! - [`controller`]: The sync controller state machine
//! - [`client`]: Async driver with reconnect and timers
//! - [`broadcast`]: Room fan-out for the relay
//! - [`relay`]: In-memory development relay

pub mod protocol;
pub mod replica;
pub mod awareness;
pub mod undo;
pub mod latency;
pub mod health;
pub mod session;
pub mod transport;
pub mod offline;
pub mod controller;
pub mod client;
pub mod broadcast;
pub mod relay;

// Re-exports for convenience
pub use protocol::{ChatMessage, ProtocolError, RosterUser, VoiceSignal, WireMessage};
pub use replica::{EditOp, MutationOrigin, ReplicaError, ReplicaManager, Snapshot, UpdateFragment};
pub use awareness::{
    AwarenessChange, AwarenessTable, AwarenessUser, ClientId, CursorRange, EmitThrottle,
    PeerPresence,
};
pub use undo::UndoCoordinator;
pub use latency::{LatencyProber, LatencySample};
pub use health::{
    CrashReason, HealthMonitor, HealthThresholds, HealthVerdict, RenderedState, RenderedView,
    ViewProbeError,
};
pub use session::{
    Credential, PendingUpdatePolicy, ReconnectPolicy, Session, SessionConfig, SessionError,
};
pub use transport::TransportEvent;
pub use offline::OfflineQueue;
pub use controller::{SessionEvent, SessionState, SyncController};
pub use client::{ClientCommand, ClientHandle, SyncClient};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use relay::{DevRelay, RelayConfig, RelayError, RelayStats};

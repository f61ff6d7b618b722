//! # taskflow-sync: real-time event channel for the taskflow client
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON text frames   ┌──────────────┐
//! │  Connector   │ ◄──────────────────► │ RelayServer  │
//! │ (one per UI) │  event / ack / ping  │ (dev, tests) │
//! └──────┬───────┘                      └──────────────┘
//!        │ EventRouter
//!        ▼
//! ┌──────────────┐     apply_remote     ┌──────────────┐
//! │ SyncSession  │ ───────────────────► │  Reconciler  │
//! │ (UI surface) │ ◄─── EditTicket ──── │  + store     │
//! └──────────────┘                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: frame codec and the event-name table
//! - [`transport`]: the `Transport` trait and its WebSocket implementation
//! - [`router`]: name-keyed observer table with RAII subscriptions
//! - [`connector`]: connect/reconnect state machine, heartbeat, acked emit
//! - [`debounce`]: trailing-edge debounce over a request scope
//! - [`session`]: wires the connector to the reconciler
//! - [`relay`]: WebSocket relay used for development and integration tests

pub mod connector;
pub mod debounce;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod session;
pub mod transport;

pub use connector::{
    ChannelState, Connector, ConnectorConfig, DisconnectReason, EmitError, EmitOptions,
    LifecycleEvent,
};
pub use debounce::Debouncer;
pub use protocol::{Frame, ProtocolError};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use router::{EventRouter, Subscription};
pub use session::{SessionConfig, SyncError, SyncSession};
pub use transport::{Link, Transport, TransportError, WsTransport};

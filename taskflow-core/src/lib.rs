//! # taskflow-core: client-side state for the taskflow sync layer
//!
//! Transport-independent pieces of the real-time synchronization slice.
//! Expiry, edit tickets and change broadcasts are built on `tokio::time` and
//! `tokio::sync`; nothing here opens a socket.
//!
//! - [`entity`]: tasks, projects and notifications as schema-light records
//! - [`store`]: entity cache with TTL, capacity bound and incremental
//!   aggregates (unread count, per-kind counts)
//! - [`reconcile`]: pending-edit ledger and the server-wins merge policy
//! - [`api`]: the HTTP request/response contract and error taxonomy
//! - [`cancel`]: generation-counter cancellation for stale responses
//!
//! The WebSocket side lives in `taskflow-sync`.

pub mod api;
pub mod cancel;
pub mod entity;
pub mod reconcile;
pub mod store;

pub use api::{ApiError, ErrorCategory, HttpClient, Method, RequestError, RequestOptions, Response};
pub use cancel::{Cancelled, RequestScope, Ticket};
pub use entity::{EditId, Entity, EntityError, EntityId, EntityKey, EntityKind, Patch};
pub use reconcile::{ConflictNotice, EditError, EditTicket, Reconciler, RemoteChange, Resolution};
pub use store::{EntityStore, StoreChange, StoreConfig};

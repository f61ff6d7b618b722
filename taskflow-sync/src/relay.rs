//! WebSocket event relay for local development and integration tests.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌──► Client A
//!            ├── Relay ── entity map ──┼──► Client B
//! Client B ──┘      │                  └──► Client C
//!                   └── broadcast::Sender<Envelope> (fan-out)
//! ```
//!
//! The relay keeps the last-known value of every entity it has seen.
//! `{kind}:update` edits are merged into that map, the version is bumped and
//! the full entity is broadcast to every client (sender included) as
//! `{kind}:updated` carrying the edit's `origin`. Any other event is fanned
//! out to the other clients unchanged.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use taskflow_core::entity::{Entity, EntityKey, EntityKind, Patch};

use crate::protocol::{classify, updated_event, EventAction, Frame};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per client before a slow client starts lagging
    pub broadcast_capacity: usize,
    /// Answer ack requests. Disable to exercise client emit timeouts.
    pub ack_emits: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            ack_emits: true,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_broadcast: u64,
    pub edits_applied: u64,
}

/// Lock-free counters behind [`RelayStats`].
#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_broadcast: AtomicU64,
    edits_applied: AtomicU64,
}

impl AtomicRelayStats {
    fn snapshot(&self) -> RelayStats {
        RelayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_broadcast: self.frames_broadcast.load(Ordering::Relaxed),
            edits_applied: self.edits_applied.load(Ordering::Relaxed),
        }
    }
}

/// One pre-encoded frame on its way to every client.
struct Envelope {
    /// Connection that must not receive it
    skip: Option<Uuid>,
    text: String,
}

struct Shared {
    config: RelayConfig,
    entities: RwLock<HashMap<EntityKey, Entity>>,
    fanout: broadcast::Sender<Arc<Envelope>>,
    stats: AtomicRelayStats,
}

/// The relay server.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let (fanout, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                entities: RwLock::new(HashMap::new()),
                fanout,
                stats: AtomicRelayStats::default(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn stats(&self) -> RelayStats {
        self.shared.stats.snapshot()
    }

    pub async fn entity(&self, key: &EntityKey) -> Option<Entity> {
        self.shared.entities.read().await.get(key).cloned()
    }

    /// Push a server-originated event to every client. Entity events also
    /// update the relay's entity map. Returns how many clients were reached.
    pub async fn publish(&self, event: &str, payload: Value) -> usize {
        self.shared.record(event, &payload).await;
        self.shared.fan_out(None, event, payload)
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.shared.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    #[cfg(test)]
    async fn handle_frame(&self, conn: Uuid, frame: Frame) -> Option<Frame> {
        self.shared.handle_frame(conn, frame).await
    }

    #[cfg(test)]
    fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.shared.fanout.subscribe()
    }
}

impl Shared {
    /// Process one client frame. Returns the direct reply, if any.
    async fn handle_frame(&self, conn: Uuid, frame: Frame) -> Option<Frame> {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        match frame {
            Frame::Ping { seq } => Some(Frame::Pong { seq }),
            Frame::Pong { .. } | Frame::Ack { .. } => None,
            Frame::Event { event, payload, ack } => {
                let reply = match event
                    .strip_suffix(":update")
                    .and_then(EntityKind::parse)
                {
                    Some(kind) => self.apply_update(kind, &payload).await,
                    None => {
                        self.record(&event, &payload).await;
                        self.fan_out(Some(conn), &event, payload);
                        json!({"ok": true})
                    }
                };
                match ack {
                    Some(id) if self.config.ack_emits => Some(Frame::ack(id, reply)),
                    _ => None,
                }
            }
        }
    }

    /// Merge an edit and broadcast the result. Returns the ack payload.
    async fn apply_update(&self, kind: EntityKind, payload: &Value) -> Value {
        let incoming = match Entity::from_payload(kind, payload) {
            Ok(incoming) => incoming,
            Err(e) => {
                log::warn!("rejecting {kind} update: {e}");
                return json!({"error": {"code": "bad_input", "message": e.to_string()}});
            }
        };

        let entity = {
            let mut entities = self.entities.write().await;
            let entity = entities
                .entry(incoming.key())
                .or_insert_with(|| Entity::new(kind, incoming.id.clone()));
            entity.apply_patch(&Patch::from(incoming.fields));
            entity.version += 1;
            entity.clone()
        };
        self.stats.edits_applied.fetch_add(1, Ordering::Relaxed);
        log::debug!("{} now at version {}", entity.key(), entity.version);

        let mut echo = entity.to_payload();
        if let (Some(object), Some(origin)) = (echo.as_object_mut(), payload.get("origin")) {
            object.insert("origin".into(), origin.clone());
        }
        self.fan_out(None, &updated_event(kind), echo);

        json!({"ok": true, "entity": entity.to_payload()})
    }

    /// Keep the entity map in step with entity events passing through.
    async fn record(&self, event: &str, payload: &Value) {
        let Some((kind, action)) = classify(event) else {
            return;
        };
        let Ok(entity) = Entity::from_payload(kind, payload) else {
            log::debug!("not recording malformed {event} payload");
            return;
        };
        let mut entities = self.entities.write().await;
        match action {
            EventAction::Upsert => {
                entities.insert(entity.key(), entity);
            }
            EventAction::Delete => {
                entities.remove(&entity.key());
            }
        }
    }

    fn fan_out(&self, skip: Option<Uuid>, event: &str, payload: Value) -> usize {
        let text = match Frame::event(event, payload).encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("cannot encode {event}: {e}");
                return 0;
            }
        };
        self.stats.frames_broadcast.fetch_add(1, Ordering::Relaxed);
        self.fanout
            .send(Arc::new(Envelope { skip, text }))
            .unwrap_or(0)
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let conn = Uuid::new_v4();
    let mut fanout = shared.fanout.subscribe();

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("Client {conn} connected from {addr}");

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(frame) => {
                            if let Some(reply) = shared.handle_frame(conn, frame).await {
                                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode frame from {addr}: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },

                envelope = fanout.recv() => match envelope {
                    Ok(envelope) => {
                        if envelope.skip == Some(conn) {
                            continue;
                        }
                        ws_sender.send(Message::Text(envelope.text.clone().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Client {conn} lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

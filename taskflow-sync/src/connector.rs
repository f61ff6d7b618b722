//! The single live event channel.
//!
//! ```text
//!                connect()                 open() ok
//!  Disconnected ───────────► Connecting ───────────────► Connected
//!       ▲                        │                         │   ▲
//!       │     attempts exhausted │          link lost      │   │ open() ok
//!       ├────────────────────────┘                         ▼   │
//!       └──────────────────────────────────────────── Reconnecting
//!                           attempts exhausted
//! ```
//!
//! One supervisor task per `connect()` owns the link, the heartbeat and the
//! reconnect loop. `disconnect()` bumps the connection epoch and aborts it;
//! any late state write or callback from an aborted supervisor is dropped by
//! the epoch check. Once `disconnect()` returns no listener is running or
//! will run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use taskflow_core::api::ApiError;

use crate::protocol::{ack_error, Frame};
use crate::router::{EventRouter, Subscription};
use crate::transport::{Link, Transport, TransportError, WsTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ChannelState {
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Reconnecting => "reconnecting",
        }
    }
}

const MIN_HEARTBEAT: Duration = Duration::from_millis(1);

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Connection attempts per connect or reconnect cycle
    pub max_attempts: u32,
    /// First backoff step; doubles per retry
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Ping period while connected
    pub heartbeat_interval: Duration,
    /// How long past a ping the link may stay silent
    pub heartbeat_timeout: Duration,
    /// Linear backoff step between emit retries
    pub emit_base_delay: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(20),
            emit_base_delay: Duration::from_secs(1),
        }
    }
}

impl ConnectorConfig {
    /// Delay before the `retry`-th retry (1-based).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Heartbeat period, never shorter than one millisecond.
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitOptions {
    /// Wait for the ack, per attempt
    pub timeout: Duration,
    /// Extra attempts after the first
    pub retries: u32,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientRequested,
    LinkClosed,
    HeartbeatExpired,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DisconnectReason::ClientRequested => "client requested",
            DisconnectReason::LinkClosed => "link closed",
            DisconnectReason::HeartbeatExpired => "heartbeat expired",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected(DisconnectReason),
    Error(TransportError),
    ReconnectAttempt(u32),
    ReconnectSuccess(u32),
    ReconnectFailed { attempts: u32 },
}

impl LifecycleEvent {
    pub const NAMES: [&'static str; 6] = [
        "connect",
        "disconnect",
        "error",
        "reconnect_attempt",
        "reconnect",
        "reconnect_failed",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Connected => "connect",
            LifecycleEvent::Disconnected(_) => "disconnect",
            LifecycleEvent::Error(_) => "error",
            LifecycleEvent::ReconnectAttempt(_) => "reconnect_attempt",
            LifecycleEvent::ReconnectSuccess(_) => "reconnect",
            LifecycleEvent::ReconnectFailed { .. } => "reconnect_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmitError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("no ack after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("server rejected event: {0}")]
    Rejected(ApiError),
}

struct Control {
    epoch: u64,
    task: Option<JoinHandle<()>>,
    outgoing: Option<mpsc::Sender<Frame>>,
    acks: HashMap<u64, oneshot::Sender<Value>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ConnectorConfig,
    events: EventRouter<Value>,
    lifecycle: EventRouter<LifecycleEvent>,
    state: watch::Sender<ChannelState>,
    control: Mutex<Control>,
    next_ack: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Caller must hold the control lock.
    fn transition(&self, next: ChannelState) -> bool {
        let current = self.current();
        if !current.can_transition_to(next) {
            log::error!("refusing channel transition {current:?} -> {next:?}");
            return false;
        }
        log::debug!("channel {} -> {}", current.as_str(), next.as_str());
        self.state.send_replace(next);
        true
    }

    fn fire(&self, event: LifecycleEvent) {
        self.lifecycle.dispatch(event.name(), &event);
    }

    fn is_live(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    /// Fire only while `epoch` is still the current connection.
    fn fire_live(&self, epoch: u64, event: LifecycleEvent) {
        if self.is_live(epoch) {
            self.fire(event);
        } else {
            log::trace!("dropping {} from a stale connection", event.name());
        }
    }

    fn resolve_ack(&self, id: u64, payload: Value) {
        match self.lock().acks.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(payload);
            }
            None => log::debug!("late or unknown ack {id}"),
        }
    }
}

/// Forgets an ack waiter when its emit attempt ends, however it ends.
struct AckSlot<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for AckSlot<'_> {
    fn drop(&mut self) {
        self.inner.lock().acks.remove(&self.id);
    }
}

/// Owner of the supervisor task; aborts it when the last handle drops.
struct Handle {
    inner: Arc<Inner>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().task.take() {
            task.abort();
        }
    }
}

/// Handle to one event channel. Clones share the channel.
#[derive(Clone)]
pub struct Connector {
    handle: Arc<Handle>,
}

impl Connector {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectorConfig) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let inner = Arc::new(Inner {
            transport,
            config,
            events: EventRouter::new(),
            lifecycle: EventRouter::new(),
            state,
            control: Mutex::new(Control {
                epoch: 0,
                task: None,
                outgoing: None,
                acks: HashMap::new(),
            }),
            next_ack: AtomicU64::new(1),
        });
        Self {
            handle: Arc::new(Handle { inner }),
        }
    }

    pub fn websocket(url: impl Into<String>, config: ConnectorConfig) -> Self {
        Self::new(Arc::new(WsTransport::new(url)), config)
    }

    fn inner(&self) -> &Arc<Inner> {
        &self.handle.inner
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner().config
    }

    pub fn state(&self) -> ChannelState {
        self.inner().current()
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.inner().state.subscribe()
    }

    /// Open the channel.
    ///
    /// A no-op returning `Ok(())` unless the channel is `Disconnected`.
    /// Otherwise resolves once the first connection succeeds or every
    /// attempt has failed.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut control = self.inner().lock();
            let state = self.inner().current();
            if state != ChannelState::Disconnected {
                log::debug!("connect ignored while {}", state.as_str());
                return Ok(());
            }
            control.epoch += 1;
            self.inner().transition(ChannelState::Connecting);
            let task = tokio::spawn(supervise(self.inner().clone(), control.epoch, first_tx));
            if let Some(stale) = control.task.replace(task) {
                stale.abort();
            }
        }
        first_rx.await.unwrap_or(Err(TransportError::Cancelled))
    }

    /// Tear the channel down and release every listener. Safe to repeat.
    pub fn disconnect(&self) {
        let inner = self.inner();
        let was_live = {
            let mut control = inner.lock();
            control.epoch += 1;
            if let Some(task) = control.task.take() {
                task.abort();
            }
            control.outgoing = None;
            // Dropping the senders fails every waiting emit
            control.acks.clear();
            inner.current() != ChannelState::Disconnected
                && inner.transition(ChannelState::Disconnected)
        };
        if was_live {
            log::info!("channel disconnected by client");
            inner.fire(LifecycleEvent::Disconnected(DisconnectReason::ClientRequested));
        }
        inner.events.clear();
        inner.lifecycle.clear();
    }

    /// Send an event and wait for its ack, retrying on ack timeout.
    ///
    /// Returns the ack payload.
    pub async fn emit(
        &self,
        event: &str,
        payload: Value,
        options: EmitOptions,
    ) -> Result<Value, EmitError> {
        let inner = self.inner();
        let attempts = options.retries.saturating_add(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                time::sleep(inner.config.emit_base_delay * (attempt - 1)).await;
            }

            let (id, reply, outgoing) = {
                let mut control = inner.lock();
                let outgoing = match (&control.outgoing, inner.current()) {
                    (Some(outgoing), ChannelState::Connected) => outgoing.clone(),
                    _ => return Err(EmitError::NotConnected),
                };
                let id = inner.next_ack.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                control.acks.insert(id, tx);
                (id, rx, outgoing)
            };

            let _slot = AckSlot { inner, id };

            let frame = Frame::event_with_ack(event, payload.clone(), id);
            if outgoing.send(frame).await.is_err() {
                return Err(EmitError::NotConnected);
            }

            match time::timeout(options.timeout, reply).await {
                Ok(Ok(ack)) => {
                    return match ack_error(&ack) {
                        Some(error) => Err(EmitError::Rejected(error)),
                        None => Ok(ack),
                    };
                }
                // Link went away while waiting
                Ok(Err(_)) => return Err(EmitError::NotConnected),
                Err(_) => {
                    log::warn!("{event}: no ack within {:?} (attempt {attempt}/{attempts})", options.timeout);
                }
            }
        }
        Err(EmitError::Timeout { attempts })
    }

    /// Fire-and-forget send.
    pub fn send(&self, event: &str, payload: Value) -> Result<(), EmitError> {
        let outgoing = match &self.inner().lock().outgoing {
            Some(outgoing) if self.state() == ChannelState::Connected => outgoing.clone(),
            _ => return Err(EmitError::NotConnected),
        };
        outgoing
            .try_send(Frame::event(event, payload))
            .map_err(|_| EmitError::NotConnected)
    }

    /// Subscribe to an inbound server event.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner().events.on(event, handler)
    }

    pub fn off(&self, event: &str) -> usize {
        self.inner().events.off(event)
    }

    pub fn events(&self) -> &EventRouter<Value> {
        &self.inner().events
    }

    /// Subscribe to a lifecycle event by name (see [`LifecycleEvent::NAMES`]).
    pub fn on_lifecycle<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner().lifecycle.on(name, handler)
    }

    pub fn on_connect<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_lifecycle("connect", move |_| handler())
    }

    pub fn on_disconnect<F>(&self, handler: F) -> Subscription
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        self.on_lifecycle("disconnect", move |event| {
            if let LifecycleEvent::Disconnected(reason) = event {
                handler(*reason);
            }
        })
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.on_lifecycle("error", move |event| {
            if let LifecycleEvent::Error(error) = event {
                handler(error);
            }
        })
    }

    pub fn on_reconnect_attempt<F>(&self, handler: F) -> Subscription
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_lifecycle("reconnect_attempt", move |event| {
            if let LifecycleEvent::ReconnectAttempt(n) = event {
                handler(*n);
            }
        })
    }

    pub fn on_reconnect_success<F>(&self, handler: F) -> Subscription
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_lifecycle("reconnect", move |event| {
            if let LifecycleEvent::ReconnectSuccess(n) = event {
                handler(*n);
            }
        })
    }

    pub fn on_reconnect_failed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_lifecycle("reconnect_failed", move |event| {
            if let LifecycleEvent::ReconnectFailed { attempts } = event {
                handler(*attempts);
            }
        })
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("state", &self.state())
            .field("config", &self.inner().config)
            .finish()
    }
}

async fn supervise(
    inner: Arc<Inner>,
    epoch: u64,
    first: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut first = Some(first);
    let mut reconnecting = false;

    loop {
        let (link, attempt) = match establish(&inner, epoch, reconnecting).await {
            Ok(established) => established,
            Err(err) => {
                if let Some(first) = first.take() {
                    let _ = first.send(Err(err));
                }
                return;
            }
        };

        let Link { outgoing, incoming } = link;
        {
            let mut control = inner.lock();
            if control.epoch != epoch {
                return;
            }
            control.outgoing = Some(outgoing.clone());
            inner.transition(ChannelState::Connected);
        }
        log::info!("channel connected (attempt {attempt})");
        inner.fire_live(epoch, LifecycleEvent::Connected);
        if reconnecting {
            inner.fire_live(epoch, LifecycleEvent::ReconnectSuccess(attempt));
        }
        if let Some(first) = first.take() {
            let _ = first.send(Ok(()));
        }

        let reason = run_link(&inner, epoch, outgoing, incoming).await;

        {
            let mut control = inner.lock();
            if control.epoch != epoch {
                return;
            }
            control.outgoing = None;
            control.acks.clear();
            inner.transition(ChannelState::Reconnecting);
        }
        log::warn!("channel lost: {reason}");
        inner.fire_live(epoch, LifecycleEvent::Disconnected(reason));
        reconnecting = true;
    }
}

/// One bounded connect cycle. Returns the link and the attempt that won.
async fn establish(
    inner: &Inner,
    epoch: u64,
    reconnecting: bool,
) -> Result<(Link, u32), TransportError> {
    let config = &inner.config;
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if reconnecting {
            inner.fire_live(epoch, LifecycleEvent::ReconnectAttempt(attempt));
            time::sleep(config.backoff_delay(attempt)).await;
        } else if attempt > 1 {
            time::sleep(config.backoff_delay(attempt - 1)).await;
        }

        let error = match time::timeout(config.connect_timeout, inner.transport.open()).await {
            Ok(Ok(link)) => return Ok((link, attempt)),
            Ok(Err(err)) => err,
            Err(_) => TransportError::ConnectTimeout(config.connect_timeout),
        };
        log::warn!("connection attempt {attempt}/{max_attempts} failed: {error}");
        inner.fire_live(epoch, LifecycleEvent::Error(error));
    }

    {
        let mut control = inner.lock();
        if control.epoch == epoch {
            control.outgoing = None;
            inner.transition(ChannelState::Disconnected);
        }
    }
    log::error!("giving up after {max_attempts} connection attempts");
    inner.fire_live(
        epoch,
        LifecycleEvent::ReconnectFailed {
            attempts: max_attempts,
        },
    );
    Err(TransportError::RetriesExhausted {
        attempts: max_attempts,
    })
}

/// Pump one link until it dies.
async fn run_link(
    inner: &Inner,
    epoch: u64,
    outgoing: mpsc::Sender<Frame>,
    mut incoming: mpsc::Receiver<Frame>,
) -> DisconnectReason {
    let interval = inner.config.heartbeat_period();
    let grace = interval + inner.config.heartbeat_timeout;

    let mut heartbeat = time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let expiry = time::sleep(grace);
    tokio::pin!(expiry);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            frame = incoming.recv() => {
                let Some(frame) = frame else {
                    return DisconnectReason::LinkClosed;
                };
                expiry.as_mut().reset(Instant::now() + grace);
                match frame {
                    Frame::Event { event, payload, ack } => {
                        if !inner.is_live(epoch) {
                            return DisconnectReason::ClientRequested;
                        }
                        inner.events.dispatch(&event, &payload);
                        if let Some(id) = ack {
                            let _ = outgoing.try_send(Frame::ack(id, json!({"ok": true})));
                        }
                    }
                    Frame::Ack { ack, payload } => inner.resolve_ack(ack, payload),
                    Frame::Ping { seq } => {
                        let _ = outgoing.try_send(Frame::Pong { seq });
                    }
                    Frame::Pong { .. } => {}
                }
            }
            _ = heartbeat.tick() => {
                seq += 1;
                if outgoing.send(Frame::Ping { seq }).await.is_err() {
                    return DisconnectReason::LinkClosed;
                }
            }
            () = &mut expiry => return DisconnectReason::HeartbeatExpired,
        }
    }
}

//! The surface the UI layer talks to.
//!
//! A [`SyncSession`] wires one [`Connector`] to one [`Reconciler`]: every
//! inbound entity event is routed into `apply_remote`, optimistic edits go out
//! as acked `{kind}:update` events, and reads are served from the cache with
//! an optional read-through to the HTTP layer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use taskflow_core::api::{fetch_entity, HttpClient, Method, RequestError, RequestOptions};
use taskflow_core::cancel::{Cancelled, RequestScope};
use taskflow_core::entity::{EditId, Entity, EntityId, EntityKey, EntityKind, Patch};
use taskflow_core::reconcile::{ConflictNotice, EditError, Reconciler, RemoteChange};
use taskflow_core::store::{EntityStore, StoreChange, StoreConfig};

use crate::connector::{ChannelState, Connector, EmitError, EmitOptions};
use crate::debounce::Debouncer;
use crate::protocol::{ack_entity, edit_payload, inbound_events, remote_change, update_event};
use crate::router::Subscription;
use crate::transport::TransportError;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub store: StoreConfig,
    /// Ack timeout and retries for outbound edits
    pub edit_options: EmitOptions,
    /// Debounce window for search requests
    pub search_window: Duration,
    /// Age after which an unresolved edit is rolled back
    pub edit_max_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            edit_options: EmitOptions::default(),
            search_window: Duration::from_millis(300),
            edit_max_age: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    #[error("no HTTP client configured")]
    NoHttpClient,
}

pub struct SyncSession {
    connector: Connector,
    reconciler: Arc<Mutex<Reconciler>>,
    routes: Mutex<Vec<Subscription>>,
    http: Option<Arc<dyn HttpClient>>,
    search: Debouncer,
    config: SessionConfig,
}

fn lock(reconciler: &Mutex<Reconciler>) -> MutexGuard<'_, Reconciler> {
    reconciler.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rolls an edit back if its caller stops waiting before it settles.
/// Dropping it after the edit resolved does nothing.
struct AbandonOnDrop {
    reconciler: Arc<Mutex<Reconciler>>,
    edit_id: EditId,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        lock(&self.reconciler).abandon(self.edit_id, EditError::Abandoned);
    }
}

impl SyncSession {
    pub fn new(connector: Connector, config: SessionConfig) -> Self {
        let store = EntityStore::new(config.store.clone());
        Self {
            connector,
            reconciler: Arc::new(Mutex::new(Reconciler::new(store))),
            routes: Mutex::new(Vec::new()),
            http: None,
            search: Debouncer::new(config.search_window),
            config,
        }
    }

    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn state(&self) -> ChannelState {
        self.connector.state()
    }

    fn reconciler(&self) -> MutexGuard<'_, Reconciler> {
        lock(&self.reconciler)
    }

    /// Route every entity event into the reconciler and open the channel.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.attach_routes();
        self.connector.connect().await?;
        Ok(())
    }

    fn attach_routes(&self) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes.clear();
        for kind in EntityKind::ALL {
            for &event in inbound_events(kind) {
                let reconciler = self.reconciler.clone();
                routes.push(self.connector.on(event, move |payload: &Value| {
                    match remote_change(event, payload) {
                        Ok(change) => {
                            let resolution = lock(&reconciler).apply_remote(change);
                            log::trace!("{event}: {resolution:?}");
                        }
                        Err(e) => log::warn!("dropping inbound event: {e}"),
                    }
                }));
            }
        }
    }

    /// Close the channel. Unacked edits roll back as undelivered.
    pub fn stop(&self) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.connector.disconnect();
    }

    /// Apply `patch` optimistically and push it to the server.
    ///
    /// Resolves with the confirmed entity, or with the reason the edit was
    /// rolled back. Dropping the future first rolls the edit back.
    pub async fn edit(
        &self,
        kind: EntityKind,
        id: impl Into<EntityId>,
        patch: Patch,
    ) -> Result<Entity, SyncError> {
        let (ticket, payload) = {
            let mut reconciler = self.reconciler();
            let ticket = reconciler.begin_edit(kind, id, patch.clone())?;
            let payload = edit_payload(ticket.key(), ticket.edit_id(), &patch);
            (ticket, payload)
        };
        let edit_id = ticket.edit_id();
        let _guard = AbandonOnDrop {
            reconciler: self.reconciler.clone(),
            edit_id,
        };

        let sent = self
            .connector
            .emit(&update_event(kind), payload, self.config.edit_options)
            .await;
        {
            // A no-op when the server echo already settled the edit
            let mut reconciler = self.reconciler();
            match sent {
                Ok(ack) => {
                    reconciler.confirm(edit_id, ack_entity(kind, &ack));
                }
                Err(EmitError::Rejected(error)) => {
                    reconciler.reject(edit_id, error);
                }
                Err(other) => {
                    reconciler.abandon(edit_id, EditError::Undelivered(other.to_string()));
                }
            }
        }

        Ok(ticket.settled().await?)
    }

    pub async fn mark_as_read(&self, id: impl Into<EntityId>) -> Result<Entity, SyncError> {
        self.edit(EntityKind::Notification, id, Patch::new().set("read", true))
            .await
    }

    /// Mark every cached unread notification as read, concurrently.
    pub async fn mark_all_read(&self) -> Vec<Result<Entity, SyncError>> {
        let unread = self.list(EntityKind::Notification, Entity::is_unread);
        join_all(unread.into_iter().map(|n| self.mark_as_read(n.id))).await
    }

    pub fn get(&self, kind: EntityKind, id: impl Into<EntityId>) -> Option<Entity> {
        let key = EntityKey::new(kind, id);
        self.reconciler().store_mut().get(&key).cloned()
    }

    pub fn list<P>(&self, kind: EntityKind, predicate: P) -> Vec<Entity>
    where
        P: Fn(&Entity) -> bool,
    {
        self.reconciler()
            .store_mut()
            .list(|entity| entity.kind == kind && predicate(entity))
    }

    pub fn unread_count(&self) -> usize {
        self.reconciler().store_mut().unread_count()
    }

    pub fn pending_count(&self) -> usize {
        self.reconciler().pending_count()
    }

    pub fn pending_for(&self, kind: EntityKind, id: impl Into<EntityId>) -> Option<EditId> {
        self.reconciler().pending_for(&EntityKey::new(kind, id))
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictNotice> {
        self.reconciler().subscribe_conflicts()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.reconciler().store().subscribe()
    }

    /// Roll back edits that have waited longer than `edit_max_age`.
    pub fn expire_stale_edits(&self) -> Vec<EditId> {
        self.reconciler().expire_pending(self.config.edit_max_age)
    }

    fn http(&self) -> Result<&dyn HttpClient, SyncError> {
        self.http.as_deref().ok_or(SyncError::NoHttpClient)
    }

    /// Read-through: the cached entity if fresh, otherwise
    /// `GET /{collection}/{id}`. A response arriving after `scope` was torn
    /// down is dropped.
    pub async fn fetch(
        &self,
        scope: &RequestScope,
        kind: EntityKind,
        id: impl Into<EntityId>,
    ) -> Result<Entity, SyncError> {
        let key = EntityKey::new(kind, id);
        let cached = self.reconciler().store_mut().get(&key).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let entity = scope.run(fetch_entity(self.http()?, &key)).await??;
        self.adopt(entity.clone());
        Ok(entity)
    }

    /// Debounced `GET /{collection}?q=...`. Superseded searches resolve to
    /// `Err(SyncError::Cancelled)`.
    pub async fn search(&self, kind: EntityKind, query: &str) -> Result<Vec<Entity>, SyncError> {
        let http = self.http()?;
        let path = format!("/{}", kind.collection());
        let options = RequestOptions::default().with_query("q", query);
        let response = self
            .search
            .run(|| http.request(Method::Get, &path, None, options))
            .await??;

        let body = response.into_result()?;
        let items = body
            .get("data")
            .unwrap_or(&body)
            .as_array()
            .cloned()
            .unwrap_or_default();
        let found: Vec<Entity> = items
            .iter()
            .filter_map(|item| Entity::from_payload(kind, item).ok())
            .collect();
        for entity in &found {
            self.adopt(entity.clone());
        }
        Ok(found)
    }

    /// Cache a fetched value unless an edit on it is still unresolved.
    fn adopt(&self, entity: Entity) {
        let mut reconciler = self.reconciler();
        if reconciler.pending_for(&entity.key()).is_some() {
            log::debug!("not caching fetched {}: edit pending", entity.key());
            return;
        }
        reconciler.apply_remote(RemoteChange::upsert(entity));
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.search.cancel();
    }
}

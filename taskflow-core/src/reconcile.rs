//! Merging authoritative server changes with optimistic local edits.
//!
//! Each entity moves through `clean → pending → {confirmed | rolled_back}`:
//!
//! ```text
//!             begin_edit()                 echo / confirm()
//!   clean ───────────────────► pending ─────────────────────► clean (confirmed)
//!                                 │
//!                                 │ unrelated update / reject() / expire
//!                                 ▼
//!                            clean (rolled back, caller told why)
//! ```
//!
//! The server always wins. The pending-edit ledger lives here; the store only
//! sees pins, so the read-through cache and the edit staging area stay
//! separate concerns.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

use crate::api::ApiError;
use crate::entity::{EditId, Entity, EntityId, EntityKey, EntityKind, Patch};
use crate::store::EntityStore;

/// An authoritative change pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Upsert {
        entity: Entity,
        origin: Option<EditId>,
    },
    Delete {
        key: EntityKey,
        origin: Option<EditId>,
    },
}

impl RemoteChange {
    pub fn upsert(entity: Entity) -> Self {
        RemoteChange::Upsert { entity, origin: None }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            RemoteChange::Upsert { entity, .. } => entity.key(),
            RemoteChange::Delete { key, .. } => key.clone(),
        }
    }
}

/// What `apply_remote` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No edit was pending; the server value was adopted.
    Applied,
    /// The change was the echo of a pending edit.
    Confirmed(EditId),
    /// The change conflicted with a pending edit, which was rolled back.
    RolledBack(EditId),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    #[error("{0} already has an unresolved edit")]
    EditInFlight(EntityKey),
    #[error("edit {edit_id} on {key} lost to a concurrent server change")]
    Conflict {
        edit_id: EditId,
        key: EntityKey,
        attempted: Patch,
        /// Server value now in the cache (None if the entity was deleted)
        server: Option<Entity>,
    },
    #[error("edit rejected by server: {0}")]
    Rejected(ApiError),
    #[error("edit {0} was not confirmed in time")]
    TimedOut(EditId),
    #[error("edit could not be delivered: {0}")]
    Undelivered(String),
    #[error("edit was abandoned before it resolved")]
    Abandoned,
}

/// Broadcast to UI subscribers whenever an edit is rolled back by a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictNotice {
    pub edit_id: EditId,
    pub key: EntityKey,
    pub attempted: Patch,
    pub server: Option<Entity>,
}

type Outcome = Result<Entity, EditError>;

#[derive(Debug)]
struct PendingEdit {
    edit_id: EditId,
    patch: Patch,
    previous: Option<Entity>,
    issued_at: Instant,
    notify: oneshot::Sender<Outcome>,
}

/// Handle returned to the caller of an optimistic edit.
#[derive(Debug)]
pub struct EditTicket {
    edit_id: EditId,
    key: EntityKey,
    outcome: oneshot::Receiver<Outcome>,
}

impl EditTicket {
    pub fn edit_id(&self) -> EditId {
        self.edit_id
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Non-blocking check; `None` while the edit is still pending.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(EditError::Abandoned)),
        }
    }

    /// Wait for confirmation or rollback.
    pub async fn settled(self) -> Outcome {
        self.outcome.await.unwrap_or(Err(EditError::Abandoned))
    }
}

pub struct Reconciler {
    store: EntityStore,
    ledger: HashMap<EntityKey, PendingEdit>,
    conflicts: broadcast::Sender<ConflictNotice>,
}

impl Reconciler {
    pub fn new(store: EntityStore) -> Self {
        let (conflicts, _) = broadcast::channel(64);
        Self {
            store,
            ledger: HashMap::new(),
            conflicts,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Reads that drop expired entries need `&mut`; writes should go through
    /// the reconciler so pins stay consistent.
    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictNotice> {
        self.conflicts.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.ledger.len()
    }

    pub fn pending_for(&self, key: &EntityKey) -> Option<EditId> {
        self.ledger.get(key).map(|p| p.edit_id)
    }

    /// Apply `patch` optimistically and start tracking it.
    pub fn begin_edit(
        &mut self,
        kind: EntityKind,
        id: impl Into<EntityId>,
        patch: Patch,
    ) -> Result<EditTicket, EditError> {
        let key = EntityKey::new(kind, id);
        if self.ledger.contains_key(&key) {
            return Err(EditError::EditInFlight(key));
        }

        let previous = self.store.get(&key).cloned();
        let mut proposed = previous
            .clone()
            .unwrap_or_else(|| Entity::new(kind, key.id.clone()));
        proposed.apply_patch(&patch);

        self.store.pin(&key);
        self.store.set(proposed);

        let edit_id = EditId::new();
        let (notify, outcome) = oneshot::channel();
        log::debug!("edit {edit_id} pending on {key}");
        self.ledger.insert(
            key.clone(),
            PendingEdit {
                edit_id,
                patch,
                previous,
                issued_at: Instant::now(),
                notify,
            },
        );

        Ok(EditTicket {
            edit_id,
            key,
            outcome,
        })
    }

    /// Merge one server change. Changes are applied in call order.
    pub fn apply_remote(&mut self, change: RemoteChange) -> Resolution {
        let key = change.key();
        let Some(pending) = self.ledger.remove(&key) else {
            match change {
                RemoteChange::Upsert { entity, .. } => {
                    self.store.set(entity);
                }
                RemoteChange::Delete { key, .. } => {
                    self.store.remove(&key);
                }
            }
            return Resolution::Applied;
        };

        match change {
            RemoteChange::Upsert { entity, origin } if is_echo(&pending, &entity, origin) => {
                let edit_id = pending.edit_id;
                self.finish(&key, pending, Some(entity));
                log::debug!("edit {edit_id} confirmed by server echo");
                Resolution::Confirmed(edit_id)
            }
            RemoteChange::Upsert { entity, .. } => {
                let edit_id = pending.edit_id;
                self.conflict(key, pending, Some(entity));
                Resolution::RolledBack(edit_id)
            }
            RemoteChange::Delete { .. } => {
                let edit_id = pending.edit_id;
                self.conflict(key, pending, None);
                Resolution::RolledBack(edit_id)
            }
        }
    }

    /// Confirm an edit from its ack. `server` is the value the ack carried;
    /// without one the optimistic value stands. Returns false if the edit had
    /// already resolved.
    pub fn confirm(&mut self, edit_id: EditId, server: Option<Entity>) -> bool {
        let Some((key, pending)) = self.take_by_id(edit_id) else {
            return false;
        };
        let adopted = match server {
            Some(entity) => Some(entity),
            None => self.store.get(&key).cloned(),
        };
        self.finish(&key, pending, adopted);
        true
    }

    /// Roll back an edit the server refused.
    pub fn reject(&mut self, edit_id: EditId, error: ApiError) -> bool {
        self.abandon(edit_id, EditError::Rejected(error))
    }

    /// Roll back an edit for any non-conflict reason.
    pub fn abandon(&mut self, edit_id: EditId, reason: EditError) -> bool {
        let Some((key, pending)) = self.take_by_id(edit_id) else {
            return false;
        };
        log::warn!("rolling back edit {edit_id} on {key}: {reason}");
        let PendingEdit { previous, notify, .. } = pending;
        self.restore(&key, previous);
        let _ = notify.send(Err(reason));
        true
    }

    /// Roll back every edit older than `max_age`.
    pub fn expire_pending(&mut self, max_age: Duration) -> Vec<EditId> {
        let now = Instant::now();
        let stale: Vec<EditId> = self
            .ledger
            .values()
            .filter(|p| now.duration_since(p.issued_at) >= max_age)
            .map(|p| p.edit_id)
            .collect();
        for edit_id in &stale {
            self.abandon(*edit_id, EditError::TimedOut(*edit_id));
        }
        stale
    }

    fn take_by_id(&mut self, edit_id: EditId) -> Option<(EntityKey, PendingEdit)> {
        let key = self
            .ledger
            .iter()
            .find(|(_, p)| p.edit_id == edit_id)
            .map(|(k, _)| k.clone())?;
        self.ledger.remove(&key).map(|p| (key, p))
    }

    fn finish(&mut self, key: &EntityKey, pending: PendingEdit, adopted: Option<Entity>) {
        if let Some(entity) = &adopted {
            self.store.set(entity.clone());
        }
        self.store.unpin(key);
        let outcome = adopted.ok_or(EditError::Abandoned);
        let _ = pending.notify.send(outcome);
    }

    fn conflict(&mut self, key: EntityKey, pending: PendingEdit, server: Option<Entity>) {
        let PendingEdit {
            edit_id,
            patch,
            previous,
            notify,
            ..
        } = pending;
        log::warn!("edit {edit_id} on {key} conflicts with a server change; rolling back");

        self.restore(&key, previous);
        match &server {
            Some(entity) => {
                self.store.set(entity.clone());
            }
            None => {
                self.store.remove(&key);
            }
        }

        let notice = ConflictNotice {
            edit_id,
            key: key.clone(),
            attempted: patch.clone(),
            server: server.clone(),
        };
        let _ = self.conflicts.send(notice);
        let _ = notify.send(Err(EditError::Conflict {
            edit_id,
            key,
            attempted: patch,
            server,
        }));
    }

    fn restore(&mut self, key: &EntityKey, previous: Option<Entity>) {
        match previous {
            Some(entity) => {
                self.store.set(entity);
            }
            None => {
                self.store.remove(key);
            }
        }
        self.store.unpin(key);
    }
}

fn is_echo(pending: &PendingEdit, entity: &Entity, origin: Option<EditId>) -> bool {
    match origin {
        Some(origin) => origin == pending.edit_id,
        // Untagged events count as the echo only if they carry our values.
        // An empty patch is reflected everywhere, so it needs the tag.
        None => !pending.patch.is_empty() && pending.patch.is_reflected_in(entity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use serde_json::json;

    fn reconciler() -> Reconciler {
        Reconciler::new(EntityStore::new(StoreConfig::default()))
    }

    fn notification(id: &str, read: bool) -> Entity {
        Entity::new(EntityKind::Notification, id).with_field("read", read)
    }

    fn task(id: &str, status: &str) -> Entity {
        Entity::new(EntityKind::Task, id).with_field("status", status)
    }

    #[test]
    fn test_remote_updates_apply_in_arrival_order() {
        let mut rec = reconciler();
        let first = task("t1", "todo").with_version(2);
        let second = task("t1", "doing").with_version(1);

        assert_eq!(rec.apply_remote(RemoteChange::upsert(first)), Resolution::Applied);
        assert_eq!(rec.apply_remote(RemoteChange::upsert(second.clone())), Resolution::Applied);

        // Arrival order wins, even over a lower version marker.
        assert_eq!(rec.store_mut().get(&EntityKey::task("t1")), Some(&second));
    }

    #[test]
    fn test_optimistic_edit_is_visible_immediately() {
        let mut rec = reconciler();
        rec.apply_remote(RemoteChange::upsert(notification("n1", false)));
        assert_eq!(rec.store_mut().unread_count(), 1);

        let ticket = rec
            .begin_edit(EntityKind::Notification, "n1", Patch::new().set("read", true))
            .unwrap();

        assert_eq!(rec.store_mut().unread_count(), 0);
        assert_eq!(rec.pending_for(ticket.key()), Some(ticket.edit_id()));
        assert!(rec.store().is_pinned(ticket.key()));
    }

    #[test]
    fn test_second_edit_waits_for_first() {
        let mut rec = reconciler();
        rec.begin_edit(EntityKind::Task, "t1", Patch::new().set("status", "doing"))
            .unwrap();
        let err = rec
            .begin_edit(EntityKind::Task, "t1", Patch::new().set("status", "done"))
            .unwrap_err();
        assert_eq!(err, EditError::EditInFlight(EntityKey::task("t1")));
    }

    #[tokio::test]
    async fn test_echo_with_origin_confirms() {
        let mut rec = reconciler();
        rec.apply_remote(RemoteChange::upsert(task("t1", "todo")));
        let ticket = rec
            .begin_edit(EntityKind::Task, "t1", Patch::new().set("status", "doing"))
            .unwrap();

        // Server adjusts fields and bumps the version.
        let echoed = task("t1", "doing")
            .with_field("updatedAt", "2024-05-01T10:00:00Z")
            .with_version(7);
        let resolution = rec.apply_remote(RemoteChange::Upsert {
            entity: echoed.clone(),
            origin: Some(ticket.edit_id()),
        });

        assert_eq!(resolution, Resolution::Confirmed(ticket.edit_id()));
        assert_eq!(rec.pending_count(), 0);
        assert!(!rec.store().is_pinned(&EntityKey::task("t1")));
        assert_eq!(rec.store_mut().get(&EntityKey::task("t1")), Some(&echoed));
        assert_eq!(ticket.settled().await, Ok(echoed));
    }

    #[tokio::test]
    async fn test_untagged_matching_echo_confirms() {
        let mut rec = reconciler();
        rec.apply_remote(RemoteChange::upsert(notification("n1", false)));
        let ticket = rec
            .begin_edit(EntityKind::Notification, "n1", Patch::new().set("read", true))
            .unwrap();

        let resolution = rec.apply_remote(RemoteChange::upsert(notification("n1", true)));

        assert_eq!(resolution, Resolution::Confirmed(ticket.edit_id()));
        assert_eq!(rec.pending_count(), 0);
        assert!(ticket.settled().await.is_ok());
    }

    #[tokio::test]
    async fn test_untagged_update_does_not_confirm_empty_patch() {
        let mut rec = reconciler();
        rec.apply_remote(RemoteChange::upsert(task("t1", "todo")));
        let ticket = rec.begin_edit(EntityKind::Task, "t1", Patch::new()).unwrap();
        let edit_id = ticket.edit_id();

        let resolution = rec.apply_remote(RemoteChange::upsert(task("t1", "doing")));

        assert_eq!(resolution, Resolution::RolledBack(edit_id));
        assert!(matches!(ticket.settled().await, Err(EditError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_unrelated_update_rolls_back_and_reports_conflict() {
        let mut rec = reconciler();
        let mut conflicts = rec.subscribe_conflicts();
        rec.apply_remote(RemoteChange::upsert(task("t1", "todo")));
        let ticket = rec
            .begin_edit(EntityKind::Task, "t1", Patch::new().set("status", "doing"))
            .unwrap();
        let edit_id = ticket.edit_id();

        let concurrent = task("t1", "blocked").with_field("assignee", "sam");
        let resolution = rec.apply_remote(RemoteChange::upsert(concurrent.clone()));

        assert_eq!(resolution, Resolution::RolledBack(edit_id));
        assert_eq!(rec.pending_count(), 0);
        assert_eq!(rec.store_mut().get(&EntityKey::task("t1")), Some(&concurrent));

        match ticket.settled().await {
            Err(EditError::Conflict { edit_id: id, server, attempted, .. }) => {
                assert_eq!(id, edit_id);
                assert_eq!(server, Some(concurrent));
                assert_eq!(attempted, Patch::new().set("status", "doing"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(conflicts.try_recv().unwrap().edit_id, edit_id);
    }

    #[tokio::test]
    async fn test_foreign_origin_is_a_conflict_even_if_values_match() {
        let mut rec = reconciler();
        let ticket = rec
            .begin_edit(EntityKind::Task, "t1", Patch::new().set("status", "done"))
            .unwrap();
        let resolution = rec.apply_remote(RemoteChange::Upsert {
            entity: task("t1", "done"),
            origin: Some(EditId::new()),
        });
        assert_eq!(resolution, Resolution::RolledBack(ticket.edit_id()));
    }

    #[tokio::test]
    async fn test_remote_delete_during_edit() {
        let mut rec = reconciler();
        rec.apply_remote(RemoteChange::upsert(task("t1", "todo")));
        let ticket = rec
            .begin_edit(EntityKind::Task, "t1", Patch::new().set("status", "doing"))
            .unwrap();

        rec.apply_remote(RemoteChange::Delete {
            key: EntityKey::task("t1"),
            origin: None,
        });

        assert!(rec.store_mut().get(&EntityKey::task("t1")).is_none());
        assert!(matches!(
            ticket.settled().await,
            Err(EditError::Conflict { server: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_reject_restores_snapshot() {
        let mut rec = reconciler();
        rec.apply_remote(RemoteChange::upsert(notification("n1", false)));
        let ticket = rec
            .begin_edit(EntityKind::Notification, "n1", Patch::new().set("read", true))
            .unwrap();
        let edit_id = ticket.edit_id();

        assert!(rec.reject(edit_id, ApiError::new("forbidden", "not yours")));
        assert!(!rec.reject(edit_id, ApiError::new("forbidden", "again")));

        assert_eq!(rec.store_mut().unread_count(), 1);
        assert_eq!(
            ticket.settled().await,
            Err(EditError::Rejected(ApiError::new("forbidden", "not yours")))
        );
    }

    #[tokio::test]
    async fn test_rollback_of_edit_on_unknown_entity_removes_it() {
        let mut rec = reconciler();
        let ticket = rec
            .begin_edit(EntityKind::Task, "draft", Patch::new().set("title", "new"))
            .unwrap();
        assert!(rec.store().contains(&EntityKey::task("draft")));

        rec.abandon(ticket.edit_id(), EditError::Undelivered("offline".into()));
        assert!(!rec.store().contains(&EntityKey::task("draft")));
    }

    #[tokio::test]
    async fn test_confirm_from_ack() {
        let mut rec = reconciler();
        let mut ticket = rec
            .begin_edit(EntityKind::Project, "p1", Patch::new().set("name", "Roadmap"))
            .unwrap();
        assert!(ticket.try_outcome().is_none());

        let server = Entity::from_payload(
            EntityKind::Project,
            &json!({"id": "p1", "name": "Roadmap", "version": 3}),
        )
        .unwrap();
        assert!(rec.confirm(ticket.edit_id(), Some(server.clone())));
        assert!(!rec.confirm(ticket.edit_id(), None));

        assert_eq!(ticket.try_outcome(), Some(Ok(server)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_pending() {
        let mut rec = reconciler();
        let old = rec
            .begin_edit(EntityKind::Task, "t1", Patch::new().set("status", "doing"))
            .unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        let fresh = rec
            .begin_edit(EntityKind::Task, "t2", Patch::new().set("status", "doing"))
            .unwrap();

        let expired = rec.expire_pending(Duration::from_secs(15));

        assert_eq!(expired, vec![old.edit_id()]);
        assert_eq!(rec.pending_for(fresh.key()), Some(fresh.edit_id()));
        assert_eq!(old.settled().await, Err(EditError::TimedOut(expired[0])));
    }

    #[test]
    fn test_dropped_reconciler_abandons_tickets() {
        let mut rec = reconciler();
        let mut ticket = rec
            .begin_edit(EntityKind::Task, "t1", Patch::new().set("status", "doing"))
            .unwrap();
        drop(rec);
        assert_eq!(ticket.try_outcome(), Some(Err(EditError::Abandoned)));
    }
}

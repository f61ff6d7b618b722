//! In-memory entity cache with incrementally maintained aggregates.
//!
//! ```text
//!   set / remove ──► slots (EntityKey → Slot)
//!        │              │
//!        │              ├── order   (write seq → key)       FIFO eviction
//!        │              └── expiry  (deadline, seq → key)   TTL sweep
//!        ▼
//!   aggregates: unread notifications, per-kind counts
//!        │
//!        ▼
//!   broadcast<StoreChange> ──► UI subscribers
//! ```
//!
//! Aggregates are adjusted on every mutation and never recomputed on read.
//! Entries pinned by an unresolved optimistic edit are never evicted or
//! expired.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::entity::{Entity, EntityKey, EntityKind};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum resident entries before the oldest writes are evicted
    pub capacity: usize,
    /// TTL applied by `set` (None = entries never expire)
    pub default_ttl: Option<Duration>,
    /// Buffered change notifications per subscriber
    pub change_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 5_000,
            default_ttl: None,
            change_buffer: 256,
        }
    }
}

/// Change notification for UI subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Upserted(EntityKey),
    Removed(EntityKey),
    Evicted(EntityKey),
    Expired(EntityKey),
}

#[derive(Debug)]
struct Slot {
    entity: Entity,
    seq: u64,
    expires_at: Option<Instant>,
}

pub struct EntityStore {
    config: StoreConfig,
    slots: HashMap<EntityKey, Slot>,
    /// Last-write order, oldest first
    order: BTreeMap<u64, EntityKey>,
    expiry: BTreeMap<(Instant, u64), EntityKey>,
    next_seq: u64,
    pinned: HashSet<EntityKey>,
    unread: usize,
    per_kind: [usize; 3],
    changes: broadcast::Sender<StoreChange>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl EntityStore {
    pub fn new(config: StoreConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_buffer.max(1));
        Self {
            config,
            slots: HashMap::new(),
            order: BTreeMap::new(),
            expiry: BTreeMap::new(),
            next_seq: 0,
            pinned: HashSet::new(),
            unread: 0,
            per_kind: [0; 3],
            changes,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Look up an entry. Expired entries are dropped and reported absent.
    pub fn get(&mut self, key: &EntityKey) -> Option<&Entity> {
        if self.is_expired(key, Instant::now()) {
            self.drop_slot(key, StoreChange::Expired(key.clone()));
            return None;
        }
        self.slots.get(key).map(|slot| &slot.entity)
    }

    /// Whether `key` is resident and unexpired. Callers use this to decide
    /// whether a refetch is needed before trusting the value.
    pub fn is_fresh(&self, key: &EntityKey) -> bool {
        self.slots.contains_key(key) && !self.is_expired(key, Instant::now())
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Replace the full value for the entity's key, applying the default TTL.
    /// Returns the previous value.
    pub fn set(&mut self, entity: Entity) -> Option<Entity> {
        let ttl = self.config.default_ttl;
        self.set_with_ttl(entity, ttl)
    }

    pub fn set_with_ttl(&mut self, entity: Entity, ttl: Option<Duration>) -> Option<Entity> {
        let key = entity.key();
        let previous = self.take_slot(&key).map(|slot| slot.entity);
        let changed = previous.as_ref() != Some(&entity);

        let seq = self.next_seq;
        self.next_seq += 1;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);

        self.track(&entity);
        self.order.insert(seq, key.clone());
        if let Some(deadline) = expires_at {
            self.expiry.insert((deadline, seq), key.clone());
        }
        self.slots.insert(
            key.clone(),
            Slot {
                entity,
                seq,
                expires_at,
            },
        );

        if changed {
            self.notify(StoreChange::Upserted(key));
        }
        self.evict_overflow();
        previous
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<Entity> {
        let slot = self.take_slot(key)?;
        self.notify(StoreChange::Removed(key.clone()));
        Some(slot.entity)
    }

    /// Snapshot of unexpired entries matching `predicate`, oldest write first.
    pub fn list<P>(&mut self, predicate: P) -> Vec<Entity>
    where
        P: Fn(&Entity) -> bool,
    {
        self.purge_expired();
        self.order
            .values()
            .filter_map(|key| self.slots.get(key))
            .map(|slot| &slot.entity)
            .filter(|entity| predicate(entity))
            .cloned()
            .collect()
    }

    /// Drop every expired, unpinned entry. Returns how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let due: Vec<EntityKey> = self
            .expiry
            .range(..(now, u64::MAX))
            .map(|(_, key)| key.clone())
            .filter(|key| !self.pinned.contains(key))
            .collect();
        for key in &due {
            self.drop_slot(key, StoreChange::Expired(key.clone()));
        }
        due.len()
    }

    /// Protect `key` from eviction and expiry while an edit is pending.
    pub fn pin(&mut self, key: &EntityKey) {
        self.pinned.insert(key.clone());
    }

    pub fn unpin(&mut self, key: &EntityKey) {
        self.pinned.remove(key);
        self.evict_overflow();
    }

    pub fn is_pinned(&self, key: &EntityKey) -> bool {
        self.pinned.contains(key)
    }

    /// Unread notifications among unexpired entries.
    pub fn unread_count(&mut self) -> usize {
        self.purge_expired();
        self.unread
    }

    /// Unexpired entries of `kind`.
    pub fn count(&mut self, kind: EntityKind) -> usize {
        self.purge_expired();
        self.per_kind[kind.index()]
    }

    /// Recompute the unread aggregate from scratch over resident entries.
    pub fn recount_unread(&self) -> usize {
        self.slots.values().filter(|slot| slot.entity.is_unread()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn is_expired(&self, key: &EntityKey, now: Instant) -> bool {
        if self.pinned.contains(key) {
            return false;
        }
        self.slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|deadline| deadline <= now)
    }

    fn take_slot(&mut self, key: &EntityKey) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.seq);
        if let Some(deadline) = slot.expires_at {
            self.expiry.remove(&(deadline, slot.seq));
        }
        self.untrack(&slot.entity);
        Some(slot)
    }

    fn drop_slot(&mut self, key: &EntityKey, change: StoreChange) {
        if self.take_slot(key).is_some() {
            self.notify(change);
        }
    }

    fn evict_overflow(&mut self) {
        while self.slots.len() > self.config.capacity {
            let victim = self
                .order
                .values()
                .find(|key| !self.pinned.contains(*key))
                .cloned();
            match victim {
                Some(key) => {
                    log::debug!("evicting {key} (capacity {})", self.config.capacity);
                    self.drop_slot(&key, StoreChange::Evicted(key.clone()));
                }
                None => {
                    log::warn!(
                        "store over capacity ({} > {}) but every entry is pinned",
                        self.slots.len(),
                        self.config.capacity
                    );
                    break;
                }
            }
        }
    }

    fn track(&mut self, entity: &Entity) {
        self.per_kind[entity.kind.index()] += 1;
        if entity.is_unread() {
            self.unread += 1;
        }
    }

    fn untrack(&mut self, entity: &Entity) {
        let count = &mut self.per_kind[entity.kind.index()];
        debug_assert!(*count > 0, "per-kind count underflow");
        *count = count.saturating_sub(1);
        if entity.is_unread() {
            debug_assert!(self.unread > 0, "unread count underflow");
            self.unread = self.unread.saturating_sub(1);
        }
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    fn notification(id: &str, read: bool) -> Entity {
        Entity::new(EntityKind::Notification, id).with_field("read", read)
    }

    fn task(id: &str) -> Entity {
        Entity::new(EntityKind::Task, id).with_field("title", format!("task {id}"))
    }

    #[test]
    fn test_set_get_remove() {
        let mut store = EntityStore::default();
        assert!(store.set(task("t1")).is_none());

        assert_eq!(store.get(&EntityKey::task("t1")), Some(&task("t1")));
        assert_eq!(store.count(EntityKind::Task), 1);

        assert_eq!(store.remove(&EntityKey::task("t1")), Some(task("t1")));
        assert!(store.get(&EntityKey::task("t1")).is_none());
        assert_eq!(store.count(EntityKind::Task), 0);
        assert!(store.remove(&EntityKey::task("t1")).is_none());
    }

    #[test]
    fn test_same_id_different_kind_do_not_collide() {
        let mut store = EntityStore::default();
        store.set(task("x"));
        store.set(notification("x", false));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_set_is_idempotent_for_aggregates() {
        let mut store = EntityStore::default();
        let mut rx = store.subscribe();

        store.set(notification("n1", false));
        store.set(notification("n1", false));

        assert_eq!(store.unread_count(), 1);
        assert_eq!(rx.try_recv().unwrap(), StoreChange::Upserted(EntityKey::notification("n1")));
        assert!(rx.try_recv().is_err(), "identical set must not notify");
    }

    #[test]
    fn test_unread_tracks_transitions() {
        let mut store = EntityStore::default();
        store.set(notification("n1", false));
        store.set(notification("n2", false));
        store.set(notification("n3", true));
        assert_eq!(store.unread_count(), 2);

        store.set(notification("n1", true));
        assert_eq!(store.unread_count(), 1);

        store.set(notification("n3", false));
        assert_eq!(store.unread_count(), 2);

        store.remove(&EntityKey::notification("n2"));
        store.remove(&EntityKey::notification("n3"));
        store.remove(&EntityKey::notification("n3"));
        assert_eq!(store.unread_count(), 0);
    }

    #[test]
    fn test_incremental_unread_matches_recount() {
        // Deterministic pseudo-random op sequence (xorshift).
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut store = EntityStore::new(StoreConfig {
            capacity: 12,
            ..StoreConfig::default()
        });
        for _ in 0..2_000 {
            let r = next();
            let id = format!("n{}", r % 20);
            match r % 5 {
                0 => {
                    store.remove(&EntityKey::notification(id));
                }
                1 => {
                    store.set(task(&id));
                }
                _ => {
                    store.set(notification(&id, r % 3 == 0));
                }
            }
            assert_eq!(store.unread_count(), store.recount_unread());
            assert!(store.len() <= 12);
        }
    }

    #[test]
    fn test_capacity_evicts_oldest_write() {
        let mut store = EntityStore::new(StoreConfig {
            capacity: 3,
            ..StoreConfig::default()
        });
        store.set(task("a"));
        store.set(task("b"));
        store.set(task("c"));
        // Rewriting "a" makes it the newest.
        store.set(task("a"));
        store.set(task("d"));

        assert!(!store.contains(&EntityKey::task("b")));
        assert!(store.contains(&EntityKey::task("a")));
        assert!(store.contains(&EntityKey::task("c")));
        assert!(store.contains(&EntityKey::task("d")));
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let mut store = EntityStore::new(StoreConfig {
            capacity: 2,
            ..StoreConfig::default()
        });
        store.set(task("a"));
        store.pin(&EntityKey::task("a"));
        store.set(task("b"));
        store.set(task("c"));

        assert!(store.contains(&EntityKey::task("a")));
        assert!(!store.contains(&EntityKey::task("b")));

        // All pinned: the store overflows instead of dropping a pending entry.
        store.pin(&EntityKey::task("c"));
        store.pin(&EntityKey::task("d"));
        store.set(task("d"));
        assert_eq!(store.len(), 3);

        store.unpin(&EntityKey::task("a"));
        assert!(!store.contains(&EntityKey::task("a")));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_skip_expired_entries() {
        let mut store = EntityStore::new(StoreConfig {
            default_ttl: Some(Duration::from_secs(10)),
            ..StoreConfig::default()
        });
        store.set(task("t1"));
        store.set_with_ttl(task("t2"), None);
        assert_eq!(store.count(EntityKind::Task), 2);

        tokio::time::advance(Duration::from_secs(11)).await;

        // No read touched t1 since it expired
        assert_eq!(store.count(EntityKind::Task), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_absent() {
        let mut store = EntityStore::new(StoreConfig {
            default_ttl: Some(Duration::from_secs(30)),
            ..StoreConfig::default()
        });
        let mut rx = store.subscribe();
        store.set(notification("n1", false));
        store.set_with_ttl(notification("n2", false), None);
        assert_eq!(store.unread_count(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(!store.is_fresh(&EntityKey::notification("n1")));
        assert!(store.get(&EntityKey::notification("n1")).is_none());
        assert!(store.get(&EntityKey::notification("n2")).is_some());
        assert_eq!(store.unread_count(), 1);
        assert_eq!(store.recount_unread(), 1);
        assert_eq!(store.count(EntityKind::Notification), 1);

        let changes: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(changes.contains(&StoreChange::Expired(EntityKey::notification("n1"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_entries_do_not_expire() {
        let mut store = EntityStore::new(StoreConfig {
            default_ttl: Some(Duration::from_secs(5)),
            ..StoreConfig::default()
        });
        store.set(task("t1"));
        store.pin(&EntityKey::task("t1"));
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(store.purge_expired(), 0);
        assert!(store.get(&EntityKey::task("t1")).is_some());

        store.unpin(&EntityKey::task("t1"));
        assert!(store.get(&EntityKey::task("t1")).is_none());
    }

    #[test]
    fn test_list_filters_in_write_order() {
        let mut store = EntityStore::default();
        store.set(notification("n2", false));
        store.set(task("t1"));
        store.set(notification("n1", true));

        let ids: Vec<_> = store
            .list(|e| e.kind == EntityKind::Notification)
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, ["n2", "n1"]);
        assert_eq!(store.list(Entity::is_unread).len(), 1);
    }
}

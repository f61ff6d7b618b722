//! Entity model shared by the store, the reconciler and the wire layer.
//!
//! Entities are kept schema-light: identity, kind and version are typed,
//! everything else lives in a JSON field map so new server-side fields
//! survive a round trip through the client untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Opaque entity identifier assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The record families tracked client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Project,
    Notification,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Task, EntityKind::Project, EntityKind::Notification];

    /// Singular name, used as the event-name prefix (`task:updated`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Project => "project",
            EntityKind::Notification => "notification",
        }
    }

    /// REST collection segment (`/tasks/{id}`).
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Project => "projects",
            EntityKind::Notification => "notifications",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "task" => Some(EntityKind::Task),
            "project" => Some(EntityKind::Project),
            "notification" => Some(EntityKind::Notification),
            _ => None,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            EntityKind::Task => 0,
            EntityKind::Project => 1,
            EntityKind::Notification => 2,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache key: ids are only unique within a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn task(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::Task, id)
    }

    pub fn project(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::Project, id)
    }

    pub fn notification(id: impl Into<EntityId>) -> Self {
        Self::new(EntityKind::Notification, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Identifier of one optimistic edit, echoed back by the server as `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditId(Uuid);

impl EditId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EditId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("entity payload is not a JSON object")]
    NotAnObject,
    #[error("entity payload has no usable `id` field")]
    MissingId,
}

/// Payload keys that are lifted out of the field map.
const RESERVED_KEYS: [&str; 3] = ["id", "version", "origin"];

/// A task, project or notification as last seen by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Server-maintained revision marker. Informational only: ordering is
    /// arrival order, not version order.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            kind,
            version: 0,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id.clone())
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Notifications count as unread until the server says `read: true`.
    pub fn is_unread(&self) -> bool {
        self.kind == EntityKind::Notification
            && self.fields.get("read") != Some(&Value::Bool(true))
    }

    pub fn apply_patch(&mut self, patch: &Patch) {
        for (key, value) in patch.iter() {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Build an entity from a flat server payload (`{id, version?, ...}`).
    ///
    /// Numeric ids are accepted and stringified. `origin` is stripped; read it
    /// with [`origin_of`] before converting.
    pub fn from_payload(kind: EntityKind, payload: &Value) -> Result<Self, EntityError> {
        let object = payload.as_object().ok_or(EntityError::NotAnObject)?;
        let id = match object.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(EntityError::MissingId),
        };
        let version = object.get("version").and_then(Value::as_u64).unwrap_or(0);
        let fields = object
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            id: EntityId(id),
            kind,
            version,
            fields,
        })
    }

    /// Flat payload form, the inverse of [`Entity::from_payload`].
    pub fn to_payload(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".into(), Value::String(self.id.0.clone()));
        object.insert("version".into(), Value::from(self.version));
        Value::Object(object)
    }
}

/// Extract the `origin` edit id a server echo carries, if any.
pub fn origin_of(payload: &Value) -> Option<EditId> {
    payload
        .get("origin")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(EditId)
}

/// A partial field update applied optimistically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when `entity` already carries every patched value.
    pub fn is_reflected_in(&self, entity: &Entity) -> bool {
        self.0.iter().all(|(k, v)| entity.fields.get(k) == Some(v))
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Patch {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

//! Text-frame protocol for the event channel.
//!
//! Wire format (one JSON object per WebSocket text message):
//! ```text
//! {"type":"event","event":"task:updated","payload":{...},"ack":12}   ack optional
//! {"type":"ack","ack":12,"payload":{...}}
//! {"type":"ping","seq":3}
//! {"type":"pong","seq":3}
//! ```
//!
//! Entity events are named `{kind}:{created|updated|deleted}`; the bare
//! `notification` event is the server's "new notification" push. Client
//! edits go out as `{kind}:update` with `{id, origin, ...patch}` and expect
//! an ack of `{"entity": {...}}` or `{"error": {code, message, details}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use taskflow_core::api::{ApiError, ErrorCategory};
use taskflow_core::entity::{origin_of, EditId, Entity, EntityKey, EntityKind, Patch};
use taskflow_core::reconcile::RemoteChange;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    Ack {
        ack: u64,
        #[serde(default)]
        payload: Value,
    },
    Ping {
        seq: u64,
    },
    Pong {
        seq: u64,
    },
}

impl Frame {
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
            ack: None,
        }
    }

    pub fn event_with_ack(event: impl Into<String>, payload: Value, ack: u64) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
            ack: Some(ack),
        }
    }

    pub fn ack(ack: u64, payload: Value) -> Self {
        Frame::Ack { ack, payload }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("malformed {event} payload: {reason}")]
    MalformedPayload { event: String, reason: String },
}

/// What an inbound entity event does to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Upsert,
    Delete,
}

/// Every inbound event name for `kind`.
pub fn inbound_events(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Task => &["task:created", "task:updated", "task:deleted"],
        EntityKind::Project => &["project:created", "project:updated", "project:deleted"],
        EntityKind::Notification => &[
            "notification",
            "notification:created",
            "notification:updated",
            "notification:deleted",
        ],
    }
}

/// Map an inbound event name to its entity kind and action.
pub fn classify(event: &str) -> Option<(EntityKind, EventAction)> {
    let (kind, verb) = match event.split_once(':') {
        Some((kind, verb)) => (kind, Some(verb)),
        None => (event, None),
    };
    let kind = EntityKind::parse(kind)?;
    let action = match verb {
        None if kind == EntityKind::Notification => EventAction::Upsert,
        Some("created") | Some("updated") => EventAction::Upsert,
        Some("deleted") => EventAction::Delete,
        _ => return None,
    };
    Some((kind, action))
}

/// Outbound edit event name (`task:update`).
pub fn update_event(kind: EntityKind) -> String {
    format!("{}:update", kind.as_str())
}

/// Inbound broadcast name for an applied edit (`task:updated`).
pub fn updated_event(kind: EntityKind) -> String {
    format!("{}:updated", kind.as_str())
}

/// Turn an inbound entity event into a reconciler change.
pub fn remote_change(event: &str, payload: &Value) -> Result<RemoteChange, ProtocolError> {
    let malformed = |reason: String| ProtocolError::MalformedPayload {
        event: event.to_string(),
        reason,
    };
    let (kind, action) = classify(event).ok_or_else(|| malformed("not an entity event".into()))?;
    let origin = origin_of(payload);
    let entity = Entity::from_payload(kind, payload).map_err(|e| malformed(e.to_string()))?;
    Ok(match action {
        EventAction::Upsert => RemoteChange::Upsert { entity, origin },
        EventAction::Delete => RemoteChange::Delete {
            key: entity.key(),
            origin,
        },
    })
}

/// Payload of an outbound `{kind}:update` event.
pub fn edit_payload(key: &EntityKey, edit_id: EditId, patch: &Patch) -> Value {
    let mut object: Map<String, Value> = patch.clone().into_map();
    object.insert("id".into(), Value::String(key.id.to_string()));
    object.insert("origin".into(), Value::String(edit_id.to_string()));
    Value::Object(object)
}

/// Error carried by an ack, if the server refused the event.
///
/// An `error` that is not the standard shape still counts as a refusal; it
/// is reported as an `internal_error` with the raw value as details.
pub fn ack_error(payload: &Value) -> Option<ApiError> {
    let error = payload.get("error").filter(|error| !error.is_null())?;
    ApiError::from_body(payload).or_else(|| {
        let message = match error {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Some(ApiError {
            details: Some(error.clone()),
            ..ApiError::new(ErrorCategory::Internal.as_str(), message)
        })
    })
}

/// Entity carried by an edit ack, if any.
pub fn ack_entity(kind: EntityKind, payload: &Value) -> Option<Entity> {
    payload
        .get("entity")
        .and_then(|value| Entity::from_payload(kind, value).ok())
}

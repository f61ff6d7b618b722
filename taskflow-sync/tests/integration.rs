//! Integration tests for the end-to-end WebSocket sync path.
//!
//! These tests start a real relay and connect real sessions,
//! verifying the full pipeline from emit to reconciled cache.

use std::sync::{Arc, Mutex};

use serde_json::json;
use taskflow_core::{EntityKind, Patch};
use taskflow_sync::connector::{ChannelState, Connector, ConnectorConfig, EmitError, EmitOptions, LifecycleEvent};
use taskflow_sync::relay::{RelayConfig, RelayServer};
use taskflow_sync::session::{SessionConfig, SyncSession};
use taskflow_sync::transport::TransportError;
use tokio::time::{sleep, timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return it with its URL.
async fn start_test_relay(ack_emits: bool) -> (RelayServer, String) {
    let port = free_port().await;
    let relay = RelayServer::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        ack_emits,
    });
    let server = relay.clone();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the relay time to bind
    sleep(Duration::from_millis(50)).await;
    (relay, format!("ws://127.0.0.1:{port}"))
}

fn fast_config() -> ConnectorConfig {
    ConnectorConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        emit_base_delay: Duration::from_millis(20),
        ..ConnectorConfig::default()
    }
}

fn session(url: &str) -> SyncSession {
    let config = SessionConfig {
        edit_options: EmitOptions {
            timeout: Duration::from_millis(300),
            retries: 1,
        },
        ..SessionConfig::default()
    };
    SyncSession::new(Connector::websocket(url, fast_config()), config)
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(check: impl Fn() -> bool) -> bool {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (_relay, url) = start_test_relay(true).await;

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_connector_connects_and_reports_lifecycle() {
    let (relay, url) = start_test_relay(true).await;
    let connector = Connector::websocket(&url, fast_config());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _sub = connector.on_lifecycle("connect", move |event| sink.lock().unwrap().push(event.clone()));

    connector.connect().await.unwrap();
    assert_eq!(connector.state(), ChannelState::Connected);
    assert_eq!(events.lock().unwrap().as_slice(), [LifecycleEvent::Connected]);
    assert!(eventually(|| relay.stats().active_connections == 1).await);

    connector.disconnect();
    assert_eq!(connector.state(), ChannelState::Disconnected);
    assert!(eventually(|| relay.stats().active_connections == 0).await);
}

#[tokio::test]
async fn test_edit_is_confirmed_and_seen_by_other_session() {
    let (_relay, url) = start_test_relay(true).await;
    let alice = session(&url);
    let bob = session(&url);
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    let confirmed = alice
        .edit(EntityKind::Task, "t1", Patch::new().set("title", "Ship it"))
        .await
        .unwrap();
    assert_eq!(confirmed.version, 1);
    assert_eq!(alice.pending_count(), 0);

    assert!(
        eventually(|| {
            bob.get(EntityKind::Task, "t1")
                .and_then(|task| task.field("title").cloned())
                == Some(json!("Ship it"))
        })
        .await,
        "Bob should see Alice's edit"
    );
}

#[tokio::test]
async fn test_published_notification_raises_unread_count() {
    let (relay, url) = start_test_relay(true).await;
    let session = session(&url);
    session.start().await.unwrap();
    assert!(eventually(|| relay.stats().active_connections == 1).await);

    relay
        .publish("notification", json!({"id": "n1", "read": false, "title": "Assigned"}))
        .await;
    assert!(eventually(|| session.unread_count() == 1).await);

    session.mark_as_read("n1").await.unwrap();
    assert_eq!(session.unread_count(), 0);
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_silent_relay_times_out_emit() {
    let (_relay, url) = start_test_relay(false).await;
    let connector = Connector::websocket(&url, fast_config());
    connector.connect().await.unwrap();

    let options = EmitOptions {
        timeout: Duration::from_millis(100),
        retries: 2,
    };
    let err = connector
        .emit("task:update", json!({"id": "t1", "done": true}), options)
        .await
        .unwrap_err();
    assert_eq!(err, EmitError::Timeout { attempts: 3 });

    // Without acks the relay's broadcast echo still confirms the edit
    let session = session(&url);
    session.start().await.unwrap();
    let confirmed = session
        .edit(EntityKind::Task, "t9", Patch::new().set("done", true))
        .await
        .unwrap();
    assert_eq!(confirmed.field("done"), Some(&json!(true)));
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_unreachable_relay_exhausts_attempts() {
    let port = free_port().await;
    let connector = Connector::websocket(format!("ws://127.0.0.1:{port}"), fast_config());

    let err = connector.connect().await.unwrap_err();
    assert_eq!(err, TransportError::RetriesExhausted { attempts: 3 });
    assert_eq!(connector.state(), ChannelState::Disconnected);
}

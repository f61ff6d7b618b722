//! taskflow-watch: command-line watcher for the taskflow event channel.
//!
//! `watch` connects a sync session to a relay, logs every entity event and
//! keeps a one-line status (link health, unread count) up to date. Commands
//! are read from stdin:
//!
//! - `r`: drop the channel and connect again
//! - `read <id>` / `read all`: mark notifications as read
//! - `q`: quit
//!
//! `relay` runs the development relay server.

mod status;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use taskflow_core::EntityKind;
use taskflow_sync::connector::{Connector, ConnectorConfig, LifecycleEvent};
use taskflow_sync::protocol::inbound_events;
use taskflow_sync::relay::{RelayConfig, RelayServer};
use taskflow_sync::router::Subscription;
use taskflow_sync::session::{SessionConfig, SyncSession};

use status::StatusLine;

#[derive(Parser)]
#[command(name = "taskflow-watch")]
#[command(about = "Watch the taskflow real-time event channel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a relay and follow entity events
    Watch {
        /// WebSocket URL of the relay
        #[arg(long, env = "TASKFLOW_URL", default_value = "ws://127.0.0.1:9090")]
        url: String,

        /// Connection attempts per connect or reconnect cycle
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,

        /// Heartbeat ping period in seconds
        #[arg(long, default_value_t = 25)]
        heartbeat_secs: u64,
    },
    /// Run the development relay
    Relay {
        /// Address to bind to
        #[arg(long, env = "TASKFLOW_BIND", default_value = "127.0.0.1:9090")]
        bind: String,

        /// Never ack client emits (exercises client timeouts)
        #[arg(long)]
        no_ack: bool,
    },
}

type SharedStatus = Arc<Mutex<StatusLine>>;

fn show(status: &StatusLine) {
    println!("{}", status.render());
}

/// Register lifecycle and event logging. `disconnect()` drops every
/// listener, so this runs again after each manual reconnect.
fn attach(connector: &Connector, status: &SharedStatus) -> Vec<Subscription> {
    let mut subs = Vec::new();
    for name in LifecycleEvent::NAMES {
        let status = status.clone();
        subs.push(connector.on_lifecycle(name, move |event| {
            let mut status = status.lock().unwrap_or_else(PoisonError::into_inner);
            if status.apply(event) {
                show(&status);
            }
        }));
    }
    for kind in EntityKind::ALL {
        for &event in inbound_events(kind) {
            subs.push(connector.on(event, move |payload| info!("{event} {payload}")));
        }
    }
    subs
}

async fn watch(url: String, max_attempts: u32, heartbeat_secs: u64) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConnectorConfig {
        max_attempts,
        heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
        ..ConnectorConfig::default()
    };
    let connector = Connector::websocket(url.as_str(), config);
    let session = Arc::new(SyncSession::new(connector.clone(), SessionConfig::default()));
    let status: SharedStatus = Arc::new(Mutex::new(StatusLine::new()));

    // Keep the unread count on the status line in step with the cache
    let mut changes = session.subscribe_changes();
    let unread_task = {
        let session = session.clone();
        let status = status.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        let unread = session.unread_count();
                        let mut status = status.lock().unwrap_or_else(PoisonError::into_inner);
                        if status.set_unread(unread) {
                            show(&status);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    info!("Watching {url}");
    let mut subs = attach(&connector, &status);
    if let Err(e) = session.start().await {
        error!("Could not connect to {url}: {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let mut words = line.split_whitespace();
                match (words.next(), words.next()) {
                    (Some("q"), _) => break,
                    (Some("r"), _) => {
                        session.stop();
                        subs = attach(&connector, &status);
                        if let Err(e) = session.start().await {
                            error!("Reconnect failed: {e}");
                        }
                    }
                    (Some("read"), Some("all")) => {
                        let results = session.mark_all_read().await;
                        let failed = results.iter().filter(|r| r.is_err()).count();
                        info!("Marked {} notifications read ({failed} failed)", results.len() - failed);
                    }
                    (Some("read"), Some(id)) => match session.mark_as_read(id).await {
                        Ok(_) => info!("Marked {id} read"),
                        Err(e) => warn!("Could not mark {id} read: {e}"),
                    },
                    (Some(other), _) => warn!("Unknown command {other:?} (r, read <id>, read all, q)"),
                    (None, _) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop();
    unread_task.abort();
    drop(subs);
    info!("Watcher stopped");
    Ok(())
}

async fn relay(bind: String, no_ack: bool) -> Result<(), Box<dyn std::error::Error>> {
    let relay = RelayServer::new(RelayConfig {
        bind_addr: bind,
        ack_emits: !no_ack,
        ..RelayConfig::default()
    });

    tokio::select! {
        result = relay.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = relay.stats();
            info!(
                "Relay stopped: {} connections, {} frames received, {} edits applied",
                stats.total_connections, stats.frames_received, stats.edits_applied
            );
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Watch {
            url,
            max_attempts,
            heartbeat_secs,
        } => watch(url, max_attempts, heartbeat_secs).await,
        Command::Relay { bind, no_ack } => relay(bind, no_ack).await,
    }
}

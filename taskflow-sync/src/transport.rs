//! The duplex channel primitive under the connector.
//!
//! A [`Transport`] knows how to open one [`Link`]: a pair of frame channels
//! backed by some physical connection. It does no retrying, no heartbeat and
//! no ack bookkeeping; that policy lives in [`crate::connector`].
//!
//! ```text
//!            Link.outgoing ──► writer task ──► ws sink
//!  Connector                                          ╲  server
//!            Link.incoming ◄── reader task ◄── ws stream
//! ```
//!
//! The link is dead once `incoming` yields `None`. Dropping both halves tears
//! the physical connection down.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Frame, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("heartbeat expired")]
    HeartbeatExpired,
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("connect cancelled by disconnect")]
    Cancelled,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One open connection, seen as frame channels.
pub struct Link {
    pub outgoing: mpsc::Sender<Frame>,
    pub incoming: mpsc::Receiver<Frame>,
}

pub trait Transport: Send + Sync + 'static {
    /// Open a fresh link. Each call is one connection attempt.
    fn open(&self) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    buffer: usize,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            buffer: 256,
        }
    }

    /// Frames buffered per direction before senders wait.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn open(&self) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = self.url.clone();
        let buffer = self.buffer;
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<Frame>(buffer);
            let (in_tx, in_rx) = mpsc::channel::<Frame>(buffer);

            // Writer task: forward outgoing frames to the socket
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if ws_writer.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_writer.close().await;
            });

            // Reader task: decode socket messages into incoming frames
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                            Ok(frame) => {
                                if in_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("ignoring malformed frame: {e}"),
                        },
                        Ok(Message::Close(_)) | Err(_) => break,
                        // Binary frames are not part of the protocol; ws-level
                        // ping/pong is answered by tungstenite itself.
                        _ => {}
                    }
                }
                log::debug!("websocket reader finished");
            });

            log::info!("websocket connected to {url}");
            Ok(Link {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
        .boxed()
    }
}

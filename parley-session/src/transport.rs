//! Outbound audio and inbound results over WebSocket
//!
//! [`WsTransport`] owns a background task that keeps one connection to the
//! backend open, reconnecting with backoff. Results from every connection
//! feed a single channel so the session never notices a reconnect.

use async_trait::async_trait;
use parley_common::wire::{ClientFrame, ServerFrame};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// First reconnect delay
const BASE_RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Reconnect delay ceiling
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Results buffered before the reader waits on the session
pub const RESULT_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected to backend")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Hands submissions to the backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a frame for delivery. Success means the backend connection
    /// accepted it, not that a result will follow.
    async fn submit(&self, frame: ClientFrame) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

pub struct WsTransport {
    status: Arc<Mutex<ConnectionStatus>>,
    outbound: mpsc::UnboundedSender<String>,
}

impl WsTransport {
    /// Start the connection task for `url` (e.g. `ws://localhost:8000/ws`)
    ///
    /// Returns immediately; the receiver yields results from the backend
    /// for as long as the transport lives. Dropping the transport closes
    /// the connection.
    pub fn connect(url: impl Into<String>) -> (Self, mpsc::Receiver<ServerFrame>) {
        let status = Arc::new(Mutex::new(ConnectionStatus::Connecting));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::channel(RESULT_BUFFER);

        tokio::spawn(connection_loop(
            url.into(),
            status.clone(),
            outbound_rx,
            results_tx,
        ));

        (Self { status, outbound }, results_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionStatus::Disconnected)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn submit(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        let json = serde_json::to_string(&frame)?;
        self.outbound.send(json).map_err(|_| TransportError::Closed)
    }
}

fn set_status(status: &Mutex<ConnectionStatus>, value: ConnectionStatus) {
    if let Ok(mut s) = status.lock() {
        *s = value;
    }
}

async fn connection_loop(
    url: String,
    status: Arc<Mutex<ConnectionStatus>>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    results_tx: mpsc::Sender<ServerFrame>,
) {
    let mut attempt: u32 = 0;

    loop {
        match try_connect(&url, &status, &mut outbound_rx, &results_tx).await {
            Ok(()) => {
                info!("Backend connection closed");
                set_status(&status, ConnectionStatus::Disconnected);
                break;
            }
            Err(e) => {
                attempt += 1;
                warn!("Backend connection failed (attempt {}): {}", attempt, e);
                set_status(&status, ConnectionStatus::Reconnecting { attempt });

                let delay = BASE_RECONNECT_DELAY
                    .saturating_mul(2u32.saturating_pow(attempt.min(6)))
                    .min(MAX_RECONNECT_DELAY);
                tokio::time::sleep(delay).await;

                if outbound_rx.is_closed() || results_tx.is_closed() {
                    set_status(&status, ConnectionStatus::Disconnected);
                    break;
                }
            }
        }
    }
}

/// One connection. `Ok` on a local shutdown, `Err` on anything that
/// warrants a reconnect.
async fn try_connect(
    url: &str,
    status: &Mutex<ConnectionStatus>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    results_tx: &mpsc::Sender<ServerFrame>,
) -> Result<(), String> {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| format!("connect: {}", e))?;
    let (mut write, mut read) = ws_stream.split();

    set_status(status, ConnectionStatus::Connected);
    info!("Connected to backend at {}", url);

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            debug!(handle = %frame.handle(), frame_type = frame.frame_type(), "Result received");
                            if results_tx.send(frame).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("Ignoring unreadable frame from backend: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err("connection closed by server".into());
                    }
                    Some(Err(e)) => return Err(format!("read error: {}", e)),
                    _ => {}
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(json) = outbound else {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    return Err(format!("send error: {}", e));
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    return Err(format!("ping error: {}", e));
                }
            }
        }
    }
}
